//! Security layer transports
//!
//! TLS and SASL protection are modelled as stream wrappers installed between
//! the socket and the message codec. Both sides of an installation see the
//! same picture: bytes already pulled off the socket but not yet consumed are
//! replayed through a [`RewindStream`] so nothing is lost across the swap.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Any transport a connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxTransport = Box<dyn Transport>;

/// Byte-protection layer negotiated by a SASL mechanism.
///
/// Implementations wrap outbound plaintext into protected blobs and unwrap
/// inbound blobs back into plaintext. Mechanism negotiation itself happens at
/// the LDAP layer and is not part of this trait.
pub trait SaslSession: Send {
    /// Protects one outbound buffer as a single blob.
    fn wrap(&mut self, plaintext: &[u8]) -> io::Result<Vec<u8>>;

    /// Removes protection from one complete inbound blob.
    fn unwrap(&mut self, wrapped: &[u8]) -> io::Result<Vec<u8>>;
}

const LENGTH_PREFIX: usize = 4;
const DEFAULT_MAX_WRAPPED: usize = 1024 * 1024;

/// Transport applying a SASL security layer.
///
/// The wire format is the SASL one: each protected blob travels behind a
/// four-byte big-endian length prefix. A blob is only unwrapped once complete,
/// and each plaintext write is wrapped as a single blob.
pub struct SaslStream<S> {
    inner: S,
    session: Box<dyn SaslSession>,
    max_wrapped: usize,
    recv_raw: BytesMut,
    recv_plain: BytesMut,
    send_buf: BytesMut,
}

impl<S> SaslStream<S> {
    pub fn new(inner: S, session: Box<dyn SaslSession>) -> Self {
        SaslStream::with_max_wrapped(inner, session, DEFAULT_MAX_WRAPPED)
    }

    /// Like [`new`](Self::new) with an explicit ceiling on inbound blob size.
    pub fn with_max_wrapped(inner: S, session: Box<dyn SaslSession>, max_wrapped: usize) -> Self {
        SaslStream {
            inner,
            session,
            max_wrapped,
            recv_raw: BytesMut::new(),
            recv_plain: BytesMut::new(),
            send_buf: BytesMut::new(),
        }
    }

    fn take_blob(&mut self) -> io::Result<Option<Bytes>> {
        if self.recv_raw.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let b = &self.recv_raw;
        let len = u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize;
        if len > self.max_wrapped {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "wrapped blob of {} bytes exceeds the limit of {} bytes",
                    len, self.max_wrapped
                ),
            ));
        }
        if self.recv_raw.len() < LENGTH_PREFIX + len {
            return Ok(None);
        }
        self.recv_raw.advance(LENGTH_PREFIX);
        Ok(Some(self.recv_raw.split_to(len).freeze()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> SaslStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.send_buf.is_empty() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.send_buf) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => {
                    self.send_buf.advance(n);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for SaslStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.recv_plain.is_empty() {
                let n = this.recv_plain.len().min(buf.remaining());
                buf.put_slice(&this.recv_plain.split_to(n));
                return Poll::Ready(Ok(()));
            }
            while let Some(blob) = this.take_blob()? {
                let plain = this.session.unwrap(&blob)?;
                this.recv_plain.extend_from_slice(&plain);
            }
            if !this.recv_plain.is_empty() {
                continue;
            }
            let mut tmp = [0u8; 4096];
            let mut tmp_buf = ReadBuf::new(&mut tmp);
            match Pin::new(&mut this.inner).poll_read(cx, &mut tmp_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = tmp_buf.filled();
                    if filled.is_empty() {
                        // clean EOF only between blobs
                        if this.recv_raw.is_empty() {
                            return Poll::Ready(Ok(()));
                        }
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed inside a wrapped blob",
                        )));
                    }
                    this.recv_raw.extend_from_slice(filled);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for SaslStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        // at most one wrapped blob is held back, finish it before the next
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let wrapped = this.session.wrap(buf)?;
        this.send_buf.put_u32(wrapped.len() as u32);
        this.send_buf.extend_from_slice(&wrapped);
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            other => other,
        }
    }
}

/// Transport replaying buffered bytes before reading from the wrapped stream.
///
/// Installing a security layer happens after the codec may already have
/// pulled bytes past the message that triggered the installation. Those
/// bytes belong to the new layer and are served first.
pub struct RewindStream<S> {
    leftover: Bytes,
    inner: S,
}

impl<S> RewindStream<S> {
    pub fn new(leftover: impl Into<Bytes>, inner: S) -> Self {
        RewindStream {
            leftover: leftover.into(),
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RewindStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.leftover.is_empty() {
            let n = this.leftover.len().min(buf.remaining());
            buf.put_slice(&this.leftover.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RewindStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Stacks a SASL security layer onto a transport, replaying `leftover` bytes
/// already read from it.
pub fn wrap_sasl(
    io: BoxTransport,
    leftover: impl Into<Bytes>,
    session: Box<dyn SaslSession>,
) -> BoxTransport {
    Box::new(SaslStream::new(RewindStream::new(leftover, io), session))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    struct XorSession(u8);

    impl SaslSession for XorSession {
        fn wrap(&mut self, plaintext: &[u8]) -> io::Result<Vec<u8>> {
            Ok(plaintext.iter().map(|b| b ^ self.0).collect())
        }

        fn unwrap(&mut self, wrapped: &[u8]) -> io::Result<Vec<u8>> {
            Ok(wrapped.iter().map(|b| b ^ self.0).collect())
        }
    }

    fn xor(key: u8) -> Box<dyn SaslSession> {
        Box::new(XorSession(key))
    }

    #[tokio::test]
    async fn wrapped_round_trip() {
        let (a, b) = duplex(64 * 1024);
        let mut client = SaslStream::new(a, xor(0x5A));
        let mut server = SaslStream::new(b, xor(0x5A));

        client.write_all(b"hello over sasl").await.unwrap();
        client.flush().await.unwrap();

        let mut read = vec![0u8; 15];
        server.read_exact(&mut read).await.unwrap();
        assert_eq!(&read, b"hello over sasl");

        server.write_all(b"and back").await.unwrap();
        server.flush().await.unwrap();
        let mut read = vec![0u8; 8];
        client.read_exact(&mut read).await.unwrap();
        assert_eq!(&read, b"and back");
    }

    #[tokio::test]
    async fn each_write_is_one_blob() {
        let (a, mut b) = duplex(64 * 1024);
        let mut client = SaslStream::new(a, xor(0x00));

        client.write_all(b"first").await.unwrap();
        client.write_all(b"second!").await.unwrap();
        client.flush().await.unwrap();

        let mut raw = vec![0u8; 4 + 5 + 4 + 7];
        b.read_exact(&mut raw).await.unwrap();
        assert_eq!(&raw[..4], &5u32.to_be_bytes());
        assert_eq!(&raw[4..9], b"first");
        assert_eq!(&raw[9..13], &7u32.to_be_bytes());
        assert_eq!(&raw[13..], b"second!");
    }

    #[tokio::test]
    async fn partial_blob_is_not_unwrapped() {
        let (mut a, b) = duplex(64 * 1024);
        let mut server = SaslStream::new(b, xor(0x00));

        // length prefix plus half the blob only
        a.write_all(&8u32.to_be_bytes()).await.unwrap();
        a.write_all(b"half").await.unwrap();

        let mut read = [0u8; 8];
        let pending = tokio::time::timeout(Duration::from_millis(50), server.read_exact(&mut read)).await;
        assert!(pending.is_err(), "read completed on a partial blob");

        a.write_all(b"done").await.unwrap();
        server.read_exact(&mut read).await.unwrap();
        assert_eq!(&read, b"halfdone");
    }

    #[tokio::test]
    async fn eof_inside_blob_is_an_error() {
        let (mut a, b) = duplex(64 * 1024);
        let mut server = SaslStream::new(b, xor(0x00));

        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"short").await.unwrap();
        drop(a);

        let mut read = Vec::new();
        let err = server.read_to_end(&mut read).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn clean_eof_between_blobs() {
        let (mut a, b) = duplex(64 * 1024);
        let mut server = SaslStream::new(b, xor(0x07));

        let wrapped: Vec<u8> = b"bye".iter().map(|c| c ^ 0x07).collect();
        a.write_all(&3u32.to_be_bytes()).await.unwrap();
        a.write_all(&wrapped).await.unwrap();
        drop(a);

        let mut read = Vec::new();
        server.read_to_end(&mut read).await.unwrap();
        assert_eq!(&read, b"bye");
    }

    #[tokio::test]
    async fn oversized_blob_is_rejected() {
        let (mut a, b) = duplex(64 * 1024);
        let mut server = SaslStream::with_max_wrapped(b, xor(0x00), 16);

        a.write_all(&1024u32.to_be_bytes()).await.unwrap();
        let mut read = [0u8; 1];
        let err = server.read_exact(&mut read).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn rewind_replays_leftover_before_inner() {
        let (mut a, b) = duplex(64 * 1024);
        a.write_all(b" world").await.unwrap();

        let mut rewound = RewindStream::new(&b"hello"[..], b);
        let mut read = vec![0u8; 11];
        rewound.read_exact(&mut read).await.unwrap();
        assert_eq!(&read, b"hello world");
    }

    #[tokio::test]
    async fn rewind_serves_small_reads_from_leftover() {
        let (_a, b) = duplex(64);
        let mut rewound = RewindStream::new(&b"abcd"[..], b);
        let mut one = [0u8; 1];
        for expected in b"abcd" {
            rewound.read_exact(&mut one).await.unwrap();
            assert_eq!(one[0], *expected);
        }
    }

    #[tokio::test]
    async fn sasl_over_rewound_leftover() {
        // a blob already sitting in the read buffer when the layer goes in
        let mut leftover = Vec::new();
        leftover.extend_from_slice(&4u32.to_be_bytes());
        leftover.extend_from_slice(&b"earl".iter().map(|c| c ^ 0x11).collect::<Vec<_>>());

        let (mut a, b) = duplex(64 * 1024);
        let tail: Vec<u8> = b"ylate".iter().map(|c| c ^ 0x11).collect();
        a.write_all(&5u32.to_be_bytes()).await.unwrap();
        a.write_all(&tail).await.unwrap();

        let mut stream = SaslStream::new(RewindStream::new(leftover, b), xor(0x11));
        let mut read = vec![0u8; 9];
        stream.read_exact(&mut read).await.unwrap();
        assert_eq!(&read, b"earlylate");
    }
}
