//! Low-level LDAP channel operations

use std::{io, net::ToSocketAddrs, time::Duration};

use futures::{
    channel::{
        mpsc::{self, Receiver, Sender},
        oneshot,
    },
    future,
    sink::SinkExt,
    StreamExt, TryStreamExt,
};
use log::debug;
use tokio::net::TcpStream;
#[cfg(tls)]
use tokio::io::{AsyncRead, AsyncWrite};
#[cfg(tls)]
use tokio_native_tls::TlsStream;

use crate::{
    codec::LdapCodec,
    error::Error,
    framing::RawMessage,
    model::OutboundMessage,
    options::{TlsKind, TlsOptions},
};
#[cfg(tls)]
use crate::{
    framing::OP_EXTENDED_RESPONSE,
    model::{Request, Response},
    oid::STARTTLS_OID,
    secure::RewindStream,
};

const CHANNEL_SIZE: usize = 1024;

pub(crate) type MessageSender = Sender<OutboundMessage>;
pub(crate) type MessageReceiver = Receiver<RawMessage>;
/// Dropping or firing this ends the channel task and closes the socket
pub(crate) type ChannelCloser = oneshot::Sender<()>;

fn io_error<E>(e: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// LDAP channel errors
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error(transparent)]
    ConnectTimeout(#[from] tokio::time::error::Elapsed),
    #[cfg(tls)]
    #[error(transparent)]
    Tls(#[from] native_tls::Error),
    #[error("STARTTLS failed")]
    StartTlsFailed,
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// LDAP TCP channel connector
pub struct LdapChannel {
    address: String,
    port: u16,
}

impl LdapChannel {
    /// Create a client-side channel with a given server address and port
    pub fn for_client<S>(address: S, port: u16) -> Self
    where
        S: AsRef<str>,
    {
        LdapChannel {
            address: address.as_ref().to_owned(),
            port,
        }
    }

    /// Connect to a server
    /// Returns sender and receiver endpoints plus a handle that tears the
    /// channel down when fired or dropped
    pub async fn connect(
        self,
        tls_options: TlsOptions,
        connect_timeout: Duration,
    ) -> ChannelResult<(MessageSender, MessageReceiver, ChannelCloser)> {
        let mut addrs = (self.address.as_ref(), self.port).to_socket_addrs()?;
        let address = addrs.next().ok_or_else(|| io_error("Address resolution error"))?;

        // TCP connect with a timeout
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&address)).await??;

        debug!("Connection established to {}", address);

        match tls_options.kind {
            TlsKind::Plain => self.make_channel(stream),
            #[cfg(tls)]
            TlsKind::Tls => self.make_channel(self.tls_connect(tls_options, stream).await?),
            #[cfg(tls)]
            TlsKind::StartTls => self.make_channel(self.starttls_connect(tls_options, stream).await?),
        }
    }

    #[cfg(tls)]
    async fn starttls_connect<S>(
        &self,
        tls_options: TlsOptions,
        stream: S,
    ) -> ChannelResult<TlsStream<RewindStream<S>>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        debug!("Starting STARTTLS negotiation");
        let mut framed = tokio_util::codec::Framed::new(stream, LdapCodec::default());
        let request = Request::Extended {
            name: STARTTLS_OID.to_owned(),
            value: None,
        };
        framed
            .send(OutboundMessage::request(1, request))
            .await
            .map_err(|_| ChannelError::StartTlsFailed)?;
        if let Some(Ok(item)) = framed.next().await {
            if item.message_id == 1 && item.op_tag == OP_EXTENDED_RESPONSE {
                if let Ok((Response::Extended(resp), _)) = Response::decode(item) {
                    if resp.result.is_success() {
                        debug!("STARTTLS succeeded");
                        // bytes the codec read past the response belong to TLS
                        let parts = framed.into_parts();
                        let stream = RewindStream::new(parts.read_buf.freeze(), parts.io);
                        return self.tls_connect(tls_options, stream).await;
                    }
                }
            }
        }
        debug!("STARTTLS failed");
        Err(ChannelError::StartTlsFailed)
    }

    #[cfg(tls)]
    async fn tls_connect<S>(&self, tls_options: TlsOptions, stream: S) -> ChannelResult<TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        debug!("Performing TLS handshake with {}", self.address);
        let mut tls_builder = native_tls::TlsConnector::builder();
        for cert in tls_options.ca_certs {
            tls_builder.add_root_certificate(cert);
        }
        tls_builder.danger_accept_invalid_hostnames(!tls_options.verify_hostname);
        tls_builder.danger_accept_invalid_certs(!tls_options.verify_certs);

        if let Some(identity) = tls_options.identity {
            tls_builder.identity(identity);
        }

        let connector = tls_builder.build()?;

        let tokio_connector = tokio_native_tls::TlsConnector::from(connector);

        let domain = tls_options.domain_name.as_deref().unwrap_or(&self.address);
        let stream = tokio_connector
            .connect(domain, stream)
            .await
            .map_err(ChannelError::Tls)?;

        debug!("Handshake completed with {}", self.address);

        Ok(stream)
    }

    fn make_channel<S>(&self, stream: S) -> ChannelResult<(MessageSender, MessageReceiver, ChannelCloser)>
    where
        S: crate::secure::Transport + 'static,
    {
        // construct framed instance based on LdapCodec
        let framed = tokio_util::codec::Framed::new(stream, LdapCodec::default());

        // The 'in' channel:
        // Messages received from the socket will be forwarded to tx_in
        // and received by the external client via rx_in endpoint
        let (tx_in, rx_in) = mpsc::channel(CHANNEL_SIZE);

        // The 'out' channel:
        // Messages sent to tx_out by external clients will be picked up on rx_out endpoint
        // and forwarded to socket
        let (tx_out, rx_out) = mpsc::channel(CHANNEL_SIZE);

        // fired by the owner to invalidate the connection early
        let (closer, close_rx) = oneshot::channel::<()>();

        let channel = async move {
            // sink is the sending part, stream is the receiving part
            let (mut sink, stream) = framed.split();

            // we receive outbound messages from the clients and convert to stream chunks
            let mut rx = rx_out.map(Ok::<_, Error>);

            // app -> socket
            let to_wire = sink.send_all(&mut rx);

            // convert incoming channel errors into io::Error
            let mut tx = tx_in.sink_map_err(io_error);

            // app <- socket
            let from_wire = stream.map_err(io_error).forward(&mut tx);

            // await for either of futures: terminating one side will drop the other
            let traffic = future::select(to_wire, from_wire);
            let _ = future::select(traffic, close_rx).await;
            debug!("Channel task finished");
        };

        // spawn in the background
        tokio::spawn(channel);

        // we return (tx_out, rx_in) pair so that the consumer can send and receive messages
        Ok((tx_out, rx_in, closer))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use bytes::Bytes;
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::framing::{OP_BIND_REQUEST, OP_BIND_RESPONSE};
    use crate::model::{BindResult, LdapResult, Request, Response};

    fn bind_msg(id: i32) -> OutboundMessage {
        OutboundMessage::request(
            id,
            Request::SimpleBind {
                version: 3,
                name: "cn=admin".into(),
                password: Bytes::from_static(b"secret"),
            },
        )
    }

    async fn start_server(num_msgs: usize) -> u16 {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = tcp.local_addr().unwrap().port();

        tokio::spawn(async move {
            if let Ok((stream, _)) = tcp.accept().await {
                let mut framed = Framed::new(stream, LdapCodec::default());
                for _ in 0..num_msgs {
                    let msg = framed.next().await.unwrap().unwrap();
                    assert_eq!(msg.op_tag, OP_BIND_REQUEST);
                    let response = Response::Bind(BindResult {
                        result: LdapResult::success(),
                        server_sasl_credentials: None,
                    });
                    framed
                        .send(OutboundMessage::response(msg.message_id, msg.op_tag, response))
                        .await
                        .unwrap();
                }
            }
        });

        port
    }

    #[tokio::test]
    async fn test_connection_success() {
        let port = start_server(2).await;

        let counter = Arc::new(AtomicUsize::new(0));
        let flag = counter.clone();

        let (mut sender, mut receiver, _closer) = LdapChannel::for_client("127.0.0.1", port)
            .connect(TlsOptions::plain(), Duration::from_secs(10))
            .await
            .unwrap();

        sender.send(bind_msg(1)).await.unwrap();
        sender.send(bind_msg(2)).await.unwrap();

        while let Some(m) = receiver.next().await {
            assert_eq!(m.op_tag, OP_BIND_RESPONSE);
            let count = flag.fetch_add(1, Ordering::SeqCst) + 1;
            assert_eq!(m.message_id, count as i32);
            if count == 2 {
                break;
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connection_fail() {
        let res = LdapChannel::for_client("127.0.0.1", 32222)
            .connect(TlsOptions::plain(), Duration::from_secs(10))
            .await;

        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_closer_tears_channel_down() {
        let port = start_server(0).await;

        let (_sender, mut receiver, closer) = LdapChannel::for_client("127.0.0.1", port)
            .connect(TlsOptions::plain(), Duration::from_secs(10))
            .await
            .unwrap();

        let _ = closer.send(());
        assert!(receiver.next().await.is_none());
    }
}
