//! Server-side connection pipeline
//!
//! One task owns each accepted connection. It decodes complete messages off
//! the transport, hands them to a [`RequestHandler`] and writes the responses
//! back in the order each handler stream produces them. Reads are
//! demand-driven twice over: a semaphore bounds how many requests may be in
//! flight at once, and a bind or extended request pauses reading entirely
//! until it is answered, because its response may switch the protocol version
//! or the transport underneath the codec.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering},
        Arc,
    },
};

use futures::{
    channel::{mpsc, oneshot},
    future,
    stream::BoxStream,
    SinkExt, StreamExt,
};
use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, ToSocketAddrs},
    sync::{Notify, OwnedSemaphorePermit, Semaphore},
};
use tokio_util::codec::{Framed, FramedParts};

#[cfg(tls)]
use crate::channel::ChannelError;
#[cfg(tls)]
use crate::secure::RewindStream;
use crate::{
    codec::LdapCodec,
    error::{Error, OperationError},
    framing::{RawMessage, OP_BIND_REQUEST, OP_EXTENDED_REQUEST, OP_UNBIND_REQUEST, TAG_CONTROLS},
    model::{
        BindResult, ExtendedResult, LdapResult, OutboundMessage, Response, ResultCode,
        LDAP_VERSION_2, LDAP_VERSION_3,
    },
    secure::{wrap_sasl, BoxTransport, SaslSession, Transport},
};

const DEFAULT_MAX_ELEMENT_SIZE: usize = 8 * 1024 * 1024;
const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 16;
const DEFAULT_RESPONSE_BUFFER: usize = 64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection pipeline settings
#[derive(Clone)]
pub struct PipelineConfig {
    max_element_size: usize,
    max_concurrent_requests: usize,
    response_buffer: usize,
    allow_ldap_v2: bool,
    #[cfg(tls)]
    tls_acceptor: Option<native_tls::TlsAcceptor>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            max_element_size: DEFAULT_MAX_ELEMENT_SIZE,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            response_buffer: DEFAULT_RESPONSE_BUFFER,
            allow_ldap_v2: true,
            #[cfg(tls)]
            tls_acceptor: None,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Default::default()
    }

    /// Ceiling on a single inbound element, zero for unlimited.
    /// Default is 8 MiB
    pub fn max_element_size(mut self, size: usize) -> Self {
        self.max_element_size = size;
        self
    }

    /// How many requests may be inside the handler at once, default 16
    pub fn max_concurrent_requests(mut self, limit: usize) -> Self {
        self.max_concurrent_requests = limit.max(1);
        self
    }

    /// Queued-response capacity before handler streams are paused, default 64
    pub fn response_buffer(mut self, size: usize) -> Self {
        self.response_buffer = size.max(1);
        self
    }

    /// Whether LDAPv2 binds are accepted, enabled by default
    pub fn allow_ldap_v2(mut self, allow: bool) -> Self {
        self.allow_ldap_v2 = allow;
        self
    }

    /// Acceptor used when a handler requests STARTTLS
    #[cfg(tls)]
    pub fn tls_acceptor(mut self, acceptor: native_tls::TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }
}

/// Failure of a handler response stream
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Reported to the peer as the result of the operation
    #[error("Operation failed: {:?}", .0.result_code)]
    Operation(#[from] OperationError),
    /// Tears the connection down without a response
    #[error(transparent)]
    Fatal(#[from] Error),
}

/// Responses a handler produces for one request.
///
/// The stream ends after the final response. An [`HandlerError::Operation`]
/// failure is turned into the operation-appropriate negative result and also
/// ends the request.
pub type ResponseStream = BoxStream<'static, Result<Response, HandlerError>>;

/// Business side of a server connection.
///
/// The pipeline decodes only the message envelope; the handler receives each
/// request with its body unconsumed and produces the responses for it. Search
/// requests may fan out into many responses, most operations produce exactly
/// one, abandon produces none.
pub trait RequestHandler: Send + Sync + 'static {
    /// Produces the responses for one request.
    ///
    /// Runs on the connection task, so it must return quickly; slow work
    /// belongs inside the returned stream.
    fn handle(&self, conn: &ConnectionHandle, request: RawMessage) -> ResponseStream;

    /// Runs exactly once when the connection goes away.
    fn connection_closed(&self, conn: &ConnectionHandle) {
        let _ = conn;
    }
}

/// Byte transformation waiting to be installed under the codec
enum PendingLayer {
    #[cfg(tls)]
    StartTls(native_tls::TlsAcceptor),
    Sasl(Box<dyn SaslSession>),
}

enum Cmd {
    Respond {
        message_id: i32,
        request_tag: u8,
        response: Response,
        /// Final response of its request
        last: bool,
    },
    Finished {
        message_id: i32,
    },
    Unsolicited(ExtendedResult),
    Fatal {
        message_id: i32,
        error: Error,
    },
}

struct HandleInner {
    id: u64,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    version: AtomicI32,
    closed: AtomicBool,
    close: Notify,
    pending_layer: Mutex<Option<PendingLayer>>,
    cmds: mpsc::Sender<Cmd>,
    #[cfg(tls)]
    tls_acceptor: Option<native_tls::TlsAcceptor>,
}

/// Per-connection context handed to the request handler.
///
/// Cheap to clone; a handler may keep a clone to disconnect or notify the
/// peer later. State behind it is mutated only by the connection task.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    /// Connection identifier, unique within the process
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Protocol version currently in effect for responses.
    ///
    /// A version declared by a bind request takes effect when the bind
    /// response is written, not when the request arrives.
    pub fn ldap_version(&self) -> i32 {
        self.inner.version.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Drops the connection. Responses still queued are not delivered.
    /// Idempotent
    pub fn disconnect(&self) {
        if self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.inner.close.notify_one();
        }
    }

    /// Queues an unsolicited notification, sent with message ID zero.
    ///
    /// LDAPv2 predates unsolicited notifications, so a v2 peer never sees
    /// them.
    pub async fn send_unsolicited(&self, notice: ExtendedResult) -> Result<(), Error> {
        let mut cmds = self.inner.cmds.clone();
        cmds.send(Cmd::Unsolicited(notice)).await?;
        Ok(())
    }

    /// Installs a SASL security layer.
    ///
    /// The layer goes live right after the final response of the request
    /// being handled is written, so that response still reaches the peer in
    /// the clear and everything after it is wrapped.
    pub fn install_sasl(&self, session: Box<dyn SaslSession>) {
        *self.inner.pending_layer.lock() = Some(PendingLayer::Sasl(session));
    }

    /// Switches the connection to TLS.
    ///
    /// Deferred exactly like [`install_sasl`](Self::install_sasl): the
    /// response reporting STARTTLS success is written in plaintext and the
    /// TLS handshake consumes everything after it.
    #[cfg(tls)]
    pub fn request_start_tls(&self) -> Result<(), Error> {
        match &self.inner.tls_acceptor {
            Some(acceptor) => {
                *self.inner.pending_layer.lock() = Some(PendingLayer::StartTls(acceptor.clone()));
                Ok(())
            }
            None => Err(Error::TlsNotConfigured),
        }
    }

    fn set_version(&self, version: i32) {
        self.inner.version.store(version, Ordering::SeqCst);
    }

    fn take_pending_layer(&self) -> Option<PendingLayer> {
        self.inner.pending_layer.lock().take()
    }

    fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    async fn wait_closed(&self) {
        while !self.is_closed() {
            self.inner.close.notified().await;
        }
    }
}

/// Serves one accepted connection until it closes.
///
/// Returns `Ok` for an orderly end: unbind, peer disconnect or a local
/// [`ConnectionHandle::disconnect`]. Framing, codec and transport failures
/// close the connection abruptly and are returned; the peer deliberately
/// receives no response a desynchronized stream could corrupt further.
pub async fn serve_connection<S, H>(
    io: S,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    handler: Arc<H>,
    config: PipelineConfig,
) -> Result<(), Error>
where
    S: Transport + 'static,
    H: RequestHandler,
{
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_requests));
    let (cmd_tx, mut cmd_rx) = mpsc::channel(config.response_buffer);
    let handle = ConnectionHandle {
        inner: Arc::new(HandleInner {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            local_addr,
            version: AtomicI32::new(LDAP_VERSION_3),
            closed: AtomicBool::new(false),
            close: Notify::new(),
            pending_layer: Mutex::new(None),
            cmds: cmd_tx.clone(),
            #[cfg(tls)]
            tls_acceptor: config.tls_acceptor.clone(),
        }),
    };
    let id = handle.id();

    let mut framed = Framed::new(
        Box::new(io) as BoxTransport,
        LdapCodec::new(config.max_element_size),
    );
    // message id of the bind or extended request currently being answered;
    // reads stay paused until it completes so its response can switch the
    // protocol version or the transport with nothing in flight behind it
    let mut serialized: Option<i32> = None;
    let mut pending_version: Option<i32> = None;

    debug!("Connection {} accepted from {}", id, peer_addr);

    let mut exit = Ok(());
    loop {
        tokio::select! {
            biased;

            _ = handle.wait_closed() => {
                debug!("Connection {} closed locally", id);
                break;
            }

            cmd = cmd_rx.next() => {
                let cmd = match cmd {
                    Some(cmd) => cmd,
                    None => break,
                };
                match cmd {
                    Cmd::Respond { message_id, request_tag, response, last } => {
                        let v2 = framed.codec().version() == LDAP_VERSION_2;
                        if v2 && matches!(response, Response::SearchReference(_)) {
                            debug!("Connection {}: dropping search reference for an LDAPv2 peer", id);
                        } else {
                            let out = OutboundMessage::response(message_id, request_tag, response);
                            if let Err(e) = framed.send(out).await {
                                error!("Connection {}: write failed: {}", id, e);
                                exit = Err(e);
                                break;
                            }
                        }
                        if last {
                            if serialized == Some(message_id) {
                                serialized = None;
                            }
                            if request_tag == OP_BIND_REQUEST {
                                if let Some(version) = pending_version.take() {
                                    handle.set_version(version);
                                    framed.codec_mut().set_version(version);
                                    debug!("Connection {} switched to LDAPv{}", id, version);
                                }
                            }
                            if let Some(layer) = handle.take_pending_layer() {
                                framed = match install_layer(framed, layer).await {
                                    Ok(framed) => {
                                        debug!("Connection {}: security layer installed", id);
                                        framed
                                    }
                                    Err(e) => {
                                        error!("Connection {}: security layer failed: {}", id, e);
                                        exit = Err(e);
                                        break;
                                    }
                                };
                            }
                        }
                    }
                    Cmd::Finished { message_id } => {
                        if serialized == Some(message_id) {
                            serialized = None;
                        }
                    }
                    Cmd::Unsolicited(notice) => {
                        if framed.codec().version() == LDAP_VERSION_2 {
                            debug!("Connection {}: dropping unsolicited notification for an LDAPv2 peer", id);
                        } else if let Err(e) = framed.send(OutboundMessage::unsolicited(notice)).await {
                            error!("Connection {}: write failed: {}", id, e);
                            exit = Err(e);
                            break;
                        }
                    }
                    Cmd::Fatal { message_id, error } => {
                        error!("Connection {}: request {} failed fatally: {}", id, message_id, error);
                        exit = Err(error);
                        break;
                    }
                }
            }

            incoming = next_request(semaphore.clone(), &mut framed), if serialized.is_none() => {
                let (permit, frame) = match incoming {
                    Some(incoming) => incoming,
                    None => break,
                };
                match frame {
                    None => {
                        debug!("Connection {} closed by peer", id);
                        break;
                    }
                    Some(Err(e)) => {
                        // the inbound stream is desynchronized, close without
                        // attempting a response
                        error!("Connection {}: {}", id, e);
                        exit = Err(e);
                        break;
                    }
                    Some(Ok(msg)) => {
                        trace!(
                            "Connection {}: request {}, op 0x{:02X}",
                            id,
                            msg.message_id,
                            msg.op_tag
                        );
                        match msg.op_tag {
                            OP_UNBIND_REQUEST => {
                                debug!("Connection {}: unbind", id);
                                break;
                            }
                            OP_BIND_REQUEST => match bind_version(&config, &msg) {
                                Ok(version) => {
                                    pending_version = Some(version);
                                    serialized = Some(msg.message_id);
                                    dispatch(&handler, &handle, msg, &cmd_tx, permit);
                                }
                                Err(diagnostic) => {
                                    warn!("Connection {}: {}", id, diagnostic);
                                    let refusal = protocol_error_bind(msg.message_id, &diagnostic);
                                    if let Err(e) = framed.send(refusal).await {
                                        error!("Connection {}: write failed: {}", id, e);
                                    }
                                    break;
                                }
                            },
                            OP_EXTENDED_REQUEST => {
                                serialized = Some(msg.message_id);
                                dispatch(&handler, &handle, msg, &cmd_tx, permit);
                            }
                            _ => dispatch(&handler, &handle, msg, &cmd_tx, permit),
                        }
                    }
                }
            }
        }
    }

    handle.mark_closed();
    handler.connection_closed(&handle);
    debug!("Connection {} finished", id);
    exit
}

/// Waits for read demand, then for the next complete message. Taking the
/// permit first keeps the socket untouched while the handler is saturated.
async fn next_request(
    semaphore: Arc<Semaphore>,
    framed: &mut Framed<BoxTransport, LdapCodec>,
) -> Option<(OwnedSemaphorePermit, Option<Result<RawMessage, Error>>)> {
    let permit = semaphore.acquire_owned().await.ok()?;
    Some((permit, framed.next().await))
}

fn dispatch<H>(
    handler: &Arc<H>,
    handle: &ConnectionHandle,
    request: RawMessage,
    cmds: &mpsc::Sender<Cmd>,
    permit: OwnedSemaphorePermit,
) where
    H: RequestHandler,
{
    let message_id = request.message_id;
    let request_tag = request.op_tag;
    let stream = handler.handle(handle, request);
    tokio::spawn(forward_responses(
        message_id,
        request_tag,
        stream,
        cmds.clone(),
        permit,
    ));
}

/// Drives one handler stream, forwarding its responses to the connection
/// task. One response is held back until the next poll shows whether it was
/// the final one, so the last write carries the end-of-request marker.
async fn forward_responses(
    message_id: i32,
    request_tag: u8,
    mut stream: ResponseStream,
    mut cmds: mpsc::Sender<Cmd>,
    _permit: OwnedSemaphorePermit,
) {
    let mut held: Option<Response> = None;
    loop {
        match stream.next().await {
            Some(Ok(response)) => {
                if let Some(previous) = held.replace(response) {
                    let cmd = Cmd::Respond {
                        message_id,
                        request_tag,
                        response: previous,
                        last: false,
                    };
                    if cmds.send(cmd).await.is_err() {
                        return;
                    }
                }
            }
            Some(Err(HandlerError::Operation(e))) => {
                if let Some(previous) = held.take() {
                    let cmd = Cmd::Respond {
                        message_id,
                        request_tag,
                        response: previous,
                        last: false,
                    };
                    if cmds.send(cmd).await.is_err() {
                        return;
                    }
                }
                if let Some(cause) = &e.cause {
                    debug!("Request {} failed: {}", message_id, cause);
                }
                let cmd = Cmd::Respond {
                    message_id,
                    request_tag,
                    response: error_response(request_tag, &e),
                    last: true,
                };
                let _ = cmds.send(cmd).await;
                return;
            }
            Some(Err(HandlerError::Fatal(error))) => {
                let _ = cmds.send(Cmd::Fatal { message_id, error }).await;
                return;
            }
            None => {
                let cmd = match held.take() {
                    Some(last) => Cmd::Respond {
                        message_id,
                        request_tag,
                        response: last,
                        last: true,
                    },
                    None => Cmd::Finished { message_id },
                };
                let _ = cmds.send(cmd).await;
                return;
            }
        }
    }
}

/// Converts a structured operation failure into the response kind the
/// request expects.
fn error_response(request_tag: u8, error: &OperationError) -> Response {
    let result = error.to_result();
    match request_tag {
        OP_BIND_REQUEST => Response::Bind(BindResult {
            result,
            server_sasl_credentials: None,
        }),
        OP_EXTENDED_REQUEST => Response::Extended(ExtendedResult {
            result,
            name: None,
            value: None,
        }),
        _ => Response::Result(result),
    }
}

/// Validates the protocol version a bind request declares.
fn bind_version(config: &PipelineConfig, msg: &RawMessage) -> Result<i32, String> {
    match msg.version.unwrap_or(LDAP_VERSION_3) {
        LDAP_VERSION_3 => Ok(LDAP_VERSION_3),
        LDAP_VERSION_2 if !config.allow_ldap_v2 => Err("LDAPv2 binds are not accepted".into()),
        LDAP_VERSION_2 if message_has_controls(msg) => {
            Err("LDAPv2 bind request must not carry controls".into())
        }
        LDAP_VERSION_2 => Ok(LDAP_VERSION_2),
        other => Err(format!("Unsupported LDAP version {}", other)),
    }
}

/// Whether the message envelope carries controls after the protocol op
fn message_has_controls(msg: &RawMessage) -> bool {
    let mut r = msg.body.clone();
    r.skip_element().is_ok() && r.has_next_element() && matches!(r.peek_type(), Ok(TAG_CONTROLS))
}

fn protocol_error_bind(message_id: i32, diagnostic: &str) -> OutboundMessage {
    let result = LdapResult::new(ResultCode::ProtocolError).with_diagnostic(diagnostic);
    OutboundMessage::response(
        message_id,
        OP_BIND_REQUEST,
        Response::Bind(BindResult {
            result,
            server_sasl_credentials: None,
        }),
    )
}

/// Rebuilds the framed transport around the requested security layer. Bytes
/// the codec read past the trigger request belong to the new layer and are
/// replayed through it.
async fn install_layer(
    framed: Framed<BoxTransport, LdapCodec>,
    layer: PendingLayer,
) -> Result<Framed<BoxTransport, LdapCodec>, Error> {
    let parts = framed.into_parts();
    let leftover = parts.read_buf.freeze();
    let io = match layer {
        #[cfg(tls)]
        PendingLayer::StartTls(acceptor) => {
            let acceptor = tokio_native_tls::TlsAcceptor::from(acceptor);
            let stream = acceptor
                .accept(RewindStream::new(leftover, parts.io))
                .await
                .map_err(ChannelError::Tls)?;
            Box::new(stream) as BoxTransport
        }
        PendingLayer::Sasl(session) => wrap_sasl(parts.io, leftover, session),
    };
    Ok(Framed::from_parts(FramedParts::new::<OutboundMessage>(
        io,
        parts.codec,
    )))
}

/// Accepting LDAP server.
///
/// Serves every accepted connection through [`serve_connection`] with a
/// shared handler. Dropping the server stops accepting; connections already
/// established run to completion.
pub struct LdapServer {
    local_addr: SocketAddr,
    _closer: oneshot::Sender<()>,
}

impl LdapServer {
    /// Binds a listener and starts serving
    pub async fn bind<A, H>(addr: A, handler: H, config: PipelineConfig) -> Result<LdapServer, Error>
    where
        A: ToSocketAddrs,
        H: RequestHandler,
    {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let handler = Arc::new(handler);
        let (closer, close_rx) = oneshot::channel::<()>();

        let accept = Box::pin(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let handler = handler.clone();
                        let config = config.clone();
                        tokio::spawn(async move {
                            let _ = serve_connection(stream, peer_addr, local_addr, handler, config)
                                .await;
                        });
                    }
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        break;
                    }
                }
            }
        });
        tokio::spawn(async move {
            let _ = future::select(accept, close_rx).await;
        });

        debug!("Listening on {}", local_addr);
        Ok(LdapServer {
            local_addr,
            _closer: closer,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
