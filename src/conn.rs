use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::{
    channel::{ChannelCloser, ChannelError, LdapChannel, MessageSender},
    error::Error,
    framing::OP_EXTENDED_RESPONSE,
    future::ResultFuture,
    model::{Control, OutboundMessage, Response},
    oid::NOTICE_OF_DISCONNECTION_OID,
    timeout::{PendingDeadline, TimeoutChecker},
    TlsOptions,
};

/// One decoded response with its message-level controls
pub(crate) type ResponseFuture = ResultFuture<(Response, Vec<Control>)>;

/// How an operation's timeout is escalated.
///
/// An ordinary operation that times out fails alone. A security-establishing
/// one leaves the connection state unknown, so its timeout invalidates the
/// whole connection.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Ordinary,
    Security,
}

struct PendingOp {
    future: ResponseFuture,
    kind: OpKind,
    deadline: Option<Instant>,
}

#[derive(Default)]
struct PendingOps {
    map: RwLock<HashMap<i32, PendingOp>>,
    closer: Mutex<Option<ChannelCloser>>,
    closed: AtomicBool,
}

impl PendingOps {
    fn insert(&self, id: i32, op: PendingOp) {
        self.map.write().insert(id, op);
    }

    fn remove(&self, id: i32) -> Option<PendingOp> {
        self.map.write().remove(&id)
    }

    fn complete(&self, id: i32, response: Response, controls: Vec<Control>) -> bool {
        match self.remove(id) {
            Some(op) => op.future.complete((response, controls)),
            None => false,
        }
    }

    fn fail(&self, id: i32, error: Error) -> bool {
        match self.remove(id) {
            Some(op) => op.future.fail(error),
            None => false,
        }
    }

    /// Fails every pending operation and marks the connection unusable.
    fn fail_all(&self, error: Error) {
        self.closed.store(true, Ordering::SeqCst);
        let ops: Vec<PendingOp> = self.map.write().drain().map(|(_, op)| op).collect();
        for op in ops {
            op.future.fail(error.clone());
        }
    }

    fn close_channel(&self) {
        if let Some(closer) = self.closer.lock().take() {
            let _ = closer.send(());
        }
    }
}

impl PendingDeadline for PendingOps {
    fn check(&self, now: Instant) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return true;
        }
        let expired: Vec<(i32, PendingOp)> = {
            let mut map = self.map.write();
            let ids: Vec<i32> = map
                .iter()
                .filter(|(_, op)| op.deadline.map(|d| d <= now).unwrap_or(false))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| map.remove(&id).map(|op| (id, op)))
                .collect()
        };

        let mut invalidate = false;
        for (id, op) in &expired {
            warn!("Operation {} timed out", id);
            op.future.fail(Error::OperationTimeout);
            if op.kind == OpKind::Security {
                invalidate = true;
            }
        }
        if invalidate {
            warn!("Security operation timed out, invalidating the connection");
            self.close_channel();
            self.fail_all(Error::ConnectionClosed);
        }
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub(crate) struct LdapConnection {
    pending: Arc<PendingOps>,
    channel_sender: MessageSender,
}

impl LdapConnection {
    pub(crate) async fn connect<A>(
        address: A,
        port: u16,
        tls_options: TlsOptions,
        connect_timeout: Duration,
    ) -> Result<Self, Error>
    where
        A: AsRef<str>,
    {
        let (sender, mut channel_receiver, closer) = LdapChannel::for_client(address, port)
            .connect(tls_options, connect_timeout)
            .await
            .map_err(|e| match &e {
                ChannelError::ConnectTimeout(_) => Error::ConnectTimeout,
                _ => e.into(),
            })?;

        let pending = Arc::new(PendingOps::default());
        *pending.closer.lock() = Some(closer);
        TimeoutChecker::shared().register(Arc::downgrade(&pending) as Weak<dyn PendingDeadline>);

        let connection = Self {
            pending: pending.clone(),
            channel_sender: sender,
        };

        tokio::spawn(async move {
            while let Some(msg) = channel_receiver.next().await {
                let id = msg.message_id;
                let op_tag = msg.op_tag;

                match Response::decode(msg) {
                    Ok((Response::Extended(resp), _))
                        if id == 0
                            && op_tag == OP_EXTENDED_RESPONSE
                            && resp.name.as_deref() == Some(NOTICE_OF_DISCONNECTION_OID) =>
                    {
                        debug!("Notice of disconnection received, exiting");
                        break;
                    }
                    Ok(_) if id == 0 => {
                        debug!("Ignoring unsolicited notification");
                    }
                    Ok((response, controls)) => {
                        if !pending.complete(id, response, controls) {
                            debug!("No pending operation for message {}", id);
                        }
                    }
                    Err(e) => {
                        debug!("Undecodable response for message {}: {}", id, e);
                        pending.fail(id, e);
                    }
                }
            }
            pending.fail_all(Error::ConnectionClosed);
        });

        Ok(connection)
    }

    /// Sends a request and waits for its single response.
    ///
    /// The operation is registered before the bytes leave, so a fast answer
    /// cannot race past its waiter.
    pub(crate) async fn send_recv(
        &mut self,
        msg: OutboundMessage,
        kind: OpKind,
        timeout: Option<Duration>,
    ) -> Result<(Response, Vec<Control>), Error> {
        if self.pending.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        let id = msg.message_id;
        let future = ResponseFuture::new();
        self.pending.insert(
            id,
            PendingOp {
                future: future.clone(),
                kind,
                deadline: timeout.map(|t| Instant::now() + t),
            },
        );

        if let Err(e) = self.channel_sender.send(msg).await {
            self.pending.remove(id);
            return Err(e.into());
        }

        future.await
    }

    pub(crate) async fn send(&mut self, msg: OutboundMessage) -> Result<(), Error> {
        Ok(self.channel_sender.send(msg).await?)
    }

    /// Cancels the local waiter for `target_id` and sends `msg`, which is
    /// expected to be the abandon request for it.
    pub(crate) async fn abandon(&mut self, target_id: i32, msg: OutboundMessage) -> Result<(), Error> {
        if let Some(op) = self.pending.remove(target_id) {
            op.future.cancel();
        }
        self.send(msg).await
    }

    /// Drops all channel endpoints, closing the connection.
    pub(crate) fn shutdown(&self) {
        self.pending.close_channel();
        self.pending.fail_all(Error::ConnectionClosed);
    }
}
