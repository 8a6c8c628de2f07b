//! LDAP client module

use std::{
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;

use crate::{
    conn::{LdapConnection, OpKind},
    error::Error,
    model::{
        BindResult, ExtendedResult, LdapResult, OutboundMessage, Request, Response, LDAP_VERSION_3,
    },
    oid,
    options::TlsOptions,
};

pub type Result<T> = std::result::Result<T, Error>;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn check_result(result: LdapResult) -> Result<()> {
    if result.is_success() {
        Ok(())
    } else {
        Err(Error::OperationFailed(result.into()))
    }
}

/// LDAP client builder
pub struct LdapClientBuilder {
    address: String,
    port: u16,
    tls_options: TlsOptions,
    connect_timeout: Duration,
    request_timeout: Option<Duration>,
}

impl LdapClientBuilder {
    /// Set port number, default is 389
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set TLS options, default is plain connection
    pub fn tls_options(mut self, options: TlsOptions) -> Self {
        self.tls_options = options;
        self
    }

    /// Set TCP connect timeout, default is 10 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Fail operations that receive no response within the given time.
    /// By default operations wait indefinitely.
    ///
    /// A timed out bind additionally invalidates the connection, since the
    /// authentication state is no longer known.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Build client and connect
    pub async fn connect(self) -> Result<LdapClient> {
        LdapClient::connect(
            self.address,
            self.port,
            self.tls_options,
            self.connect_timeout,
            self.request_timeout,
        )
        .await
    }
}

/// LDAP client
#[derive(Clone)]
pub struct LdapClient {
    connection: LdapConnection,
    id_counter: Arc<AtomicI32>,
    request_timeout: Option<Duration>,
}

impl LdapClient {
    /// Create client builder
    pub fn builder<A: AsRef<str>>(address: A) -> LdapClientBuilder {
        LdapClientBuilder {
            address: address.as_ref().to_owned(),
            port: 389,
            tls_options: TlsOptions::plain(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: None,
        }
    }

    pub(crate) async fn connect<A>(
        address: A,
        port: u16,
        tls_options: TlsOptions,
        connect_timeout: Duration,
        request_timeout: Option<Duration>,
    ) -> Result<Self>
    where
        A: AsRef<str>,
    {
        let connection = LdapConnection::connect(address, port, tls_options, connect_timeout).await?;
        Ok(Self {
            connection,
            id_counter: Arc::new(AtomicI32::new(2)), // 1 is used by STARTTLS
            request_timeout,
        })
    }

    fn new_id(&self) -> i32 {
        self.id_counter.fetch_add(1, Ordering::SeqCst)
    }

    async fn do_bind(&mut self, request: Request) -> Result<BindResult> {
        let id = self.new_id();
        let msg = OutboundMessage::request(id, request);

        let (response, _controls) = self
            .connection
            .send_recv(msg, OpKind::Security, self.request_timeout)
            .await?;

        match response {
            Response::Bind(bind) => Ok(bind),
            _ => Err(Error::InvalidResponse),
        }
    }

    /// Perform simple bind operation with username and password
    pub async fn simple_bind<U, P>(&mut self, username: U, password: P) -> Result<()>
    where
        U: AsRef<str>,
        P: AsRef<str>,
    {
        let request = Request::SimpleBind {
            version: LDAP_VERSION_3,
            name: username.as_ref().to_owned(),
            password: Bytes::copy_from_slice(password.as_ref().as_bytes()),
        };
        let bind = self.do_bind(request).await?;
        check_result(bind.result)
    }

    /// Perform SASL EXTERNAL bind
    pub async fn sasl_external_bind(&mut self) -> Result<()> {
        let bind = self.sasl_bind("EXTERNAL", None).await?;
        check_result(bind.result)
    }

    /// Perform one SASL bind round with the given mechanism and credentials.
    ///
    /// Multi-round mechanisms call this repeatedly while the result code is
    /// [`SaslBindInProgress`](crate::model::ResultCode::SaslBindInProgress),
    /// feeding the returned server credentials into the next round.
    pub async fn sasl_bind<M>(&mut self, mechanism: M, credentials: Option<Bytes>) -> Result<BindResult>
    where
        M: AsRef<str>,
    {
        let request = Request::SaslBind {
            version: LDAP_VERSION_3,
            name: String::new(),
            mechanism: mechanism.as_ref().to_owned(),
            credentials,
        };
        self.do_bind(request).await
    }

    /// Perform unbind operation. This will instruct LDAP server to terminate the connection
    pub async fn unbind(&mut self) -> Result<()> {
        let id = self.new_id();

        let msg = OutboundMessage::request(id, Request::Unbind);
        self.connection.send(msg).await?;

        Ok(())
    }

    /// Send 'whoami' extended request (RFC4532)
    pub async fn whoami(&mut self) -> Result<Option<String>> {
        let resp = self.extended(oid::WHOAMI_OID, None).await?;
        Ok(resp.value.map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    /// Send an extended request and wait for the matching response
    pub async fn extended<N>(&mut self, name: N, value: Option<Bytes>) -> Result<ExtendedResult>
    where
        N: AsRef<str>,
    {
        let id = self.new_id();
        let msg = OutboundMessage::request(
            id,
            Request::Extended {
                name: name.as_ref().to_owned(),
                value,
            },
        );

        let (response, _controls) = self
            .connection
            .send_recv(msg, OpKind::Ordinary, self.request_timeout)
            .await?;

        match response {
            Response::Extended(resp) => {
                if resp.result.is_success() {
                    Ok(resp)
                } else {
                    Err(Error::OperationFailed(resp.result.into()))
                }
            }
            _ => Err(Error::InvalidResponse),
        }
    }

    /// Abandon a previously issued operation.
    ///
    /// The local waiter fails with
    /// [`OperationCancelled`](Error::OperationCancelled); whether the server
    /// stops processing is up to the server, abandon has no response.
    pub async fn abandon(&mut self, message_id: i32) -> Result<()> {
        let id = self.new_id();
        let msg = OutboundMessage::request(id, Request::Abandon { message_id });
        self.connection.abandon(message_id, msg).await
    }
}
