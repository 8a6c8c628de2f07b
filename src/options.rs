//! LDAP connection options

#[cfg(tls)]
pub use native_tls::{Certificate, Identity};

#[derive(Clone, PartialEq)]
pub(crate) enum TlsKind {
    Plain,
    #[cfg(tls)]
    Tls,
    #[cfg(tls)]
    StartTls,
}

/// TLS options
pub struct TlsOptions {
    pub(crate) kind: TlsKind,
    #[cfg(tls)]
    pub(crate) ca_certs: Vec<Certificate>,
    #[cfg(tls)]
    pub(crate) verify_hostname: bool,
    #[cfg(tls)]
    pub(crate) verify_certs: bool,
    #[cfg(tls)]
    pub(crate) identity: Option<Identity>,
    #[cfg(tls)]
    pub(crate) domain_name: Option<String>,
}

impl TlsOptions {
    fn new(kind: TlsKind) -> Self {
        Self {
            kind,
            #[cfg(tls)]
            ca_certs: Vec::new(),
            #[cfg(tls)]
            verify_hostname: true,
            #[cfg(tls)]
            verify_certs: true,
            #[cfg(tls)]
            identity: None,
            #[cfg(tls)]
            domain_name: None,
        }
    }

    /// Use plain connection without transport security
    pub fn plain() -> Self {
        Self::new(TlsKind::Plain)
    }

    #[cfg(tls)]
    /// Connect using TLS transport
    pub fn tls() -> Self {
        Self::new(TlsKind::Tls)
    }

    #[cfg(tls)]
    /// Connect using STARTTLS negotiation
    pub fn start_tls() -> Self {
        Self::new(TlsKind::StartTls)
    }

    #[cfg(tls)]
    /// Add CA root certificate to use during TLS handshake
    pub fn ca_cert(mut self, cert: Certificate) -> Self {
        self.ca_certs.push(cert);
        self
    }

    #[cfg(tls)]
    /// Set client identity for mutual TLS authentication
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    #[cfg(tls)]
    /// Specify custom domain name to use for SNI match. The default is the connection host name
    pub fn domain_name<S: AsRef<str>>(mut self, domain_name: S) -> Self {
        self.domain_name = Some(domain_name.as_ref().to_owned());
        self
    }

    #[cfg(tls)]
    /// Enable or disable host name validation in the server certificate.
    /// By default host name validation is enabled.
    /// This option is only used when certificate verification is enabled.
    pub fn verify_hostname(mut self, flag: bool) -> Self {
        self.verify_hostname = flag;
        self
    }

    #[cfg(tls)]
    /// Enable or disable server certificate validation.
    /// By default server certificate validation is enabled.
    pub fn verify_certs(mut self, flag: bool) -> Self {
        self.verify_certs = flag;
        self
    }
}
