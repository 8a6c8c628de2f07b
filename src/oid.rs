//! OID definitions

/// StartTLS extended operation
pub const STARTTLS_OID: &str = "1.3.6.1.4.1.1466.20037";

/// WHOAMI extended operation
pub const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

/// Notice of disconnection response sent by the server
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";
