//! The operation error taxonomy.
//!
//! Every fallible engine operation reports one of these variants. The
//! split matters to callers: `SystemUnavailable` and `CrlFailure` are
//! retryable, `SystemFailure` signals possibly inconsistent state and
//! `NotPermitted`/`BadCertTemplate`/… are definitive rejections.

use std::fmt;
use std::io;

//------------ Error ---------------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
#[allow(clippy::large_enum_variant)]
pub enum Error {
    /// The operation is refused by policy or by the CA's own state.
    NotPermitted(String),

    /// The request content cannot be granted.
    BadCertTemplate(String),

    /// Proof of possession of the private key failed.
    BadPop,

    /// A certificate for this subject or key already exists and the
    /// applicable duplicate policy forbids another one.
    AlreadyIssued(String),

    /// The certificate referenced by an update request is revoked.
    CertRevoked,

    /// The referenced certificate is not known to this CA.
    UnknownCert,

    /// The requested certificate profile is not offered by this CA.
    UnknownCertProfile(String),

    /// CRL generation or retrieval failed; retryable.
    CrlFailure(String),

    /// A request extension could not be honoured.
    InvalidExtension(String),

    /// A required component is temporarily unavailable; retryable.
    SystemUnavailable(String),

    /// An internal error; state may be inconsistent.
    SystemFailure(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NotPermitted(msg) => write!(f, "Not permitted: {}", msg),
            Error::BadCertTemplate(msg) => write!(f, "Bad certificate template: {}", msg),
            Error::BadPop => write!(f, "Invalid proof of possession"),
            Error::AlreadyIssued(msg) => write!(f, "Already issued: {}", msg),
            Error::CertRevoked => write!(f, "Certificate is revoked"),
            Error::UnknownCert => write!(f, "Certificate is unknown"),
            Error::UnknownCertProfile(name) => {
                write!(f, "Unknown certificate profile '{}'", name)
            }
            Error::CrlFailure(msg) => write!(f, "CRL failure: {}", msg),
            Error::InvalidExtension(msg) => write!(f, "Invalid extension: {}", msg),
            Error::SystemUnavailable(msg) => {
                write!(f, "System temporarily unavailable: {}", msg)
            }
            Error::SystemFailure(msg) => write!(f, "System failure: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn not_permitted(msg: impl fmt::Display) -> Self {
        Error::NotPermitted(msg.to_string())
    }

    pub fn bad_template(msg: impl fmt::Display) -> Self {
        Error::BadCertTemplate(msg.to_string())
    }

    pub fn already_issued(msg: impl fmt::Display) -> Self {
        Error::AlreadyIssued(msg.to_string())
    }

    pub fn crl(msg: impl fmt::Display) -> Self {
        Error::CrlFailure(msg.to_string())
    }

    pub fn unavailable(msg: impl fmt::Display) -> Self {
        Error::SystemUnavailable(msg.to_string())
    }

    pub fn system(msg: impl fmt::Display) -> Self {
        Error::SystemFailure(msg.to_string())
    }

    pub fn signer(msg: impl fmt::Display) -> Self {
        Error::SystemFailure(format!("signer: {}", msg))
    }

    pub fn store(msg: impl fmt::Display) -> Self {
        Error::SystemFailure(format!("store: {}", msg))
    }

    /// Whether a caller may retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::SystemUnavailable(_) | Error::CrlFailure(_))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::SystemFailure(e.to_string())
    }
}

//------------ ErrorWithIndex ------------------------------------------------

/// An error attributed to one request of a batch.
#[derive(Clone, Debug)]
pub struct ErrorWithIndex {
    pub index: usize,
    pub error: Error,
}

impl ErrorWithIndex {
    pub fn new(index: usize, error: Error) -> Self {
        ErrorWithIndex { index, error }
    }
}

impl fmt::Display for ErrorWithIndex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "request {}: {}", self.index, self.error)
    }
}

impl std::error::Error for ErrorWithIndex {}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::unavailable("no idle signer").is_retryable());
        assert!(Error::crl("duplicate thisUpdate").is_retryable());
        assert!(!Error::not_permitted("CA is revoked").is_retryable());
        assert!(!Error::system("store corrupt").is_retryable());
    }

    #[test]
    fn display_carries_context() {
        let err = ErrorWithIndex::new(3, Error::BadPop);
        assert_eq!(err.to_string(), "request 3: Invalid proof of possession");
    }
}
