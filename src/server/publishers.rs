//! The publisher contract.
//!
//! Publishers mirror certificate and CRL lifecycle events into external
//! systems (OCSP responders, LDAP directories, CRL distribution points).
//! Synchronous publishers are notified inline; asynchronous ones are fed
//! through the durable publish queue only.

use std::fmt;

use crate::api::{CertRecord, CrlRecord, RevocationInfo, Serial};

//------------ PublisherError ------------------------------------------------

#[derive(Clone, Debug)]
pub struct PublisherError(pub String);

impl PublisherError {
    pub fn new(msg: impl fmt::Display) -> Self {
        PublisherError(msg.to_string())
    }
}

impl fmt::Display for PublisherError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "publisher error: {}", self.0)
    }
}

impl std::error::Error for PublisherError {}

pub type PublisherResult = Result<(), PublisherError>;

//------------ Publisher -----------------------------------------------------

pub trait Publisher: Send + Sync {
    fn ident(&self) -> &str;

    /// Asynchronous publishers are never called inline; their events go
    /// through the publish queue.
    fn is_async(&self) -> bool {
        false
    }

    fn is_healthy(&self) -> bool {
        true
    }

    /// Whether the publisher wants unrevoked (good) certificates at all.
    /// OCSP-style publishers that only track revocations return false.
    fn publishes_good_certs(&self) -> bool {
        true
    }

    fn certificate_added(&self, cert: &CertRecord) -> PublisherResult;

    fn certificate_revoked(
        &self,
        cert: &CertRecord,
        revocation: &RevocationInfo,
    ) -> PublisherResult;

    fn certificate_unrevoked(&self, cert: &CertRecord) -> PublisherResult;

    fn certificate_removed(&self, cert: &CertRecord) -> PublisherResult;

    fn crl_added(&self, crl: &CrlRecord) -> PublisherResult;

    fn ca_added(&self, ca_cert: &[u8]) -> PublisherResult;

    fn ca_revoked(&self, serial: Serial, revocation: &RevocationInfo) -> PublisherResult;

    fn ca_unrevoked(&self, serial: Serial) -> PublisherResult;
}
