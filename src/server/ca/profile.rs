//! Resolved certificate profiles.
//!
//! A profile arrives here fully parsed; document parsing is the concern
//! of the embedding server. The engine consults the profile during
//! adjudication only.

use chrono::{DateTime, Utc};

use crate::api::{
    CertExtension, CertKind, KeypairGenControl, Name, PublicKey, Validity,
};
use crate::commons::{Error, KilnResult};

//------------ CertProfile ---------------------------------------------------

#[derive(Clone, Debug)]
pub struct CertProfile {
    pub name: String,

    /// Only registration authorities may request under this profile.
    pub ra_only: bool,

    pub kind: CertKind,

    /// Whether a serialNumber attribute in the requested subject is kept.
    pub serial_number_in_req_permitted: bool,

    /// Whether a colliding subject may be disambiguated by incrementing
    /// its serialNumber attribute.
    pub inc_serial_if_subject_exists: bool,

    /// Profile validity; the CA's max validity still caps it.
    pub validity: Option<Validity>,

    pub keypair_gen: KeypairGenControl,

    /// Accepted key algorithms ("RSA", "EC", "DSA"); empty means any.
    pub allowed_key_algorithms: Vec<String>,

    /// Upper bound on the encoded certificate size.
    pub max_cert_size: Option<usize>,

    /// Extensions the profile stamps onto every certificate.
    pub extensions: Vec<CertExtension>,
}

impl CertProfile {
    /// A permissive end-entity profile.
    pub fn end_entity(name: &str) -> Self {
        CertProfile {
            name: name.to_string(),
            ra_only: false,
            kind: CertKind::EndEntity,
            serial_number_in_req_permitted: true,
            inc_serial_if_subject_exists: false,
            validity: None,
            keypair_gen: KeypairGenControl::Rsa { key_size: 2048 },
            allowed_key_algorithms: Vec::new(),
            max_cert_size: None,
            extensions: Vec::new(),
        }
    }

    pub fn check_public_key(&self, key: &PublicKey) -> KilnResult<()> {
        key.validate()?;
        if !self.allowed_key_algorithms.is_empty()
            && !self
                .allowed_key_algorithms
                .iter()
                .any(|alg| alg == key.algorithm())
        {
            return Err(Error::bad_template(format!(
                "key algorithm {} not permitted by profile {}",
                key.algorithm(),
                self.name
            )));
        }
        Ok(())
    }

    /// Normalises the requested subject. Attribute values are trimmed; a
    /// change is reported as an advisory warning.
    pub fn subject(&self, requested: &Name) -> SubjectInfo {
        let mut changed = false;
        let granted = Name::new(
            requested
                .rdns
                .iter()
                .map(|rdn| {
                    let trimmed = rdn.value.trim();
                    if trimmed != rdn.value {
                        changed = true;
                    }
                    crate::api::Rdn::new(rdn.attr, trimmed)
                })
                .collect(),
        );
        SubjectInfo {
            granted,
            warning: changed.then(|| "subject attribute values were trimmed".to_string()),
        }
    }

    pub fn not_before(&self, requested: Option<DateTime<Utc>>) -> DateTime<Utc> {
        requested.unwrap_or_else(Utc::now)
    }
}

/// Result of subject normalisation.
#[derive(Clone, Debug)]
pub struct SubjectInfo {
    pub granted: Name,
    pub warning: Option<String>,
}

//------------ Tests ---------------------------------------------------------
