//! Request adjudication.
//!
//! Adjudication turns a raw [`CertTemplate`] into a [`GrantedTemplate`]
//! that the issuance pipeline can sign without further policy decisions.
//! The checks run in a fixed order so that the most specific rejection
//! wins; nothing here mutates the store.

use std::sync::Arc;

use chrono::{Duration, Utc};
use log::debug;

use crate::api::{
    end_of_time, CertExtension, CertRecord, CertStatus, CertTemplate, Fingerprint,
    KeypairGenControl, Name, PublicKey, RequestorInfo, ValidityMode,
};
use crate::commons::{Error, KilnResult};
use crate::constants::{
    BACKDATE_TOLERANCE_SECONDS, MAX_GENERATED_RSA_BITS, SUBJECT_DISAMBIGUATION_ATTEMPTS,
};
use crate::server::ca::profile::CertProfile;
use crate::server::ca::Ca;

//------------ GrantedTemplate -----------------------------------------------

/// A fully adjudicated certificate template.
#[derive(Clone, Debug)]
pub struct GrantedTemplate {
    pub profile: Arc<CertProfile>,
    pub requested_subject: Name,
    pub granted_subject: Name,
    pub not_before: chrono::DateTime<Utc>,
    pub not_after: chrono::DateTime<Utc>,
    pub public_key: PublicKey,
    /// Present when the CA generated the key pair.
    pub private_key: Option<Vec<u8>>,
    pub key_fp: Fingerprint,
    pub subject_fp: Fingerprint,
    pub extensions: Vec<CertExtension>,
    pub warning: Option<String>,
    /// An existing certificate satisfying an update request; no new
    /// certificate is issued then.
    pub reuse: Option<CertRecord>,
}

//------------ Adjudication --------------------------------------------------

impl Ca {
    /// Runs the full policy gauntlet over a request.
    pub(crate) fn adjudicate(
        &self,
        template: &CertTemplate,
        requestor: &RequestorInfo,
        update: bool,
    ) -> KilnResult<GrantedTemplate> {
        if self.is_revoked() {
            return Err(Error::not_permitted(format!(
                "CA {} is revoked, issuance is disabled",
                self.ident
            )));
        }

        let profile = self
            .profiles
            .read()
            .map_err(|_| Error::system("profile lock poisoned"))?
            .get(&template.profile)
            .cloned()
            .ok_or_else(|| Error::UnknownCertProfile(template.profile.clone()))?;

        if profile.ra_only && !requestor.ra {
            return Err(Error::not_permitted(format!(
                "profile {} is restricted to registration authorities",
                profile.name
            )));
        }

        let requested_subject = template.subject.strip_empty_rdns();
        if requested_subject.has_attr(crate::api::AttrType::SerialNumber)
            && !profile.serial_number_in_req_permitted
        {
            return Err(Error::bad_template(
                "serialNumber attribute in the requested subject is not permitted",
            ));
        }

        let now = Utc::now();
        let mut not_before = profile.not_before(template.not_before);
        let backdate_limit = now - Duration::seconds(BACKDATE_TOLERANCE_SECONDS);
        if not_before < backdate_limit {
            not_before = backdate_limit;
        }
        if not_before < self.ca_cert.not_before {
            not_before = self.ca_cert.not_before;
        }
        if let Some(cutoff) = self.config.no_issuance_after {
            if not_before > cutoff {
                return Err(Error::not_permitted(format!(
                    "CA {} does not issue certificates after {}",
                    self.ident, cutoff
                )));
            }
        }

        let mut warnings: Vec<String> = Vec::new();

        // key resolution
        let (public_key, private_key) = if template.ca_generate_keypair {
            let control = self.resolve_keypair_control(&profile)?;
            if let KeypairGenControl::Rsa { key_size } = control {
                if key_size > MAX_GENERATED_RSA_BITS {
                    return Err(Error::bad_template(format!(
                        "{}-bit RSA exceeds the generation limit",
                        key_size
                    )));
                }
            }
            let pair = self.keygen.generate(&control).map_err(Error::signer)?;
            (pair.public, Some(pair.private))
        } else {
            let key = template
                .public_key
                .clone()
                .ok_or_else(|| Error::bad_template("request contains no public key"))?;
            profile.check_public_key(&key)?;
            (key, None)
        };
        let key_fp = public_key.fingerprint();

        let subject_info = profile.subject(&requested_subject);
        if let Some(warning) = subject_info.warning {
            warnings.push(warning);
        }
        let mut granted_subject = subject_info.granted;
        if granted_subject.is_empty() {
            return Err(Error::bad_template("granted subject is empty"));
        }

        if granted_subject.canonical() == self.ca_cert.subject.canonical() {
            return Err(Error::already_issued(
                "certificate with the CA's own subject",
            ));
        }

        let mut reuse = None;
        if update {
            match self.store.cert_status_for_subject(
                &self.ident,
                &granted_subject.fingerprint(),
            )? {
                CertStatus::Revoked | CertStatus::Suspended => {
                    return Err(Error::CertRevoked)
                }
                CertStatus::Unknown | CertStatus::Removed => {
                    return Err(Error::UnknownCert)
                }
                CertStatus::Valid | CertStatus::Expired => {}
            }
            // the same subject and key: hand out the existing certificate
            if let Some(existing) = self
                .store
                .cert_for_subject(&self.ident, &granted_subject.fingerprint())?
            {
                if existing.key_fp == key_fp {
                    debug!(
                        "ca {}: update for {} matches issued certificate {}",
                        self.ident, granted_subject, existing.serial
                    );
                    reuse = Some(existing);
                }
            }
        } else {
            if !self.config.duplicate_key_permitted {
                if self.store.cert_for_key(&self.ident, &key_fp)?.is_some() {
                    return Err(Error::already_issued(
                        "the public key is already bound to a valid certificate",
                    ));
                }
            }
            if !self.config.duplicate_subject_permitted {
                let status = self
                    .store
                    .cert_status_for_subject(&self.ident, &granted_subject.fingerprint())?;
                if !matches!(status, CertStatus::Unknown | CertStatus::Removed) {
                    if profile.inc_serial_if_subject_exists {
                        granted_subject = self.disambiguate_subject(&granted_subject)?;
                        warnings.push(format!(
                            "subject disambiguated to {}",
                            granted_subject
                        ));
                    } else {
                        return Err(Error::already_issued(format!(
                            "a certificate for subject {} exists",
                            granted_subject
                        )));
                    }
                }
            }
        }

        // validity
        let cap = match profile.validity {
            Some(validity) if validity < self.config.max_validity => validity,
            _ => self.config.max_validity,
        };
        let capped = cap.add_to(not_before);
        let mut not_after = match template.not_after {
            Some(requested) if requested < capped => requested,
            Some(_) => {
                warnings.push("notAfter modified to the profile limit".to_string());
                capped
            }
            None => capped,
        };
        if not_after > end_of_time() {
            not_after = end_of_time();
            warnings.push("notAfter modified to the latest representable time".to_string());
        }
        if not_after > self.ca_cert.not_after {
            match self.config.validity_mode {
                ValidityMode::Cutoff => {
                    not_after = self.ca_cert.not_after;
                    warnings.push("notAfter modified to the CA's notAfter".to_string());
                }
                ValidityMode::Strict => {
                    return Err(Error::not_permitted(format!(
                        "notAfter {} is beyond the CA's own validity",
                        not_after
                    )));
                }
                ValidityMode::Lax => {}
            }
        }
        if not_after <= not_before {
            return Err(Error::bad_template("granted validity is empty"));
        }

        let mut extensions = profile.extensions.clone();
        extensions.extend(template.extensions.iter().cloned());

        let subject_fp = granted_subject.fingerprint();
        Ok(GrantedTemplate {
            profile,
            requested_subject,
            granted_subject,
            not_before,
            not_after,
            public_key,
            private_key,
            key_fp,
            subject_fp,
            extensions,
            warning: if warnings.is_empty() {
                None
            } else {
                Some(warnings.join("; "))
            },
            reuse,
        })
    }

    fn resolve_keypair_control(
        &self,
        profile: &CertProfile,
    ) -> KilnResult<KeypairGenControl> {
        match &profile.keypair_gen {
            KeypairGenControl::Forbidden => Err(Error::bad_template(format!(
                "profile {} forbids CA-side key generation",
                profile.name
            ))),
            KeypairGenControl::InheritCa => {
                self.inherited_keypair_gen.clone().ok_or_else(|| {
                    Error::bad_template(
                        "the CA key type does not support inherited key generation",
                    )
                })
            }
            control => Ok(control.clone()),
        }
    }

    /// Appends or increments the serialNumber attribute until the subject
    /// is unused. The store is queried once for the latest suffix and
    /// again per candidate, bounded by the attempt limit.
    fn disambiguate_subject(&self, granted: &Name) -> KilnResult<Name> {
        let base = granted.without_serial_number();
        let mut next = self
            .store
            .latest_subject_serial_suffix(&self.ident, &base)?
            .map(|latest| latest + 1)
            .unwrap_or(1);
        for _ in 0..SUBJECT_DISAMBIGUATION_ATTEMPTS {
            let candidate = granted.with_serial_number(next);
            let status = self
                .store
                .cert_status_for_subject(&self.ident, &candidate.fingerprint())?;
            if matches!(status, CertStatus::Unknown | CertStatus::Removed) {
                return Ok(candidate);
            }
            next += 1;
        }
        Err(Error::already_issued(format!(
            "could not find an unused serialNumber for subject {}",
            base
        )))
    }
}
