//! The certificate store contract and an in-memory reference store.
//!
//! The store owns all durable CA state: certificate rows, CRLs, the
//! serial and CRL number counters, the delta-CRL change cache and the
//! publish queue. Counter allocation and the revocation compare-and-set
//! operations must be atomic; everything else is plain CRUD.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};

use crate::api::{
    CaIdentity, CertRecord, CertStatus, CrlReason, CrlRecord, Name, PublishQueueEntry,
    RevocationInfo, RevokedCertEntry, Serial,
};
use crate::commons::{Error, KilnResult};

//------------ CertStore -----------------------------------------------------

pub trait CertStore: Send + Sync {
    /// Allocates the next certificate serial. Strictly increasing per CA,
    /// never reused, also not for failed issuances.
    fn next_serial(&self, ca: &CaIdentity) -> KilnResult<Serial>;

    /// Allocates the next CRL number. Full and delta CRLs share one
    /// sequence.
    fn next_crl_number(&self, ca: &CaIdentity) -> KilnResult<u64>;

    /// Inserts a certificate row and returns it with its internal id
    /// assigned. Internal ids order rows by insertion.
    fn add_cert(&self, ca: &CaIdentity, record: CertRecord) -> KilnResult<CertRecord>;

    fn get_cert(&self, ca: &CaIdentity, serial: Serial) -> KilnResult<Option<CertRecord>>;

    fn get_cert_by_id(&self, ca: &CaIdentity, id: i64) -> KilnResult<Option<CertRecord>>;

    /// Most recent valid certificate for a canonical subject fingerprint.
    fn cert_for_subject(
        &self,
        ca: &CaIdentity,
        subject_fp: &crate::api::Fingerprint,
    ) -> KilnResult<Option<CertRecord>>;

    /// Most recent valid certificate for a public key fingerprint.
    fn cert_for_key(
        &self,
        ca: &CaIdentity,
        key_fp: &crate::api::Fingerprint,
    ) -> KilnResult<Option<CertRecord>>;

    /// Lifecycle status of the most recent certificate carrying the
    /// subject fingerprint, `Unknown` if none exists.
    fn cert_status_for_subject(
        &self,
        ca: &CaIdentity,
        subject_fp: &crate::api::Fingerprint,
    ) -> KilnResult<CertStatus>;

    /// Largest serialNumber attribute value among subjects that equal the
    /// given name apart from their serialNumber attribute.
    fn latest_subject_serial_suffix(
        &self,
        ca: &CaIdentity,
        base: &Name,
    ) -> KilnResult<Option<u64>>;

    /// Compare-and-set revocation.
    ///
    /// Unknown serial returns `Ok(None)`. An already revoked certificate
    /// is a no-op returning `Ok(None)` when the reason is identical and an
    /// error when it differs, unless `force` replaces the existing info.
    /// With `delta_cache` the serial is recorded in the delta-CRL cache.
    fn revoke_cert(
        &self,
        ca: &CaIdentity,
        serial: Serial,
        revocation: RevocationInfo,
        force: bool,
        delta_cache: bool,
    ) -> KilnResult<Option<CertRecord>>;

    /// Replaces the certificateHold reason of a suspended certificate.
    /// Returns `Ok(None)` when the certificate is unknown or not
    /// suspended.
    fn revoke_suspended_cert(
        &self,
        ca: &CaIdentity,
        serial: Serial,
        reason: CrlReason,
        delta_cache: bool,
    ) -> KilnResult<Option<CertRecord>>;

    /// Lifts a certificateHold. Revocations with any other reason are
    /// permanent; lifting them is a no-op returning `Ok(None)` unless
    /// `force` is given.
    fn unrevoke_cert(
        &self,
        ca: &CaIdentity,
        serial: Serial,
        force: bool,
        delta_cache: bool,
    ) -> KilnResult<Option<CertRecord>>;

    /// Deletes the row. Returns the removed record, `Ok(None)` when the
    /// serial is unknown.
    fn remove_cert(&self, ca: &CaIdentity, serial: Serial) -> KilnResult<Option<CertRecord>>;

    /// Page of revoked (including suspended) certificates with internal
    /// id greater than `start_id`, in id order. With `not_expired_at`
    /// certificates expired at that instant are skipped.
    fn get_revoked_certs(
        &self,
        ca: &CaIdentity,
        not_expired_at: Option<DateTime<Utc>>,
        start_id: i64,
        limit: usize,
    ) -> KilnResult<Vec<RevokedCertEntry>>;

    /// Page of delta-CRL cache entries `(cache_id, serial)` with cache id
    /// greater than `start_id`.
    fn get_delta_crl_cache(
        &self,
        ca: &CaIdentity,
        start_id: i64,
        limit: usize,
    ) -> KilnResult<Vec<(i64, Serial)>>;

    fn max_delta_crl_cache_id(&self, ca: &CaIdentity) -> KilnResult<i64>;

    fn clear_delta_crl_cache(&self, ca: &CaIdentity, up_to_id: i64) -> KilnResult<()>;

    /// Page of valid certificates in id order, for the certificate-set
    /// CRL extension.
    fn get_valid_certs(
        &self,
        ca: &CaIdentity,
        not_expired_at: Option<DateTime<Utc>>,
        start_id: i64,
        limit: usize,
    ) -> KilnResult<Vec<CertRecord>>;

    /// Serials of certificates expired at the given instant.
    fn expired_serials(
        &self,
        ca: &CaIdentity,
        expired_at: DateTime<Utc>,
        limit: usize,
    ) -> KilnResult<Vec<Serial>>;

    /// Serials of suspended certificates whose revocation is older than
    /// the given cutoff.
    fn suspended_serials(
        &self,
        ca: &CaIdentity,
        unchanged_since: DateTime<Utc>,
        limit: usize,
    ) -> KilnResult<Vec<Serial>>;

    fn add_crl(&self, ca: &CaIdentity, crl: CrlRecord) -> KilnResult<()>;

    /// The CRL with the given number, or the most recent one.
    fn get_crl(&self, ca: &CaIdentity, number: Option<u64>) -> KilnResult<Option<CrlRecord>>;

    fn this_update_of_current_crl(&self, ca: &CaIdentity)
        -> KilnResult<Option<DateTime<Utc>>>;

    fn has_crl(&self, ca: &CaIdentity) -> KilnResult<bool>;

    /// Drops all but the `keep` most recent CRLs.
    fn cleanup_crls(&self, ca: &CaIdentity, keep: u32) -> KilnResult<()>;

    fn enqueue_publish(&self, entry: PublishQueueEntry) -> KilnResult<()>;

    fn publish_queue_entries(
        &self,
        publisher: &str,
        ca: &CaIdentity,
        limit: usize,
    ) -> KilnResult<Vec<PublishQueueEntry>>;

    fn remove_publish_entry(&self, entry: &PublishQueueEntry) -> KilnResult<()>;

    /// Clears the queue for one publisher, or for all when `publisher`
    /// is `None`.
    fn clear_publish_queue(
        &self,
        publisher: Option<&str>,
        ca: &CaIdentity,
    ) -> KilnResult<()>;

    fn is_healthy(&self) -> bool;
}

//------------ MemStore ------------------------------------------------------

#[derive(Debug, Default)]
struct CaState {
    next_serial: u128,
    next_crl_number: u64,
    next_cert_id: i64,
    next_cache_id: i64,
    certs: Vec<CertRecord>,
    crls: Vec<CrlRecord>,
    delta_cache: Vec<(i64, Serial)>,
}

/// In-memory reference implementation of [`CertStore`].
#[derive(Debug, Default)]
pub struct MemStore {
    cas: RwLock<HashMap<u32, CaState>>,
    queue: Mutex<Vec<PublishQueueEntry>>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    fn with_ca<T>(
        &self,
        ca: &CaIdentity,
        op: impl FnOnce(&CaState) -> KilnResult<T>,
    ) -> KilnResult<T> {
        let mut cas = self.cas.write().map_err(|_| Error::store("lock poisoned"))?;
        op(cas.entry(ca.id).or_default())
    }

    fn with_ca_mut<T>(
        &self,
        ca: &CaIdentity,
        op: impl FnOnce(&mut CaState) -> KilnResult<T>,
    ) -> KilnResult<T> {
        let mut cas = self.cas.write().map_err(|_| Error::store("lock poisoned"))?;
        op(cas.entry(ca.id).or_default())
    }
}

impl CaState {
    fn cert_mut(&mut self, serial: Serial) -> Option<&mut CertRecord> {
        self.certs.iter_mut().find(|c| c.serial == serial)
    }

    fn cache_serial(&mut self, serial: Serial) {
        self.next_cache_id += 1;
        self.delta_cache.push((self.next_cache_id, serial));
    }
}

impl CertStore for MemStore {
    fn next_serial(&self, ca: &CaIdentity) -> KilnResult<Serial> {
        self.with_ca_mut(ca, |state| {
            state.next_serial += 1;
            Ok(Serial(state.next_serial))
        })
    }

    fn next_crl_number(&self, ca: &CaIdentity) -> KilnResult<u64> {
        self.with_ca_mut(ca, |state| {
            state.next_crl_number += 1;
            Ok(state.next_crl_number)
        })
    }

    fn add_cert(&self, ca: &CaIdentity, mut record: CertRecord) -> KilnResult<CertRecord> {
        self.with_ca_mut(ca, |state| {
            state.next_cert_id += 1;
            record.id = state.next_cert_id;
            state.certs.push(record.clone());
            Ok(record)
        })
    }

    fn get_cert(&self, ca: &CaIdentity, serial: Serial) -> KilnResult<Option<CertRecord>> {
        self.with_ca(ca, |state| {
            Ok(state.certs.iter().find(|c| c.serial == serial).cloned())
        })
    }

    fn get_cert_by_id(&self, ca: &CaIdentity, id: i64) -> KilnResult<Option<CertRecord>> {
        self.with_ca(ca, |state| {
            Ok(state.certs.iter().find(|c| c.id == id).cloned())
        })
    }

    fn cert_for_subject(
        &self,
        ca: &CaIdentity,
        subject_fp: &crate::api::Fingerprint,
    ) -> KilnResult<Option<CertRecord>> {
        self.with_ca(ca, |state| {
            Ok(state
                .certs
                .iter()
                .rev()
                .find(|c| c.subject_fp == *subject_fp && c.status == CertStatus::Valid)
                .cloned())
        })
    }

    fn cert_for_key(
        &self,
        ca: &CaIdentity,
        key_fp: &crate::api::Fingerprint,
    ) -> KilnResult<Option<CertRecord>> {
        self.with_ca(ca, |state| {
            Ok(state
                .certs
                .iter()
                .rev()
                .find(|c| c.key_fp == *key_fp && c.status == CertStatus::Valid)
                .cloned())
        })
    }

    fn cert_status_for_subject(
        &self,
        ca: &CaIdentity,
        subject_fp: &crate::api::Fingerprint,
    ) -> KilnResult<CertStatus> {
        self.with_ca(ca, |state| {
            Ok(state
                .certs
                .iter()
                .rev()
                .find(|c| c.subject_fp == *subject_fp)
                .map(|c| c.status)
                .unwrap_or(CertStatus::Unknown))
        })
    }

    fn latest_subject_serial_suffix(
        &self,
        ca: &CaIdentity,
        base: &Name,
    ) -> KilnResult<Option<u64>> {
        let canonical = base.without_serial_number().canonical();
        self.with_ca(ca, |state| {
            Ok(state
                .certs
                .iter()
                .filter(|c| c.subject.without_serial_number().canonical() == canonical)
                .filter_map(|c| c.subject.serial_number_attr())
                .max())
        })
    }

    fn revoke_cert(
        &self,
        ca: &CaIdentity,
        serial: Serial,
        revocation: RevocationInfo,
        force: bool,
        delta_cache: bool,
    ) -> KilnResult<Option<CertRecord>> {
        self.with_ca_mut(ca, |state| {
            let cert = match state.cert_mut(serial) {
                Some(cert) => cert,
                None => return Ok(None),
            };
            if let Some(existing) = &cert.revocation {
                if existing.reason == revocation.reason {
                    return Ok(None);
                }
                if !force {
                    return Err(Error::not_permitted(format!(
                        "certificate {} already revoked with reason {}",
                        serial, existing.reason
                    )));
                }
            }
            cert.status = if revocation.reason == CrlReason::CertificateHold {
                CertStatus::Suspended
            } else {
                CertStatus::Revoked
            };
            cert.revocation = Some(revocation);
            cert.last_update = Utc::now();
            let revoked = cert.clone();
            if delta_cache {
                state.cache_serial(serial);
            }
            Ok(Some(revoked))
        })
    }

    fn revoke_suspended_cert(
        &self,
        ca: &CaIdentity,
        serial: Serial,
        reason: CrlReason,
        delta_cache: bool,
    ) -> KilnResult<Option<CertRecord>> {
        self.with_ca_mut(ca, |state| {
            let cert = match state.cert_mut(serial) {
                Some(cert) if cert.status == CertStatus::Suspended => cert,
                _ => return Ok(None),
            };
            let revoked_at = cert
                .revocation
                .as_ref()
                .map(|r| r.revoked_at)
                .unwrap_or_else(Utc::now);
            cert.status = CertStatus::Revoked;
            cert.revocation = Some(RevocationInfo {
                reason,
                revoked_at,
                invalidity_at: None,
            });
            cert.last_update = Utc::now();
            let revoked = cert.clone();
            if delta_cache {
                state.cache_serial(serial);
            }
            Ok(Some(revoked))
        })
    }

    fn unrevoke_cert(
        &self,
        ca: &CaIdentity,
        serial: Serial,
        force: bool,
        delta_cache: bool,
    ) -> KilnResult<Option<CertRecord>> {
        self.with_ca_mut(ca, |state| {
            let cert = match state.cert_mut(serial) {
                Some(cert) => cert,
                None => return Ok(None),
            };
            match &cert.revocation {
                None => return Ok(None),
                // non-hold revocations are permanent, lifting is a no-op
                Some(rev) if rev.reason != CrlReason::CertificateHold && !force => {
                    return Ok(None);
                }
                Some(_) => {}
            }
            cert.status = CertStatus::Valid;
            cert.revocation = None;
            cert.last_update = Utc::now();
            let unrevoked = cert.clone();
            if delta_cache {
                state.cache_serial(serial);
            }
            Ok(Some(unrevoked))
        })
    }

    fn remove_cert(&self, ca: &CaIdentity, serial: Serial) -> KilnResult<Option<CertRecord>> {
        self.with_ca_mut(ca, |state| {
            match state.certs.iter().position(|c| c.serial == serial) {
                Some(pos) => {
                    let mut removed = state.certs.remove(pos);
                    removed.status = CertStatus::Removed;
                    Ok(Some(removed))
                }
                None => Ok(None),
            }
        })
    }

    fn get_revoked_certs(
        &self,
        ca: &CaIdentity,
        not_expired_at: Option<DateTime<Utc>>,
        start_id: i64,
        limit: usize,
    ) -> KilnResult<Vec<RevokedCertEntry>> {
        self.with_ca(ca, |state| {
            Ok(state
                .certs
                .iter()
                .filter(|c| c.id > start_id)
                .filter(|c| {
                    matches!(c.status, CertStatus::Revoked | CertStatus::Suspended)
                })
                .filter(|c| not_expired_at.map(|t| c.not_after >= t).unwrap_or(true))
                .take(limit)
                .filter_map(|c| {
                    c.revocation.clone().map(|revocation| RevokedCertEntry {
                        id: c.id,
                        serial: c.serial,
                        kind: c.kind,
                        revocation,
                    })
                })
                .collect())
        })
    }

    fn get_delta_crl_cache(
        &self,
        ca: &CaIdentity,
        start_id: i64,
        limit: usize,
    ) -> KilnResult<Vec<(i64, Serial)>> {
        self.with_ca(ca, |state| {
            Ok(state
                .delta_cache
                .iter()
                .filter(|(id, _)| *id > start_id)
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn max_delta_crl_cache_id(&self, ca: &CaIdentity) -> KilnResult<i64> {
        self.with_ca(ca, |state| {
            Ok(state.delta_cache.iter().map(|(id, _)| *id).max().unwrap_or(0))
        })
    }

    fn clear_delta_crl_cache(&self, ca: &CaIdentity, up_to_id: i64) -> KilnResult<()> {
        self.with_ca_mut(ca, |state| {
            state.delta_cache.retain(|(id, _)| *id > up_to_id);
            Ok(())
        })
    }

    fn get_valid_certs(
        &self,
        ca: &CaIdentity,
        not_expired_at: Option<DateTime<Utc>>,
        start_id: i64,
        limit: usize,
    ) -> KilnResult<Vec<CertRecord>> {
        self.with_ca(ca, |state| {
            Ok(state
                .certs
                .iter()
                .filter(|c| c.id > start_id && c.status == CertStatus::Valid)
                .filter(|c| not_expired_at.map(|t| c.not_after >= t).unwrap_or(true))
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn expired_serials(
        &self,
        ca: &CaIdentity,
        expired_at: DateTime<Utc>,
        limit: usize,
    ) -> KilnResult<Vec<Serial>> {
        self.with_ca(ca, |state| {
            Ok(state
                .certs
                .iter()
                .filter(|c| c.not_after < expired_at)
                .take(limit)
                .map(|c| c.serial)
                .collect())
        })
    }

    fn suspended_serials(
        &self,
        ca: &CaIdentity,
        unchanged_since: DateTime<Utc>,
        limit: usize,
    ) -> KilnResult<Vec<Serial>> {
        self.with_ca(ca, |state| {
            Ok(state
                .certs
                .iter()
                .filter(|c| c.status == CertStatus::Suspended)
                .filter(|c| c.last_update <= unchanged_since)
                .take(limit)
                .map(|c| c.serial)
                .collect())
        })
    }

    fn add_crl(&self, ca: &CaIdentity, crl: CrlRecord) -> KilnResult<()> {
        self.with_ca_mut(ca, |state| {
            state.crls.push(crl);
            Ok(())
        })
    }

    fn get_crl(&self, ca: &CaIdentity, number: Option<u64>) -> KilnResult<Option<CrlRecord>> {
        self.with_ca(ca, |state| match number {
            Some(number) => Ok(state.crls.iter().find(|c| c.number == number).cloned()),
            None => Ok(state.crls.iter().max_by_key(|c| c.number).cloned()),
        })
    }

    fn this_update_of_current_crl(
        &self,
        ca: &CaIdentity,
    ) -> KilnResult<Option<DateTime<Utc>>> {
        self.with_ca(ca, |state| {
            Ok(state
                .crls
                .iter()
                .max_by_key(|c| c.number)
                .map(|c| c.this_update))
        })
    }

    fn has_crl(&self, ca: &CaIdentity) -> KilnResult<bool> {
        self.with_ca(ca, |state| Ok(!state.crls.is_empty()))
    }

    fn cleanup_crls(&self, ca: &CaIdentity, keep: u32) -> KilnResult<()> {
        self.with_ca_mut(ca, |state| {
            if state.crls.len() > keep as usize {
                state.crls.sort_by_key(|c| c.number);
                let excess = state.crls.len() - keep as usize;
                state.crls.drain(..excess);
            }
            Ok(())
        })
    }

    fn enqueue_publish(&self, entry: PublishQueueEntry) -> KilnResult<()> {
        let mut queue = self.queue.lock().map_err(|_| Error::store("lock poisoned"))?;
        if !queue.contains(&entry) {
            queue.push(entry);
        }
        Ok(())
    }

    fn publish_queue_entries(
        &self,
        publisher: &str,
        ca: &CaIdentity,
        limit: usize,
    ) -> KilnResult<Vec<PublishQueueEntry>> {
        let queue = self.queue.lock().map_err(|_| Error::store("lock poisoned"))?;
        Ok(queue
            .iter()
            .filter(|e| e.publisher == publisher && e.ca_id == ca.id)
            .take(limit)
            .cloned()
            .collect())
    }

    fn remove_publish_entry(&self, entry: &PublishQueueEntry) -> KilnResult<()> {
        let mut queue = self.queue.lock().map_err(|_| Error::store("lock poisoned"))?;
        queue.retain(|e| e != entry);
        Ok(())
    }

    fn clear_publish_queue(
        &self,
        publisher: Option<&str>,
        ca: &CaIdentity,
    ) -> KilnResult<()> {
        let mut queue = self.queue.lock().map_err(|_| Error::store("lock poisoned"))?;
        queue.retain(|e| {
            e.ca_id != ca.id || publisher.map(|p| e.publisher != p).unwrap_or(false)
        });
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use bytes::Bytes;

    use super::*;
    use crate::api::{CertKind, Fingerprint, PublicKey};

    fn ca() -> CaIdentity {
        CaIdentity::new(1, "root")
    }

    fn record(serial: Serial, cn: &str) -> CertRecord {
        let subject = Name::common_name(cn);
        let key = PublicKey::Rsa {
            modulus: vec![0xc1, 0x01, serial.0 as u8],
            exponent: vec![0x01, 0x00, 0x01],
        };
        CertRecord {
            id: 0,
            serial,
            kind: CertKind::EndEntity,
            subject_fp: subject.fingerprint(),
            subject,
            key_fp: key.fingerprint(),
            public_key: key,
            profile: "tls-server".to_string(),
            not_before: Utc::now(),
            not_after: Utc::now() + chrono::Duration::days(30),
            cert: Bytes::from_static(b"cert"),
            status: CertStatus::Valid,
            revocation: None,
            last_update: Utc::now(),
        }
    }

    #[test]
    fn serials_are_unique_under_contention() {
        let store = Arc::new(MemStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..200 {
                    seen.push(store.next_serial(&ca()).unwrap());
                }
                seen
            }));
        }
        let mut all = HashSet::new();
        for handle in handles {
            for serial in handle.join().unwrap() {
                assert!(all.insert(serial), "serial {} allocated twice", serial);
            }
        }
        assert_eq!(all.len(), 8 * 200);
    }

    #[test]
    fn revoke_is_idempotent_for_same_reason_only() {
        let store = MemStore::new();
        let rec = store.add_cert(&ca(), record(Serial(1), "a")).unwrap();
        let rev = RevocationInfo::new(CrlReason::KeyCompromise, None);

        let first = store
            .revoke_cert(&ca(), rec.serial, rev.clone(), false, false)
            .unwrap();
        assert!(first.is_some());
        assert_eq!(first.unwrap().status, CertStatus::Revoked);

        // same reason again is a silent no-op
        let again = store
            .revoke_cert(&ca(), rec.serial, rev, false, false)
            .unwrap();
        assert!(again.is_none());

        // differing reason is rejected
        let other = RevocationInfo::new(CrlReason::Superseded, None);
        assert!(store
            .revoke_cert(&ca(), rec.serial, other.clone(), false, false)
            .is_err());

        // unless forced
        let forced = store
            .revoke_cert(&ca(), rec.serial, other, true, false)
            .unwrap();
        assert_eq!(
            forced.unwrap().revocation.unwrap().reason,
            CrlReason::Superseded
        );
    }

    #[test]
    fn hold_is_the_only_reversible_revocation() {
        let store = MemStore::new();
        let held = store.add_cert(&ca(), record(Serial(1), "held")).unwrap();
        let gone = store.add_cert(&ca(), record(Serial(2), "gone")).unwrap();

        store
            .revoke_cert(
                &ca(),
                held.serial,
                RevocationInfo::new(CrlReason::CertificateHold, None),
                false,
                false,
            )
            .unwrap();
        store
            .revoke_cert(
                &ca(),
                gone.serial,
                RevocationInfo::new(CrlReason::KeyCompromise, None),
                false,
                false,
            )
            .unwrap();

        let lifted = store.unrevoke_cert(&ca(), held.serial, false, false).unwrap();
        assert_eq!(lifted.unwrap().status, CertStatus::Valid);

        // lifting a permanent revocation quietly does nothing
        assert!(store
            .unrevoke_cert(&ca(), gone.serial, false, false)
            .unwrap()
            .is_none());
        assert_eq!(
            store.get_cert(&ca(), gone.serial).unwrap().unwrap().status,
            CertStatus::Revoked
        );
        let forced = store.unrevoke_cert(&ca(), gone.serial, true, false).unwrap();
        assert_eq!(forced.unwrap().status, CertStatus::Valid);
    }

    #[test]
    fn revoked_pages_are_id_ordered() {
        let store = MemStore::new();
        for i in 1..=10u128 {
            let rec = store
                .add_cert(&ca(), record(Serial(i), &format!("s{}", i)))
                .unwrap();
            store
                .revoke_cert(
                    &ca(),
                    rec.serial,
                    RevocationInfo::new(CrlReason::Unspecified, None),
                    false,
                    false,
                )
                .unwrap();
        }
        let page1 = store.get_revoked_certs(&ca(), None, 0, 4).unwrap();
        assert_eq!(page1.len(), 4);
        let last = page1.last().unwrap().id;
        let page2 = store.get_revoked_certs(&ca(), None, last, 4).unwrap();
        assert!(page2.iter().all(|e| e.id > last));
        let ids: Vec<i64> = page2.iter().map(|e| e.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn delta_cache_records_and_clears() {
        let store = MemStore::new();
        let rec = store.add_cert(&ca(), record(Serial(7), "d")).unwrap();
        store
            .revoke_cert(
                &ca(),
                rec.serial,
                RevocationInfo::new(CrlReason::CertificateHold, None),
                false,
                true,
            )
            .unwrap();
        store.unrevoke_cert(&ca(), rec.serial, false, true).unwrap();

        let entries = store.get_delta_crl_cache(&ca(), 0, 10).unwrap();
        assert_eq!(entries.len(), 2);
        let max = store.max_delta_crl_cache_id(&ca()).unwrap();
        assert_eq!(max, 2);

        store.clear_delta_crl_cache(&ca(), max).unwrap();
        assert!(store.get_delta_crl_cache(&ca(), 0, 10).unwrap().is_empty());
    }

    #[test]
    fn subject_serial_suffix_lookup() {
        let store = MemStore::new();
        let base = Name::common_name("dup");
        for (i, sn) in [3u64, 17, 5].iter().enumerate() {
            let mut rec = record(Serial(i as u128 + 1), "dup");
            rec.subject = base.with_serial_number(*sn);
            rec.subject_fp = rec.subject.fingerprint();
            store.add_cert(&ca(), rec).unwrap();
        }
        assert_eq!(
            store.latest_subject_serial_suffix(&ca(), &base).unwrap(),
            Some(17)
        );
        assert_eq!(
            store
                .latest_subject_serial_suffix(&ca(), &Name::common_name("other"))
                .unwrap(),
            None
        );
    }

    #[test]
    fn crl_retention() {
        let store = MemStore::new();
        for number in 1..=5u64 {
            store
                .add_crl(
                    &ca(),
                    CrlRecord {
                        number,
                        this_update: Utc::now(),
                        next_update: None,
                        delta: false,
                        crl: Bytes::from_static(b"crl"),
                    },
                )
                .unwrap();
        }
        store.cleanup_crls(&ca(), 2).unwrap();
        assert!(store.get_crl(&ca(), Some(3)).unwrap().is_none());
        assert!(store.get_crl(&ca(), Some(4)).unwrap().is_some());
        assert_eq!(store.get_crl(&ca(), None).unwrap().unwrap().number, 5);
    }

    #[test]
    fn publish_queue_round_trip() {
        let store = MemStore::new();
        let entry = PublishQueueEntry {
            publisher: "ocsp".to_string(),
            cert_id: 1,
            ca_id: 1,
        };
        store.enqueue_publish(entry.clone()).unwrap();
        store.enqueue_publish(entry.clone()).unwrap();
        assert_eq!(
            store.publish_queue_entries("ocsp", &ca(), 10).unwrap().len(),
            1
        );
        store.remove_publish_entry(&entry).unwrap();
        assert!(store.publish_queue_entries("ocsp", &ca(), 10).unwrap().is_empty());
    }
}
