//! The CA engine proper.
//!
//! A [`Ca`] value binds the CA certificate, the policy configuration, the
//! store, signing capacity and the registered publishers. All issuance,
//! revocation and maintenance operations live here; CRL generation is in
//! the neighbouring `crl` module.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use log::{error, info, warn};
use uuid::Uuid;

use crate::api::{
    CaCertData, CaIdentity, CertInfo, CertRecord, CertStatus, CertTemplate, CrlReason,
    CrlRecord, KeypairGenControl, PublicKey, PublishQueueEntry, RequestType, RequestorInfo,
    RevocationInfo, Serial, TbsCertificate,
};
use crate::commons::audit::{AuditEvent, AuditSink};
use crate::commons::crypto::{CertSigner, KeypairGenerator, SignerPool};
use crate::commons::store::CertStore;
use crate::commons::{Error, ErrorWithIndex, KilnResult};
use crate::config::{CaConfig, CrlUpdateMode};
use crate::constants::PUBLISH_QUEUE_PAGE_SIZE;
use crate::server::ca::dedup::{DedupGuard, InFlightMarker};
use crate::server::ca::grant::GrantedTemplate;
use crate::server::ca::profile::CertProfile;
use crate::server::publishers::Publisher;

//------------ HealthStatus --------------------------------------------------

#[derive(Clone, Debug)]
pub struct HealthStatus {
    pub store: bool,
    pub signer: bool,
    pub crl_signer: Option<bool>,
    pub publishers: Vec<(String, bool)>,
}

impl HealthStatus {
    pub fn healthy(&self) -> bool {
        self.store
            && self.signer
            && self.crl_signer.unwrap_or(true)
            && self.publishers.iter().all(|(_, healthy)| *healthy)
    }
}

//------------ Ca ------------------------------------------------------------

pub struct Ca {
    pub(crate) ident: CaIdentity,
    pub(crate) config: CaConfig,
    pub(crate) ca_cert: CaCertData,
    pub(crate) revocation: RwLock<Option<RevocationInfo>>,
    pub(crate) profiles: RwLock<HashMap<String, Arc<CertProfile>>>,
    pub(crate) store: Arc<dyn CertStore>,
    pub(crate) signer: Arc<SignerPool>,
    pub(crate) crl_signer: Option<Arc<SignerPool>>,
    pub(crate) keygen: Arc<dyn KeypairGenerator>,
    pub(crate) publishers: RwLock<Vec<Arc<dyn Publisher>>>,
    pub(crate) audit: Arc<dyn AuditSink>,
    pub(crate) dedup: DedupGuard,
    pub(crate) crl_gen_in_process: AtomicBool,
    pub(crate) inherited_keypair_gen: Option<KeypairGenControl>,
}

impl Ca {
    pub fn new(
        ident: CaIdentity,
        config: CaConfig,
        ca_cert: CaCertData,
        store: Arc<dyn CertStore>,
        signer: Arc<SignerPool>,
        keygen: Arc<dyn KeypairGenerator>,
        audit: Arc<dyn AuditSink>,
    ) -> KilnResult<Self> {
        config.validate()?;
        let inherited_keypair_gen = inherit_control(&ca_cert.public_key);
        Ok(Ca {
            ident,
            config,
            ca_cert,
            revocation: RwLock::new(None),
            profiles: RwLock::new(HashMap::new()),
            store,
            signer,
            crl_signer: None,
            keygen,
            publishers: RwLock::new(Vec::new()),
            audit,
            dedup: DedupGuard::default(),
            crl_gen_in_process: AtomicBool::new(false),
            inherited_keypair_gen,
        })
    }

    /// Uses a dedicated signer pool for CRLs instead of the CA signer.
    pub fn with_crl_signer(mut self, crl_signer: Arc<SignerPool>) -> Self {
        self.crl_signer = Some(crl_signer);
        self
    }

    pub fn ident(&self) -> &CaIdentity {
        &self.ident
    }

    pub fn ca_cert(&self) -> &CaCertData {
        &self.ca_cert
    }

    pub fn add_profile(&self, profile: CertProfile) -> KilnResult<()> {
        let mut profiles = self
            .profiles
            .write()
            .map_err(|_| Error::system("profile lock poisoned"))?;
        profiles.insert(profile.name.clone(), Arc::new(profile));
        Ok(())
    }

    pub fn supports_certprofile(&self, name: &str) -> bool {
        self.profiles
            .read()
            .map(|profiles| profiles.contains_key(name))
            .unwrap_or(false)
    }

    /// Registers a publisher and hands it the CA certificate.
    pub fn add_publisher(&self, publisher: Arc<dyn Publisher>) -> KilnResult<()> {
        publisher
            .ca_added(&self.ca_cert.cert)
            .map_err(|e| Error::system(format!("publisher {}: {}", publisher.ident(), e)))?;
        let mut publishers = self
            .publishers
            .write()
            .map_err(|_| Error::system("publisher lock poisoned"))?;
        publishers.push(publisher);
        Ok(())
    }

    pub fn is_revoked(&self) -> bool {
        self.revocation
            .read()
            .map(|rev| rev.is_some())
            .unwrap_or(true)
    }

    pub fn revocation(&self) -> Option<RevocationInfo> {
        self.revocation.read().ok().and_then(|rev| rev.clone())
    }

    //--- issuance

    pub fn issue_one(
        &self,
        template: &CertTemplate,
        requestor: &RequestorInfo,
        req_type: RequestType,
    ) -> KilnResult<CertInfo> {
        self.issue_single(template, requestor, req_type, false)
    }

    /// Issues against an existing certificate. When subject and key both
    /// match an issued certificate, that certificate is returned instead
    /// of a fresh one.
    pub fn renew_one(
        &self,
        template: &CertTemplate,
        requestor: &RequestorInfo,
        req_type: RequestType,
    ) -> KilnResult<CertInfo> {
        self.issue_single(template, requestor, req_type, true)
    }

    pub fn issue_batch(
        &self,
        templates: &[CertTemplate],
        requestor: &RequestorInfo,
        req_type: RequestType,
    ) -> Result<Vec<CertInfo>, ErrorWithIndex> {
        self.issue_many(templates, requestor, req_type, false)
    }

    pub fn renew_batch(
        &self,
        templates: &[CertTemplate],
        requestor: &RequestorInfo,
        req_type: RequestType,
    ) -> Result<Vec<CertInfo>, ErrorWithIndex> {
        self.issue_many(templates, requestor, req_type, true)
    }

    fn issue_single(
        &self,
        template: &CertTemplate,
        requestor: &RequestorInfo,
        req_type: RequestType,
        update: bool,
    ) -> KilnResult<CertInfo> {
        let mut event = AuditEvent::start(
            &self.ident.name,
            if update { "renew_cert" } else { "issue_cert" },
        );
        event.add("profile", &template.profile);
        event.add("requested_subject", &template.subject);
        event.add("requestor", &requestor.name);

        let result = (|| {
            let _markers = self.claim_markers(template)?;
            let granted = self.adjudicate(template, requestor, update)?;
            if let Some(existing) = granted.reuse.clone() {
                return Ok(CertInfo {
                    record: existing,
                    private_key: None,
                    already_issued: true,
                    warning: granted.warning,
                    requestor: requestor.name.clone(),
                    req_type,
                    txn_id: None,
                });
            }
            self.issue_granted(granted, requestor, req_type)
        })();

        match &result {
            Ok(info) => {
                event.add("serial", info.record.serial);
                event.add("already_issued", info.already_issued);
            }
            Err(e) => event.add("error", e),
        }
        self.audit.record(&event, result.is_ok());
        result
    }

    /// All-or-nothing batch. On failure, already issued certificates are
    /// removed again on a best-effort basis and the error names the
    /// failing request.
    fn issue_many(
        &self,
        templates: &[CertTemplate],
        requestor: &RequestorInfo,
        req_type: RequestType,
        update: bool,
    ) -> Result<Vec<CertInfo>, ErrorWithIndex> {
        let mut markers: Vec<InFlightMarker> = Vec::new();
        let mut adjudicated: Vec<GrantedTemplate> = Vec::new();
        for (index, template) in templates.iter().enumerate() {
            let claimed = self
                .claim_markers(template)
                .map_err(|e| ErrorWithIndex::new(index, e))?;
            markers.extend(claimed);
            adjudicated.push(
                self.adjudicate(template, requestor, update)
                    .map_err(|e| ErrorWithIndex::new(index, e))?,
            );
        }

        let mut issued: Vec<CertInfo> = Vec::new();
        for (index, granted) in adjudicated.into_iter().enumerate() {
            let result = match granted.reuse.clone() {
                Some(existing) => Ok(CertInfo {
                    record: existing,
                    private_key: None,
                    already_issued: true,
                    warning: granted.warning,
                    requestor: requestor.name.clone(),
                    req_type,
                    txn_id: None,
                }),
                None => self.issue_granted(granted, requestor, req_type),
            };
            match result {
                Ok(info) => issued.push(info),
                Err(error) => {
                    warn!(
                        "ca {}: batch issuance failed at request {}, rolling back {} certificates",
                        self.ident,
                        index,
                        issued.len()
                    );
                    self.rollback(&issued);
                    return Err(ErrorWithIndex::new(index, error));
                }
            }
        }
        Ok(issued)
    }

    /// Takes in-process markers for the request's key and subject, but
    /// only where policy forbids duplicates. With duplicates permitted
    /// there is nothing to protect and concurrent requests may overlap.
    fn claim_markers(&self, template: &CertTemplate) -> KilnResult<Vec<InFlightMarker>> {
        let mut markers = Vec::new();
        if !self.config.duplicate_key_permitted {
            if let Some(key) = &template.public_key {
                markers.push(self.dedup.keys.try_acquire(key.fingerprint()).ok_or_else(
                    || {
                        Error::already_issued(
                            "a request with this public key is already in process",
                        )
                    },
                )?);
            }
        }
        if !self.config.duplicate_subject_permitted {
            let subject_fp = template.subject.strip_empty_rdns().fingerprint();
            markers.push(self.dedup.subjects.try_acquire(subject_fp).ok_or_else(
                || {
                    Error::already_issued(
                        "a request with this subject is already in process",
                    )
                },
            )?);
        }
        Ok(markers)
    }

    fn issue_granted(
        &self,
        granted: GrantedTemplate,
        requestor: &RequestorInfo,
        req_type: RequestType,
    ) -> KilnResult<CertInfo> {
        let serial = self.store.next_serial(&self.ident)?;
        let tbs = TbsCertificate {
            issuer: self.ca_cert.subject.clone(),
            serial,
            not_before: granted.not_before,
            not_after: granted.not_after,
            subject: granted.granted_subject.clone(),
            public_key: granted.public_key.clone(),
            extensions: granted.extensions.clone(),
        };

        let signed = {
            let signer = self.signer.borrow()?;
            signer.sign_cert(&tbs).map_err(Error::signer)?
        };
        if !self.signer.verify(&signed, &self.ca_cert.public_key) {
            return Err(Error::system(format!(
                "self-check of freshly signed certificate {} failed",
                serial
            )));
        }
        if let Some(max) = granted.profile.max_cert_size {
            if signed.len() > max {
                return Err(Error::not_permitted(format!(
                    "certificate size {} exceeds the profile limit of {}",
                    signed.len(),
                    max
                )));
            }
        }

        let record = self.store.add_cert(
            &self.ident,
            CertRecord {
                id: 0,
                serial,
                kind: granted.profile.kind,
                subject: granted.granted_subject.clone(),
                subject_fp: granted.subject_fp,
                key_fp: granted.key_fp,
                public_key: granted.public_key.clone(),
                profile: granted.profile.name.clone(),
                not_before: granted.not_before,
                not_after: granted.not_after,
                cert: signed,
                status: CertStatus::Valid,
                revocation: None,
                last_update: Utc::now(),
            },
        )?;

        info!(
            "ca {}: issued certificate {} for '{}' under profile {}",
            self.ident, serial, granted.granted_subject, granted.profile.name
        );
        self.publish_cert(&record);

        Ok(CertInfo {
            record,
            private_key: granted.private_key,
            already_issued: false,
            warning: granted.warning,
            requestor: requestor.name.clone(),
            req_type,
            txn_id: Some(Uuid::new_v4()),
        })
    }

    fn rollback(&self, issued: &[CertInfo]) {
        for info in issued {
            if info.already_issued {
                continue;
            }
            match self.store.remove_cert(&self.ident, info.record.serial) {
                Ok(Some(removed)) => {
                    for publisher in self.publisher_list() {
                        if let Err(e) = publisher.certificate_removed(&removed) {
                            warn!(
                                "ca {}: rollback of certificate {} not confirmed by publisher {}: {}",
                                self.ident,
                                removed.serial,
                                publisher.ident(),
                                e
                            );
                        }
                    }
                }
                Ok(None) => warn!(
                    "ca {}: certificate {} was gone during rollback",
                    self.ident, info.record.serial
                ),
                Err(e) => error!(
                    "ca {}: rollback of certificate {} failed: {}",
                    self.ident, info.record.serial, e
                ),
            }
        }
    }

    //--- revocation

    pub fn revoke_cert(
        &self,
        serial: Serial,
        reason: CrlReason,
        invalidity: Option<chrono::DateTime<Utc>>,
    ) -> KilnResult<Option<CertRecord>> {
        let mut event = AuditEvent::start(&self.ident.name, "revoke_cert");
        event.add("serial", serial);
        event.add("reason", reason);
        let result = self.revoke_cert_inner(serial, reason, invalidity);
        self.audit.record(&event, result.is_ok());
        result
    }

    fn revoke_cert_inner(
        &self,
        serial: Serial,
        reason: CrlReason,
        invalidity: Option<chrono::DateTime<Utc>>,
    ) -> KilnResult<Option<CertRecord>> {
        if serial == self.ca_cert.serial {
            return Err(Error::not_permitted(
                "the CA certificate must be revoked through CA revocation",
            ));
        }
        if !reason.permitted_in_request() {
            return Err(Error::not_permitted(format!(
                "reason {} is not permitted in a revocation request",
                reason
            )));
        }
        let revocation = RevocationInfo {
            reason,
            revoked_at: Utc::now(),
            invalidity_at: invalidity,
        };
        let revoked = self.store.revoke_cert(
            &self.ident,
            serial,
            revocation.clone(),
            false,
            self.publish_to_delta_cache(),
        )?;
        if let Some(record) = &revoked {
            info!(
                "ca {}: revoked certificate {} with reason {}",
                self.ident, serial, reason
            );
            self.fan_out(|publisher| publisher.certificate_revoked(record, &revocation), record.id);
        }
        Ok(revoked)
    }

    /// Lifts a certificateHold suspension.
    pub fn unrevoke_cert(&self, serial: Serial) -> KilnResult<Option<CertRecord>> {
        let mut event = AuditEvent::start(&self.ident.name, "unrevoke_cert");
        event.add("serial", serial);
        let result = (|| {
            if serial == self.ca_cert.serial {
                return Err(Error::not_permitted(
                    "the CA certificate must be unrevoked through CA unrevocation",
                ));
            }
            let unrevoked = self.store.unrevoke_cert(
                &self.ident,
                serial,
                false,
                self.publish_to_delta_cache(),
            )?;
            if let Some(record) = &unrevoked {
                info!("ca {}: unrevoked certificate {}", self.ident, serial);
                self.fan_out(|publisher| publisher.certificate_unrevoked(record), record.id);
            }
            Ok(unrevoked)
        })();
        self.audit.record(&event, result.is_ok());
        result
    }

    /// Turns a suspension into a permanent revocation.
    pub fn revoke_suspended(
        &self,
        serial: Serial,
        reason: CrlReason,
    ) -> KilnResult<Option<CertRecord>> {
        if !reason.permitted_in_request() || reason == CrlReason::CertificateHold {
            return Err(Error::not_permitted(format!(
                "reason {} is not a valid target for revoking a suspension",
                reason
            )));
        }
        let revoked = self.store.revoke_suspended_cert(
            &self.ident,
            serial,
            reason,
            self.publish_to_delta_cache(),
        )?;
        if let Some(record) = &revoked {
            if let Some(revocation) = record.revocation.clone() {
                info!(
                    "ca {}: suspended certificate {} permanently revoked with reason {}",
                    self.ident, serial, reason
                );
                self.fan_out(
                    |publisher| publisher.certificate_revoked(record, &revocation),
                    record.id,
                );
            }
        }
        Ok(revoked)
    }

    /// Removes a certificate for good. Every publisher must confirm the
    /// removal first; otherwise the certificate is retained and `None`
    /// returned.
    pub fn remove_cert(&self, serial: Serial) -> KilnResult<Option<CertRecord>> {
        let mut event = AuditEvent::start(&self.ident.name, "remove_cert");
        event.add("serial", serial);
        let result = (|| {
            let record = match self.store.get_cert(&self.ident, serial)? {
                Some(record) => record,
                None => return Ok(None),
            };
            let mut confirmed = true;
            for publisher in self.publisher_list() {
                if let Err(e) = publisher.certificate_removed(&record) {
                    warn!(
                        "ca {}: publisher {} did not confirm removal of {}: {}",
                        self.ident,
                        publisher.ident(),
                        serial,
                        e
                    );
                    confirmed = false;
                }
            }
            if !confirmed {
                warn!(
                    "ca {}: certificate {} retained, removal unconfirmed",
                    self.ident, serial
                );
                return Ok(None);
            }
            self.store.remove_cert(&self.ident, serial)
        })();
        self.audit.record(&event, result.is_ok());
        result
    }

    /// Revokes the CA itself. Issuance is refused afterwards. The state
    /// change is committed before publishers are notified; a publisher
    /// failure therefore surfaces as a system failure with the CA already
    /// revoked.
    pub fn revoke_ca(
        &self,
        reason: CrlReason,
        invalidity: Option<chrono::DateTime<Utc>>,
    ) -> KilnResult<()> {
        let mut event = AuditEvent::start(&self.ident.name, "revoke_ca");
        event.add("reason", reason);
        let result = (|| {
            if reason == CrlReason::RemoveFromCrl {
                return Err(Error::not_permitted(
                    "removeFromCRL cannot be used to revoke a CA",
                ));
            }
            let revocation = RevocationInfo {
                reason,
                revoked_at: Utc::now(),
                invalidity_at: invalidity,
            };
            {
                let mut state = self
                    .revocation
                    .write()
                    .map_err(|_| Error::system("revocation lock poisoned"))?;
                if let Some(existing) = state.as_ref() {
                    return Err(Error::not_permitted(format!(
                        "CA {} is already revoked with reason {}",
                        self.ident, existing.reason
                    )));
                }
                *state = Some(revocation.clone());
            }
            warn!("ca {}: CA revoked with reason {}", self.ident, reason);
            if self.config.self_signed {
                // the CA certificate is one of its own records
                if let Some(record) = self.store.revoke_cert(
                    &self.ident,
                    self.ca_cert.serial,
                    revocation.clone(),
                    true,
                    self.publish_to_delta_cache(),
                )? {
                    self.fan_out(
                        |publisher| publisher.certificate_revoked(&record, &revocation),
                        record.id,
                    );
                }
            }
            for publisher in self.publisher_list() {
                publisher
                    .ca_revoked(self.ca_cert.serial, &revocation)
                    .map_err(|e| {
                        Error::system(format!(
                            "CA revocation committed but publisher {} failed: {}",
                            publisher.ident(),
                            e
                        ))
                    })?;
            }
            Ok(())
        })();
        self.audit.record(&event, result.is_ok());
        result
    }

    pub fn unrevoke_ca(&self) -> KilnResult<()> {
        let mut event = AuditEvent::start(&self.ident.name, "unrevoke_ca");
        let result = (|| {
            {
                let mut state = self
                    .revocation
                    .write()
                    .map_err(|_| Error::system("revocation lock poisoned"))?;
                if state.is_none() {
                    return Err(Error::not_permitted(format!(
                        "CA {} is not revoked",
                        self.ident
                    )));
                }
                *state = None;
            }
            info!("ca {}: CA revocation lifted", self.ident);
            if self.config.self_signed {
                if let Some(record) = self.store.unrevoke_cert(
                    &self.ident,
                    self.ca_cert.serial,
                    true,
                    self.publish_to_delta_cache(),
                )? {
                    self.fan_out(
                        |publisher| publisher.certificate_unrevoked(&record),
                        record.id,
                    );
                }
            }
            for publisher in self.publisher_list() {
                publisher.ca_unrevoked(self.ca_cert.serial).map_err(|e| {
                    Error::system(format!(
                        "CA unrevocation committed but publisher {} failed: {}",
                        publisher.ident(),
                        e
                    ))
                })?;
            }
            Ok(())
        })();
        self.audit.record(&event, result.is_ok());
        result
    }

    //--- publication

    /// Hands a fresh certificate to the publishers. Synchronous ones are
    /// called inline and fall back to the queue on failure; asynchronous
    /// ones always go through the queue.
    fn publish_cert(&self, record: &CertRecord) {
        for publisher in self.publisher_list() {
            if publisher.is_async() {
                self.enqueue(publisher.ident(), record.id);
                continue;
            }
            if !publisher.publishes_good_certs() {
                continue;
            }
            if let Err(e) = publisher.certificate_added(record) {
                warn!(
                    "ca {}: publisher {} failed for certificate {}, queued: {}",
                    self.ident,
                    publisher.ident(),
                    record.serial,
                    e
                );
                self.enqueue(publisher.ident(), record.id);
            }
        }
    }

    fn fan_out<F>(&self, call: F, cert_id: i64)
    where
        F: Fn(&dyn Publisher) -> Result<(), crate::server::publishers::PublisherError>,
    {
        for publisher in self.publisher_list() {
            if publisher.is_async() {
                self.enqueue(publisher.ident(), cert_id);
                continue;
            }
            if let Err(e) = call(publisher.as_ref()) {
                warn!(
                    "ca {}: publisher {} failed, event queued: {}",
                    self.ident,
                    publisher.ident(),
                    e
                );
                self.enqueue(publisher.ident(), cert_id);
            }
        }
    }

    fn enqueue(&self, publisher: &str, cert_id: i64) {
        let entry = PublishQueueEntry {
            publisher: publisher.to_string(),
            cert_id,
            ca_id: self.ident.id,
        };
        if let Err(e) = self.store.enqueue_publish(entry) {
            error!(
                "ca {}: could not queue publication for {}: {}",
                self.ident, publisher, e
            );
        }
    }

    pub(crate) fn publisher_list(&self) -> Vec<Arc<dyn Publisher>> {
        self.publishers
            .read()
            .map(|publishers| publishers.clone())
            .unwrap_or_default()
    }

    /// Replays queued publications. Entries are removed only after the
    /// publisher confirmed them; a failing publisher stops its own queue
    /// and leaves the rest untouched.
    pub fn publish_certs_in_queue(&self) -> KilnResult<usize> {
        let mut published = 0;
        'publishers: for publisher in self.publisher_list() {
            loop {
                let entries = self.store.publish_queue_entries(
                    publisher.ident(),
                    &self.ident,
                    PUBLISH_QUEUE_PAGE_SIZE,
                )?;
                if entries.is_empty() {
                    break;
                }
                let page_len = entries.len();
                for entry in entries {
                    let record = match self.store.get_cert_by_id(&self.ident, entry.cert_id)? {
                        Some(record) => record,
                        None => {
                            // removed meanwhile, nothing left to publish
                            self.store.remove_publish_entry(&entry)?;
                            continue;
                        }
                    };
                    let result = match (&record.status, &record.revocation) {
                        (CertStatus::Revoked | CertStatus::Suspended, Some(revocation)) => {
                            publisher.certificate_revoked(&record, revocation)
                        }
                        _ if publisher.publishes_good_certs() => {
                            publisher.certificate_added(&record)
                        }
                        _ => Ok(()),
                    };
                    match result {
                        Ok(()) => {
                            self.store.remove_publish_entry(&entry)?;
                            published += 1;
                        }
                        Err(e) => {
                            warn!(
                                "ca {}: publisher {} still failing, queue kept: {}",
                                self.ident,
                                publisher.ident(),
                                e
                            );
                            continue 'publishers;
                        }
                    }
                }
                if page_len < PUBLISH_QUEUE_PAGE_SIZE {
                    break;
                }
            }
        }
        Ok(published)
    }

    pub fn clear_publish_queue(&self, publisher: Option<&str>) -> KilnResult<()> {
        self.store.clear_publish_queue(publisher, &self.ident)?;
        info!(
            "ca {}: cleared publish queue for {}",
            self.ident,
            publisher.unwrap_or("all publishers")
        );
        Ok(())
    }

    //--- maintenance

    pub fn health_check(&self) -> HealthStatus {
        HealthStatus {
            store: self.store.is_healthy(),
            signer: self.signer.is_healthy(),
            crl_signer: self.crl_signer.as_ref().map(|pool| pool.is_healthy()),
            publishers: self
                .publisher_list()
                .iter()
                .map(|publisher| (publisher.ident().to_string(), publisher.is_healthy()))
                .collect(),
        }
    }

    /// Removes certificates expired longer ago than the configured
    /// retention. Returns the number of certificates removed.
    pub fn purge_expired_certs(&self) -> KilnResult<usize> {
        let days = match self.config.keep_expired_certs_days {
            Some(days) => days,
            None => return Ok(0),
        };
        // one day of slack beyond the configured retention
        let cutoff = Utc::now() - chrono::Duration::days(days as i64 + 1);
        let mut event = AuditEvent::start(&self.ident.name, "purge_expired_certs");
        event.add("expired_before", cutoff);
        let result = (|| {
            let mut removed = 0;
            loop {
                let serials = self.store.expired_serials(
                    &self.ident,
                    cutoff,
                    crate::constants::STORE_PAGE_SIZE,
                )?;
                if serials.is_empty() {
                    break;
                }
                let mut progressed = false;
                for serial in serials {
                    if serial == self.ca_cert.serial {
                        continue;
                    }
                    if self.remove_cert(serial)?.is_some() {
                        removed += 1;
                        progressed = true;
                    }
                }
                if !progressed {
                    break;
                }
            }
            if removed > 0 {
                info!("ca {}: purged {} expired certificates", self.ident, removed);
            }
            Ok(removed)
        })();
        if let Ok(removed) = &result {
            event.add("removed", removed);
        }
        self.audit.record(&event, result.is_ok());
        result
    }

    /// Permanently revokes suspensions untouched for longer than the
    /// configured period. Returns the number of certificates revoked.
    pub fn revoke_suspended_sweep(&self) -> KilnResult<usize> {
        let control = match &self.config.revoke_suspended {
            Some(control) => control.clone(),
            None => return Ok(0),
        };
        let cutoff = Utc::now() - control.unchanged_since.duration();
        let mut event = AuditEvent::start(&self.ident.name, "revoke_suspended_certs");
        event.add("unchanged_since", cutoff);
        let result = (|| {
            let mut revoked = 0;
            loop {
                let serials = self.store.suspended_serials(
                    &self.ident,
                    cutoff,
                    crate::constants::STORE_PAGE_SIZE,
                )?;
                if serials.is_empty() {
                    break;
                }
                let mut progressed = false;
                for serial in serials {
                    if self
                        .revoke_suspended(serial, control.target_reason)?
                        .is_some()
                    {
                        revoked += 1;
                        progressed = true;
                    }
                }
                if !progressed {
                    break;
                }
            }
            if revoked > 0 {
                info!(
                    "ca {}: permanently revoked {} stale suspensions",
                    self.ident, revoked
                );
            }
            Ok(revoked)
        })();
        if let Ok(revoked) = &result {
            event.add("revoked", revoked);
        }
        self.audit.record(&event, result.is_ok());
        result
    }

    //--- lookups

    pub fn get_cert(&self, serial: Serial) -> KilnResult<Option<CertRecord>> {
        self.store.get_cert(&self.ident, serial)
    }

    pub fn current_crl(&self) -> KilnResult<Option<CrlRecord>> {
        self.store.get_crl(&self.ident, None)
    }

    pub fn crl(&self, number: u64) -> KilnResult<Option<CrlRecord>> {
        self.store.get_crl(&self.ident, Some(number))
    }

    /// Whether revocation changes must also be recorded in the delta-CRL
    /// cache: interval schedules with delta CRLs enabled.
    pub(crate) fn publish_to_delta_cache(&self) -> bool {
        self.config
            .crl_control
            .as_ref()
            .map(|control| {
                control.update_mode == CrlUpdateMode::Interval
                    && control.delta_crl_intervals > 0
                    && control.delta_crl_intervals < control.full_crl_intervals
            })
            .unwrap_or(false)
    }

    pub(crate) fn crl_signer_pool(&self) -> &Arc<SignerPool> {
        self.crl_signer.as_ref().unwrap_or(&self.signer)
    }

    pub(crate) fn crl_signer_key(&self) -> &PublicKey {
        self.crl_signer_pool().public_key()
    }
}

fn inherit_control(key: &PublicKey) -> Option<KeypairGenControl> {
    match key {
        PublicKey::Rsa { .. } => key
            .rsa_bits()
            .map(|key_size| KeypairGenControl::Rsa { key_size }),
        PublicKey::Ec { curve, .. } => Some(KeypairGenControl::Ec { curve: *curve }),
        PublicKey::Dsa { p, .. } => Some(KeypairGenControl::Dsa {
            key_size: p.len() as u32 * 8,
        }),
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::api::{AttrType, ValidityMode};
    use crate::test::{requestor, rsa_key, template, test_ca, test_ca_with};

    #[test]
    fn issue_and_fetch() {
        let setup = test_ca();
        let info = setup
            .ca
            .issue_one(&template("leaf", rsa_key(1)), &requestor(), RequestType::Rest)
            .unwrap();
        assert!(!info.already_issued);
        assert!(info.txn_id.is_some());
        assert!(info.private_key.is_none());

        let stored = setup.ca.get_cert(info.record.serial).unwrap().unwrap();
        assert_eq!(stored.status, CertStatus::Valid);
        assert_eq!(stored.subject, info.record.subject);
        // the stored certificate verifies against the CA key
        assert!(setup
            .ca
            .signer
            .verify(&stored.cert, &setup.ca.ca_cert().public_key));
    }

    #[test]
    fn serials_strictly_increase() {
        let setup = test_ca();
        let mut last = Serial(0);
        for i in 0..5u8 {
            let info = setup
                .ca
                .issue_one(
                    &template(&format!("leaf-{}", i), rsa_key(i)),
                    &requestor(),
                    RequestType::Rest,
                )
                .unwrap();
            assert!(info.record.serial > last);
            last = info.record.serial;
        }
    }

    #[test]
    fn duplicate_subject_is_refused() {
        let mut config = CaConfig::default();
        config.duplicate_subject_permitted = false;
        let setup = test_ca_with(config);

        setup
            .ca
            .issue_one(&template("dup", rsa_key(1)), &requestor(), RequestType::Rest)
            .unwrap();
        let err = setup
            .ca
            .issue_one(&template("dup", rsa_key(2)), &requestor(), RequestType::Rest)
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyIssued(_)));
    }

    #[test]
    fn duplicate_subject_disambiguated_when_profile_allows() {
        let mut config = CaConfig::default();
        config.duplicate_subject_permitted = false;
        let setup = test_ca_with(config);
        let mut profile = CertProfile::end_entity("auto-serial");
        profile.inc_serial_if_subject_exists = true;
        setup.ca.add_profile(profile).unwrap();

        let mut first = template("dup", rsa_key(1));
        first.profile = "auto-serial".to_string();
        let mut second = template("dup", rsa_key(2));
        second.profile = "auto-serial".to_string();

        setup.ca.issue_one(&first, &requestor(), RequestType::Rest).unwrap();
        let info = setup
            .ca
            .issue_one(&second, &requestor(), RequestType::Rest)
            .unwrap();
        assert_eq!(info.record.subject.serial_number_attr(), Some(1));
        assert!(info.warning.unwrap().contains("disambiguated"));
        assert!(info.record.subject.has_attr(AttrType::SerialNumber));
    }

    #[test]
    fn duplicate_key_is_refused() {
        let mut config = CaConfig::default();
        config.duplicate_key_permitted = false;
        let setup = test_ca_with(config);

        setup
            .ca
            .issue_one(&template("one", rsa_key(7)), &requestor(), RequestType::Rest)
            .unwrap();
        let err = setup
            .ca
            .issue_one(&template("two", rsa_key(7)), &requestor(), RequestType::Rest)
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyIssued(_)));
    }

    #[test]
    fn ca_generated_keypair_is_returned_once() {
        let setup = test_ca();
        let mut req = template("generated", rsa_key(0));
        req.public_key = None;
        req.ca_generate_keypair = true;
        let info = setup.ca.issue_one(&req, &requestor(), RequestType::Rest).unwrap();
        assert!(info.private_key.is_some());
        assert!(info.record.public_key.validate().is_ok());
    }

    #[test]
    fn revocation_lifecycle() {
        let setup = test_ca();
        let info = setup
            .ca
            .issue_one(&template("leaf", rsa_key(1)), &requestor(), RequestType::Rest)
            .unwrap();
        let serial = info.record.serial;

        // barred reasons never pass the API
        for reason in [
            CrlReason::CaCompromise,
            CrlReason::AaCompromise,
            CrlReason::RemoveFromCrl,
        ] {
            let err = setup.ca.revoke_cert(serial, reason, None).unwrap_err();
            assert!(matches!(err, Error::NotPermitted(_)));
        }

        let held = setup
            .ca
            .revoke_cert(serial, CrlReason::CertificateHold, None)
            .unwrap()
            .unwrap();
        assert_eq!(held.status, CertStatus::Suspended);

        let lifted = setup.ca.unrevoke_cert(serial).unwrap().unwrap();
        assert_eq!(lifted.status, CertStatus::Valid);

        let revoked = setup
            .ca
            .revoke_cert(serial, CrlReason::KeyCompromise, None)
            .unwrap()
            .unwrap();
        assert_eq!(revoked.status, CertStatus::Revoked);

        // permanent revocations cannot be lifted; the attempt is a no-op
        assert!(setup.ca.unrevoke_cert(serial).unwrap().is_none());
        assert_eq!(
            setup.ca.get_cert(serial).unwrap().unwrap().status,
            CertStatus::Revoked
        );
    }

    #[test]
    fn revoked_ca_refuses_issuance() {
        let setup = test_ca();
        setup.ca.revoke_ca(CrlReason::CaCompromise, None).unwrap();
        assert!(setup.ca.is_revoked());

        let err = setup
            .ca
            .issue_one(&template("leaf", rsa_key(1)), &requestor(), RequestType::Rest)
            .unwrap_err();
        assert!(matches!(err, Error::NotPermitted(_)));

        setup.ca.unrevoke_ca().unwrap();
        assert!(setup
            .ca
            .issue_one(&template("leaf", rsa_key(1)), &requestor(), RequestType::Rest)
            .is_ok());
    }

    #[test]
    fn batch_adjudication_failure_issues_nothing() {
        let setup = test_ca();
        let mut bad = template("bad", rsa_key(2));
        bad.profile = "no-such-profile".to_string();
        let batch = vec![template("good", rsa_key(1)), bad];

        let err = setup
            .ca
            .issue_batch(&batch, &requestor(), RequestType::Rest)
            .unwrap_err();
        assert_eq!(err.index, 1);
        assert!(matches!(err.error, Error::UnknownCertProfile(_)));
        assert!(setup
            .store
            .get_revoked_certs(setup.ca.ident(), None, 0, 10)
            .unwrap()
            .is_empty());
        assert!(setup.ca.get_cert(Serial(2)).unwrap().is_none());
    }

    #[test]
    fn batch_failure_rolls_back_issued_certs() {
        let setup = test_ca();
        let mut tiny = CertProfile::end_entity("tiny");
        tiny.max_cert_size = Some(1);
        setup.ca.add_profile(tiny).unwrap();

        let mut failing = template("second", rsa_key(2));
        failing.profile = "tiny".to_string();
        let batch = vec![template("first", rsa_key(1)), failing];

        let err = setup
            .ca
            .issue_batch(&batch, &requestor(), RequestType::Rest)
            .unwrap_err();
        assert_eq!(err.index, 1);
        assert!(matches!(err.error, Error::NotPermitted(_)));
        // the first certificate was issued and rolled back again
        assert!(setup.ca.get_cert(Serial(2)).unwrap().is_none());
    }

    #[test]
    fn issued_serials_never_reuse_the_ca_serial() {
        let setup = test_ca();
        let info = setup
            .ca
            .issue_one(&template("leaf", rsa_key(1)), &requestor(), RequestType::Rest)
            .unwrap();
        assert_ne!(info.record.serial, setup.ca.ca_cert().serial);
        // the very first leaf is an ordinary certificate, not the CA
        assert!(setup
            .ca
            .revoke_cert(info.record.serial, CrlReason::Superseded, None)
            .unwrap()
            .is_some());
    }

    #[test]
    fn renewal_returns_existing_cert_for_same_key() {
        let setup = test_ca();
        let req = template("renewme", rsa_key(5));
        let first = setup.ca.issue_one(&req, &requestor(), RequestType::Rest).unwrap();

        let again = setup.ca.renew_one(&req, &requestor(), RequestType::Rest).unwrap();
        assert!(again.already_issued);
        assert_eq!(again.record.serial, first.record.serial);

        // a new key gets a fresh certificate
        let rekeyed = setup
            .ca
            .renew_one(&template("renewme", rsa_key(6)), &requestor(), RequestType::Rest)
            .unwrap();
        assert!(!rekeyed.already_issued);
        assert!(rekeyed.record.serial > first.record.serial);
    }

    #[test]
    fn renewal_of_unknown_or_revoked_subject_fails() {
        let setup = test_ca();
        let err = setup
            .ca
            .renew_one(&template("ghost", rsa_key(1)), &requestor(), RequestType::Rest)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownCert));

        let info = setup
            .ca
            .issue_one(&template("leaf", rsa_key(2)), &requestor(), RequestType::Rest)
            .unwrap();
        setup
            .ca
            .revoke_cert(info.record.serial, CrlReason::Superseded, None)
            .unwrap();
        let err = setup
            .ca
            .renew_one(&template("leaf", rsa_key(2)), &requestor(), RequestType::Rest)
            .unwrap_err();
        assert!(matches!(err, Error::CertRevoked));
    }

    #[test]
    fn strict_validity_mode_refuses_overlong_certs() {
        // ask for far more than the CA certificate has left; a large
        // max_validity keeps the profile cap out of the way
        let mut req = template("long", rsa_key(1));
        req.not_after = Some(Utc::now() + Duration::days(10_000));
        let mut config = CaConfig::default();
        config.max_validity = crate::api::Validity::years(100);
        config.validity_mode = ValidityMode::Strict;
        let setup_strict = test_ca_with(config);
        let err = setup_strict
            .ca
            .issue_one(&req, &requestor(), RequestType::Rest)
            .unwrap_err();
        assert!(matches!(err, Error::NotPermitted(_)));

        let mut config = CaConfig::default();
        config.max_validity = crate::api::Validity::years(100);
        config.validity_mode = ValidityMode::Cutoff;
        let setup_cutoff = test_ca_with(config);
        let info = setup_cutoff
            .ca
            .issue_one(&req, &requestor(), RequestType::Rest)
            .unwrap();
        assert_eq!(info.record.not_after, setup_cutoff.ca.ca_cert().not_after);
        assert!(info.warning.unwrap().contains("notAfter"));
    }

    #[test]
    fn backdating_is_clamped_to_the_tolerance_edge() {
        let setup = test_ca();
        let mut req = template("backdated", rsa_key(1));
        req.not_before = Some(Utc::now() - Duration::days(2));
        let before = Utc::now();
        let info = setup.ca.issue_one(&req, &requestor(), RequestType::Rest).unwrap();
        // clamped to the five minute limit, not all the way forward
        assert!(info.record.not_before < before - Duration::minutes(4));
        assert!(info.record.not_before >= before - Duration::minutes(6));
    }

    #[test]
    fn issuance_cutoff_applies_to_the_granted_not_before() {
        let mut config = CaConfig::default();
        config.no_issuance_after = Some(Utc::now() + Duration::hours(1));
        let setup = test_ca_with(config);
        assert!(setup
            .ca
            .issue_one(&template("in-time", rsa_key(1)), &requestor(), RequestType::Rest)
            .is_ok());

        // a notBefore past the cutoff is refused even though the cutoff
        // itself has not arrived yet
        let mut req = template("late", rsa_key(2));
        req.not_before = Some(Utc::now() + Duration::hours(2));
        let err = setup
            .ca
            .issue_one(&req, &requestor(), RequestType::Rest)
            .unwrap_err();
        assert!(matches!(err, Error::NotPermitted(_)));
    }

    #[test]
    fn publishers_see_lifecycle_events() {
        let setup = test_ca();
        let publisher = crate::test::RecordingPublisher::new("ldap");
        setup.ca.add_publisher(publisher.clone()).unwrap();

        let info = setup
            .ca
            .issue_one(&template("leaf", rsa_key(1)), &requestor(), RequestType::Rest)
            .unwrap();
        setup
            .ca
            .revoke_cert(info.record.serial, CrlReason::Superseded, None)
            .unwrap();

        let events = publisher.events();
        assert_eq!(events[0], "ca_added");
        assert!(events[1].starts_with("cert_added"));
        assert!(events[2].starts_with("cert_revoked"));
    }

    #[test]
    fn failed_publication_is_queued_and_replayed() {
        let setup = test_ca();
        let publisher = crate::test::RecordingPublisher::new("flaky");
        setup.ca.add_publisher(publisher.clone()).unwrap();

        publisher.set_fail(true);
        let info = setup
            .ca
            .issue_one(&template("leaf", rsa_key(1)), &requestor(), RequestType::Rest)
            .unwrap();
        assert_eq!(
            setup
                .store
                .publish_queue_entries("flaky", setup.ca.ident(), 10)
                .unwrap()
                .len(),
            1
        );

        // still failing: the queue is kept
        assert_eq!(setup.ca.publish_certs_in_queue().unwrap(), 0);

        publisher.set_fail(false);
        assert_eq!(setup.ca.publish_certs_in_queue().unwrap(), 1);
        assert!(setup
            .store
            .publish_queue_entries("flaky", setup.ca.ident(), 10)
            .unwrap()
            .is_empty());
        assert!(publisher
            .events()
            .contains(&format!("cert_added {}", info.record.serial)));
    }

    #[test]
    fn async_publishers_only_get_queued_events() {
        let setup = test_ca();
        let publisher = crate::test::RecordingPublisher::new_async("ocsp-feeder");
        setup.ca.add_publisher(publisher.clone()).unwrap();

        setup
            .ca
            .issue_one(&template("leaf", rsa_key(1)), &requestor(), RequestType::Rest)
            .unwrap();
        // nothing inline apart from the registration callback
        assert_eq!(publisher.events(), vec!["ca_added".to_string()]);
        assert_eq!(
            setup
                .store
                .publish_queue_entries("ocsp-feeder", setup.ca.ident(), 10)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(setup.ca.publish_certs_in_queue().unwrap(), 1);
    }

    #[test]
    fn removal_needs_publisher_confirmation() {
        let setup = test_ca();
        let publisher = crate::test::RecordingPublisher::new("strict");
        setup.ca.add_publisher(publisher.clone()).unwrap();

        let info = setup
            .ca
            .issue_one(&template("leaf", rsa_key(1)), &requestor(), RequestType::Rest)
            .unwrap();
        let serial = info.record.serial;

        publisher.set_fail(true);
        assert!(setup.ca.remove_cert(serial).unwrap().is_none());
        assert!(setup.ca.get_cert(serial).unwrap().is_some());

        publisher.set_fail(false);
        assert!(setup.ca.remove_cert(serial).unwrap().is_some());
        assert!(setup.ca.get_cert(serial).unwrap().is_none());
    }

    #[test]
    fn ca_revocation_sticks_even_when_a_publisher_fails() {
        let setup = test_ca();
        let publisher = crate::test::RecordingPublisher::new("down");
        setup.ca.add_publisher(publisher.clone()).unwrap();

        publisher.set_fail(true);
        let err = setup.ca.revoke_ca(CrlReason::KeyCompromise, None).unwrap_err();
        assert!(matches!(err, Error::SystemFailure(_)));
        // the state change was committed before the fan-out
        assert!(setup.ca.is_revoked());
    }

    #[test]
    fn self_signed_ca_revocation_covers_its_own_certificate() {
        let mut config = CaConfig::default();
        config.self_signed = true;
        let setup = test_ca_with(config);
        let ca_cert = setup.ca.ca_cert().clone();
        setup
            .store
            .add_cert(
                setup.ca.ident(),
                CertRecord {
                    id: 0,
                    serial: ca_cert.serial,
                    kind: crate::api::CertKind::Ca,
                    subject_fp: ca_cert.subject.fingerprint(),
                    subject: ca_cert.subject.clone(),
                    key_fp: ca_cert.public_key.fingerprint(),
                    public_key: ca_cert.public_key.clone(),
                    profile: "ca".to_string(),
                    not_before: ca_cert.not_before,
                    not_after: ca_cert.not_after,
                    cert: ca_cert.cert.clone(),
                    status: CertStatus::Valid,
                    revocation: None,
                    last_update: Utc::now(),
                },
            )
            .unwrap();
        let publisher = crate::test::RecordingPublisher::new("dir");
        setup.ca.add_publisher(publisher.clone()).unwrap();

        setup.ca.revoke_ca(CrlReason::KeyCompromise, None).unwrap();
        let record = setup.ca.get_cert(ca_cert.serial).unwrap().unwrap();
        assert_eq!(record.status, CertStatus::Revoked);
        let events = publisher.events();
        assert!(events.iter().any(|e| e.starts_with("cert_revoked")));
        assert!(events.iter().any(|e| e.starts_with("ca_revoked")));

        setup.ca.unrevoke_ca().unwrap();
        let record = setup.ca.get_cert(ca_cert.serial).unwrap().unwrap();
        assert_eq!(record.status, CertStatus::Valid);
    }

    #[test]
    fn suspended_sweep_revokes_stale_holds() {
        let mut config = CaConfig::default();
        config.revoke_suspended = Some(crate::config::RevokeSuspendedControl {
            unchanged_since: crate::api::Validity::hours(0),
            target_reason: CrlReason::CessationOfOperation,
        });
        let setup = test_ca_with(config);

        let info = setup
            .ca
            .issue_one(&template("leaf", rsa_key(1)), &requestor(), RequestType::Rest)
            .unwrap();
        setup
            .ca
            .revoke_cert(info.record.serial, CrlReason::CertificateHold, None)
            .unwrap();

        let revoked = setup.ca.revoke_suspended_sweep().unwrap();
        assert_eq!(revoked, 1);
        let record = setup.ca.get_cert(info.record.serial).unwrap().unwrap();
        assert_eq!(record.status, CertStatus::Revoked);
        assert_eq!(
            record.revocation.unwrap().reason,
            CrlReason::CessationOfOperation
        );
    }

    #[test]
    fn purge_keeps_a_day_of_slack() {
        use bytes::Bytes;

        let mut config = CaConfig::default();
        config.keep_expired_certs_days = Some(1);
        let setup = test_ca_with(config);

        let expired = |serial: u128, days_ago: i64| {
            let subject = crate::api::Name::common_name(&format!("old-{}", serial));
            let key = rsa_key(serial as u8);
            CertRecord {
                id: 0,
                serial: Serial(serial),
                kind: crate::api::CertKind::EndEntity,
                subject_fp: subject.fingerprint(),
                subject,
                key_fp: key.fingerprint(),
                public_key: key,
                profile: "tls-server".to_string(),
                not_before: Utc::now() - Duration::days(days_ago + 30),
                not_after: Utc::now() - Duration::days(days_ago),
                cert: Bytes::from_static(b"expired"),
                status: CertStatus::Expired,
                revocation: None,
                last_update: Utc::now(),
            }
        };
        setup.store.add_cert(setup.ca.ident(), expired(10, 3)).unwrap();
        setup.store.add_cert(setup.ca.ident(), expired(11, 1)).unwrap();

        // one day of retention purges only certificates expired more
        // than two days ago
        assert_eq!(setup.ca.purge_expired_certs().unwrap(), 1);
        assert!(setup.ca.get_cert(Serial(10)).unwrap().is_none());
        assert!(setup.ca.get_cert(Serial(11)).unwrap().is_some());
    }

    #[test]
    fn health_check_reflects_publishers() {
        let setup = test_ca();
        let publisher = crate::test::RecordingPublisher::new("probe");
        setup.ca.add_publisher(publisher.clone()).unwrap();

        assert!(setup.ca.health_check().healthy());
        publisher.set_fail(true);
        assert!(!setup.ca.health_check().healthy());
    }

    #[test]
    fn concurrent_requests_for_one_subject_never_overlap() {
        use std::thread;

        let mut config = CaConfig::default();
        config.duplicate_subject_permitted = false;
        let setup = test_ca_with(config);
        let mut handles = Vec::new();
        for i in 0..4u8 {
            let ca = setup.ca.clone();
            handles.push(thread::spawn(move || {
                ca.issue_one(
                    &template("contended", rsa_key(i)),
                    &requestor(),
                    RequestType::Rest,
                )
            }));
        }
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let issued = results.iter().filter(|r| r.is_ok()).count();
        // losers fail with AlreadyIssued (in process or stored) instead
        // of double issuing; exactly one may win
        assert_eq!(issued, 1);
        for result in results {
            if let Err(e) = result {
                assert!(matches!(e, Error::AlreadyIssued(_)));
            }
        }
    }

    #[test]
    fn markers_follow_the_duplicate_policy() {
        // duplicates permitted: no markers, a long-running issuance does
        // not block another request for the same subject or key
        let setup = test_ca();
        let request = template("shared", rsa_key(1));
        let held = setup.ca.claim_markers(&request).unwrap();
        assert!(held.is_empty());
        assert!(setup
            .ca
            .issue_one(&template("shared", rsa_key(2)), &requestor(), RequestType::Rest)
            .is_ok());

        // duplicates forbidden: markers are taken and exclude a second
        // claim for the same subject
        let mut config = CaConfig::default();
        config.duplicate_subject_permitted = false;
        config.duplicate_key_permitted = false;
        let setup = test_ca_with(config);
        let held = setup.ca.claim_markers(&request).unwrap();
        assert_eq!(held.len(), 2);
        let err = setup
            .ca
            .claim_markers(&template("shared", rsa_key(2)))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyIssued(_)));
        drop(held);
        assert!(setup.ca.claim_markers(&request).is_ok());
    }
}
