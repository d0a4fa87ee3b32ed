//! CRL scheduling and assembly.
//!
//! Interval arithmetic runs in UTC against a fixed base time. A CRL may
//! only be signed within a short window after an interval boundary; the
//! periodic tick evaluates the window, decides between a full and a
//! delta CRL and otherwise does nothing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};

use crate::api::{
    CertKind, CertStatus, CrlCertSetEntry, CrlEntry, CrlReason, CrlRecord,
    IssuingDistributionPoint, Serial, TbsCertList,
};
use crate::commons::audit::AuditEvent;
use crate::commons::{Error, KilnResult};
use crate::config::{CrlControl, CrlUpdateMode, TriState};
use crate::constants::{
    CRL_MIN_WINDOW_MINUTES, CRL_RECENT_SLACK_MINUTES, CRL_SIGN_WINDOW_MINUTES,
    STORE_PAGE_SIZE,
};
use crate::server::ca::Ca;

//------------ CrlJob --------------------------------------------------------

/// A decided CRL generation.
#[derive(Clone, Debug)]
pub(crate) struct CrlJob {
    pub delta: bool,
    pub this_update: DateTime<Utc>,
    pub next_update: Option<DateTime<Utc>>,
}

//------------ Interval arithmetic -------------------------------------------

/// Current interval index and its boundary instant, `None` before the
/// base time.
fn interval_state(
    control: &CrlControl,
    base: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<(u64, DateTime<Utc>)> {
    if now < base {
        return None;
    }
    if let Some(day_time) = control.interval_day_time {
        let today = now
            .date_naive()
            .and_hms_opt(day_time.hour, day_time.minute, 0)?
            .and_utc();
        let boundary = if now >= today {
            today
        } else {
            today - Duration::days(1)
        };
        if boundary < base {
            return None;
        }
        let index = ((boundary - base).num_minutes() / (24 * 60)) as u64;
        Some((index, boundary))
    } else {
        let interval_minutes = control.interval_minutes() as i64;
        let index = (now - base).num_minutes() / interval_minutes;
        let boundary = base + Duration::minutes(index * interval_minutes);
        Some((index as u64, boundary))
    }
}

/// Smallest interval index after `current` at which a CRL is scheduled.
fn next_scheduled_interval(control: &CrlControl, current: u64, full_only: bool) -> u64 {
    let full = control.full_crl_intervals.max(1) as u64;
    let delta = control.delta_crl_intervals as u64;
    let mut candidate = current + 1;
    loop {
        if candidate % full == 0 {
            return candidate;
        }
        if !full_only && delta > 0 && candidate % delta == 0 {
            return candidate;
        }
        candidate += 1;
    }
}

fn scheduled_next_update(
    control: &CrlControl,
    interval: u64,
    boundary: DateTime<Utc>,
    full_only: bool,
) -> DateTime<Utc> {
    let next = next_scheduled_interval(control, interval, full_only);
    boundary
        + Duration::minutes(
            (next - interval) as i64 * control.interval_minutes() as i64
                + control.overlap_minutes as i64,
        )
}

/// Decides whether a CRL is due at `now`.
pub(crate) fn evaluate_tick(
    control: &CrlControl,
    base: DateTime<Utc>,
    now: DateTime<Utc>,
    has_crl: bool,
    current_this_update: Option<DateTime<Utc>>,
) -> Option<CrlJob> {
    if control.update_mode != CrlUpdateMode::Interval {
        return None;
    }
    let (interval, boundary) = interval_state(control, base, now)?;
    if now - boundary >= Duration::minutes(CRL_SIGN_WINDOW_MINUTES) {
        return None;
    }
    if let Some(this_update) = current_this_update {
        // the current CRL already covers this boundary
        if now - this_update
            < Duration::minutes(CRL_SIGN_WINDOW_MINUTES + CRL_RECENT_SLACK_MINUTES)
        {
            return None;
        }
    }

    let full = control.full_crl_intervals as u64;
    let delta_intervals = control.delta_crl_intervals as u64;
    let delta = if interval % full == 0 {
        false
    } else if delta_intervals > 0 && interval % delta_intervals == 0 {
        // a delta needs a full CRL to be relative to
        if !has_crl {
            return None;
        }
        true
    } else {
        return None;
    };

    let full_only = !delta && control.extended_next_update;
    Some(CrlJob {
        delta,
        this_update: now,
        next_update: Some(scheduled_next_update(control, interval, boundary, full_only)),
    })
}

//------------ CRL generation ------------------------------------------------

struct ClearOnDrop<'a>(&'a AtomicBool);

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Ca {
    /// The periodic CRL tick. Returns the generated CRL, or `None` when
    /// nothing is due or a generation is already running.
    pub fn crl_tick(&self) -> KilnResult<Option<CrlRecord>> {
        let control = match &self.config.crl_control {
            Some(control) => control.clone(),
            None => return Ok(None),
        };
        let base = self.config.crl_base_time.unwrap_or(self.ca_cert.not_before);
        let current = self.store.this_update_of_current_crl(&self.ident)?;
        let has_crl = self.store.has_crl(&self.ident)?;
        let job = match evaluate_tick(&control, base, Utc::now(), has_crl, current) {
            Some(job) => job,
            None => return Ok(None),
        };
        self.generate_crl_guarded(&control, job, false)
    }

    /// Generates a full CRL right now, outside the schedule.
    pub fn generate_crl_on_demand(&self) -> KilnResult<CrlRecord> {
        let control = self
            .config
            .crl_control
            .clone()
            .ok_or_else(|| Error::crl("CRL generation is not configured for this CA"))?;
        let now = Utc::now();
        let job = CrlJob {
            delta: false,
            this_update: now,
            next_update: self.on_demand_next_update(&control, now),
        };
        match self.generate_crl_guarded(&control, job, true)? {
            Some(record) => Ok(record),
            None => Err(Error::unavailable("TRY_LATER: CRL generation is in process")),
        }
    }

    /// nextUpdate for an unscheduled CRL: the next scheduled interval, or
    /// none in on-demand mode or when that instant is already past.
    fn on_demand_next_update(
        &self,
        control: &CrlControl,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if control.update_mode == CrlUpdateMode::OnDemand {
            return None;
        }
        let base = self.config.crl_base_time.unwrap_or(self.ca_cert.not_before);
        let (interval, boundary) = interval_state(control, base, now)?;
        let next_update =
            scheduled_next_update(control, interval, boundary, control.extended_next_update);
        (next_update > now).then_some(next_update)
    }

    fn generate_crl_guarded(
        &self,
        control: &CrlControl,
        job: CrlJob,
        on_demand: bool,
    ) -> KilnResult<Option<CrlRecord>> {
        if self
            .crl_gen_in_process
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return if on_demand {
                Err(Error::unavailable("TRY_LATER: CRL generation is in process"))
            } else {
                Ok(None)
            };
        }
        let _clear = ClearOnDrop(&self.crl_gen_in_process);
        self.generate_crl(control, job).map(Some)
    }

    fn generate_crl(&self, control: &CrlControl, job: CrlJob) -> KilnResult<CrlRecord> {
        // a CRL must stay usable for a minimum window
        if let Some(next_update) = job.next_update {
            if next_update - job.this_update < Duration::minutes(CRL_MIN_WINDOW_MINUTES) {
                return Err(Error::crl(format!(
                    "nextUpdate {} is less than {} minutes after thisUpdate {}",
                    next_update, CRL_MIN_WINDOW_MINUTES, job.this_update
                )));
            }
        }

        let mut event = AuditEvent::start(&self.ident.name, "generate_crl");
        event.add("type", if job.delta { "delta" } else { "full" });
        let result = self.generate_crl_inner(control, &job, &mut event);
        self.audit.record(&event, result.is_ok());
        result
    }

    fn generate_crl_inner(
        &self,
        control: &CrlControl,
        job: &CrlJob,
        event: &mut AuditEvent,
    ) -> KilnResult<CrlRecord> {
        let max_cache_id = self.store.max_delta_crl_cache_id(&self.ident)?;

        let entries = if job.delta {
            self.assemble_delta_entries(control)?
        } else {
            self.assemble_full_entries(control, job.this_update)?
        };
        event.add("entries", entries.len());

        let number = self.store.next_crl_number(&self.ident)?;
        event.add("crl_number", number);

        let idp = (control.only_contains_user_certs
            || control.only_contains_ca_certs
            || control.indirect_crl)
            .then_some(IssuingDistributionPoint {
                only_user_certs: control.only_contains_user_certs,
                only_ca_certs: control.only_contains_ca_certs,
                indirect: control.indirect_crl,
            });
        let freshest_crl = (!job.delta
            && control.deltas_enabled()
            && !control.delta_crl_uris.is_empty())
        .then(|| control.delta_crl_uris.clone());
        let cert_set = (!job.delta && control.certset_included)
            .then(|| self.collect_cert_set(control, job.this_update))
            .transpose()?;

        let tbs = TbsCertList {
            issuer: self.crl_signer_pool().subject().clone(),
            this_update: job.this_update,
            next_update: job.next_update,
            entries,
            auth_key_id: self.crl_signer_key().fingerprint(),
            crl_number: number,
            idp,
            freshest_crl,
            cert_set,
        };

        let signed = {
            let signer = self.crl_signer_pool().borrow()?;
            signer.sign_crl(&tbs).map_err(Error::signer)?
        };

        let record = CrlRecord {
            number,
            this_update: job.this_update,
            next_update: job.next_update,
            delta: job.delta,
            crl: signed,
        };
        self.store.add_crl(&self.ident, record.clone())?;
        info!(
            "ca {}: generated {} CRL number {} with {} entries",
            self.ident,
            if job.delta { "delta" } else { "full" },
            number,
            tbs.entries.len()
        );

        for publisher in self.publisher_list() {
            if publisher.is_async() {
                continue;
            }
            if let Err(e) = publisher.crl_added(&record) {
                warn!(
                    "ca {}: publisher {} did not accept CRL {}: {}",
                    self.ident,
                    publisher.ident(),
                    number,
                    e
                );
            }
        }

        if !job.delta {
            if let Err(e) = self.store.cleanup_crls(&self.ident, self.config.num_crls) {
                warn!("ca {}: CRL cleanup failed: {}", self.ident, e);
            }
        }
        if max_cache_id > 0 {
            if let Err(e) = self.store.clear_delta_crl_cache(&self.ident, max_cache_id) {
                warn!("ca {}: could not clear delta-CRL cache: {}", self.ident, e);
            }
        }

        Ok(record)
    }

    fn assemble_full_entries(
        &self,
        control: &CrlControl,
        this_update: DateTime<Utc>,
    ) -> KilnResult<Vec<CrlEntry>> {
        let not_expired_at = (!control.include_expired_certs).then_some(this_update);
        let mut entries = Vec::new();
        let mut start_id = 0;
        loop {
            let page = self.store.get_revoked_certs(
                &self.ident,
                not_expired_at,
                start_id,
                STORE_PAGE_SIZE,
            )?;
            let page_len = page.len();
            for revoked in page {
                start_id = revoked.id;
                if !in_scope(control, revoked.kind) {
                    continue;
                }
                entries.push(self.crl_entry(
                    control,
                    revoked.serial,
                    revoked.revocation.reason,
                    revoked.revocation.revoked_at,
                    revoked.revocation.invalidity_at,
                ));
            }
            if page_len < STORE_PAGE_SIZE {
                break;
            }
        }
        self.finish_entries(control, &mut entries);
        Ok(entries)
    }

    /// Delta entries come from the change cache: serials revoked,
    /// re-revoked or unrevoked since the last CRL. An unrevoked
    /// certificate appears with reason removeFromCRL.
    fn assemble_delta_entries(&self, control: &CrlControl) -> KilnResult<Vec<CrlEntry>> {
        let mut by_serial: BTreeMap<Serial, CrlEntry> = BTreeMap::new();
        let mut start_id = 0;
        loop {
            let page =
                self.store
                    .get_delta_crl_cache(&self.ident, start_id, STORE_PAGE_SIZE)?;
            let page_len = page.len();
            for (cache_id, serial) in page {
                start_id = cache_id;
                let record = match self.store.get_cert(&self.ident, serial)? {
                    Some(record) => record,
                    None => continue,
                };
                if !in_scope(control, record.kind) {
                    continue;
                }
                let entry = match (&record.status, &record.revocation) {
                    (CertStatus::Revoked | CertStatus::Suspended, Some(revocation)) => self
                        .crl_entry(
                            control,
                            serial,
                            revocation.reason,
                            revocation.revoked_at,
                            revocation.invalidity_at,
                        ),
                    _ => self.crl_entry(
                        control,
                        serial,
                        CrlReason::RemoveFromCrl,
                        record.last_update,
                        None,
                    ),
                };
                by_serial.insert(serial, entry);
            }
            if page_len < STORE_PAGE_SIZE {
                break;
            }
        }
        let mut entries: Vec<CrlEntry> = by_serial.into_values().collect();
        self.finish_entries(control, &mut entries);
        Ok(entries)
    }

    fn crl_entry(
        &self,
        control: &CrlControl,
        serial: Serial,
        reason: CrlReason,
        revoked_at: DateTime<Utc>,
        invalidity_at: Option<DateTime<Utc>>,
    ) -> CrlEntry {
        // removeFromCRL survives reason exclusion, a bare entry would
        // re-revoke the certificate on relying parties
        let reason = if control.exclude_reason && reason != CrlReason::RemoveFromCrl {
            CrlReason::Unspecified
        } else {
            reason
        };
        let invalidity_at = match control.invalidity_date_mode {
            TriState::Forbidden => None,
            TriState::Optional => invalidity_at,
            TriState::Required => invalidity_at.or(Some(revoked_at)),
        };
        CrlEntry {
            serial,
            revoked_at,
            reason,
            invalidity_at,
            cert_issuer: None,
        }
    }

    fn finish_entries(&self, control: &CrlControl, entries: &mut [CrlEntry]) {
        entries.sort_by_key(|entry| entry.serial);
        if control.indirect_crl {
            if let Some(first) = entries.first_mut() {
                first.cert_issuer = Some(self.ca_cert.subject.clone());
            }
        }
    }

    fn collect_cert_set(
        &self,
        control: &CrlControl,
        this_update: DateTime<Utc>,
    ) -> KilnResult<Vec<CrlCertSetEntry>> {
        let not_expired_at = (!control.include_expired_certs).then_some(this_update);
        let mut entries = Vec::new();
        let mut start_id = 0;
        loop {
            let page = self.store.get_valid_certs(
                &self.ident,
                not_expired_at,
                start_id,
                STORE_PAGE_SIZE,
            )?;
            let page_len = page.len();
            for record in page {
                start_id = record.id;
                if !in_scope(control, record.kind) {
                    continue;
                }
                entries.push(CrlCertSetEntry {
                    serial: record.serial,
                    cert: control.certset_cert_included.then(|| record.cert.to_vec()),
                });
            }
            if page_len < STORE_PAGE_SIZE {
                break;
            }
        }
        entries.sort_by_key(|entry| entry.serial);
        Ok(entries)
    }
}

fn in_scope(control: &CrlControl, kind: CertKind) -> bool {
    if control.only_contains_user_certs {
        kind == CertKind::EndEntity
    } else if control.only_contains_ca_certs {
        kind == CertKind::Ca
    } else {
        true
    }
}

//------------ Tests ---------------------------------------------------------
