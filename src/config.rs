//! CA and CRL configuration.
//!
//! Configuration is deserialized from TOML. All fields carry defaults so
//! that a minimal file only states what deviates.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::{CrlReason, HourMinute, Validity, ValidityMode};
use crate::commons::{Error, KilnResult};

//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn max_validity() -> Validity {
        Validity::years(10)
    }
    fn validity_mode() -> ValidityMode {
        ValidityMode::Strict
    }
    fn dflt_true() -> bool {
        true
    }
    fn num_crls() -> u32 {
        30
    }
    fn signer_pool_size() -> usize {
        crate::constants::DEFAULT_SIGNER_POOL_SIZE
    }
    fn update_mode() -> CrlUpdateMode {
        CrlUpdateMode::Interval
    }
    fn full_crl_intervals() -> u32 {
        1
    }
    fn overlap_minutes() -> u32 {
        10
    }
    fn invalidity_date_mode() -> TriState {
        TriState::Optional
    }
    fn unchanged_since() -> Validity {
        Validity::days(15)
    }
    fn target_reason() -> CrlReason {
        CrlReason::CessationOfOperation
    }
}

//------------ CaConfig ------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CaConfig {
    #[serde(default = "ConfigDefaults::max_validity")]
    pub max_validity: Validity,

    #[serde(default = "ConfigDefaults::validity_mode")]
    pub validity_mode: ValidityMode,

    /// Whether one public key may appear in more than one valid
    /// certificate.
    #[serde(default = "ConfigDefaults::dflt_true")]
    pub duplicate_key_permitted: bool,

    /// Whether one subject may appear in more than one valid certificate.
    /// When false, colliding subjects are disambiguated through the
    /// serialNumber attribute where the profile permits it.
    #[serde(default = "ConfigDefaults::dflt_true")]
    pub duplicate_subject_permitted: bool,

    /// Whether the CA certificate is self-signed. A self-signed CA
    /// refuses to issue a certificate carrying its own subject.
    #[serde(default)]
    pub self_signed: bool,

    /// No certificate is issued after this instant.
    #[serde(default)]
    pub no_issuance_after: Option<DateTime<Utc>>,

    /// Expired certificates older than this many days are purged. `None`
    /// keeps them forever.
    #[serde(default)]
    pub keep_expired_certs_days: Option<u32>,

    /// Number of CRLs retained after cleanup.
    #[serde(default = "ConfigDefaults::num_crls")]
    pub num_crls: u32,

    #[serde(default = "ConfigDefaults::signer_pool_size")]
    pub signer_pool_size: usize,

    /// Base instant for CRL interval arithmetic. Defaults to the CA
    /// certificate's notBefore.
    #[serde(default)]
    pub crl_base_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub crl_control: Option<CrlControl>,

    #[serde(default)]
    pub revoke_suspended: Option<RevokeSuspendedControl>,
}

impl Default for CaConfig {
    fn default() -> Self {
        CaConfig {
            max_validity: ConfigDefaults::max_validity(),
            validity_mode: ConfigDefaults::validity_mode(),
            duplicate_key_permitted: true,
            duplicate_subject_permitted: true,
            self_signed: false,
            no_issuance_after: None,
            keep_expired_certs_days: None,
            num_crls: ConfigDefaults::num_crls(),
            signer_pool_size: ConfigDefaults::signer_pool_size(),
            crl_base_time: None,
            crl_control: None,
            revoke_suspended: None,
        }
    }
}

impl CaConfig {
    pub fn from_toml(toml: &str) -> KilnResult<Self> {
        let config: CaConfig = toml::from_str(toml)
            .map_err(|e| Error::system(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> KilnResult<Self> {
        let toml = std::fs::read_to_string(path)?;
        Self::from_toml(&toml)
    }

    pub fn validate(&self) -> KilnResult<()> {
        if self.num_crls == 0 {
            return Err(Error::system("num_crls must be at least 1"));
        }
        if self.signer_pool_size == 0 {
            return Err(Error::system("signer_pool_size must be at least 1"));
        }
        if let Some(control) = &self.crl_control {
            control.validate()?;
        }
        if let Some(control) = &self.revoke_suspended {
            control.validate()?;
        }
        Ok(())
    }
}

//------------ CrlControl ----------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CrlUpdateMode {
    /// CRLs are generated on a schedule.
    Interval,
    /// CRLs are generated only on explicit request.
    OnDemand,
}

/// Whether an optional CRL entry field may, must or must not appear.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriState {
    Forbidden,
    Optional,
    Required,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CrlControl {
    #[serde(default = "ConfigDefaults::update_mode")]
    pub update_mode: CrlUpdateMode,

    /// Interval length in minutes. Mutually exclusive with
    /// `interval_day_time`.
    #[serde(default)]
    pub interval_minutes: Option<u32>,

    /// Daily generation time (UTC), implying 24-hour intervals.
    #[serde(default)]
    pub interval_day_time: Option<HourMinute>,

    /// A full CRL every this many intervals.
    #[serde(default = "ConfigDefaults::full_crl_intervals")]
    pub full_crl_intervals: u32,

    /// A delta CRL every this many intervals; 0 disables delta CRLs.
    #[serde(default)]
    pub delta_crl_intervals: u32,

    /// Overlap added to nextUpdate beyond the next scheduled interval.
    #[serde(default = "ConfigDefaults::overlap_minutes")]
    pub overlap_minutes: u32,

    /// Keep entries for expired certificates on the CRL.
    #[serde(default)]
    pub include_expired_certs: bool,

    #[serde(default)]
    pub only_contains_user_certs: bool,

    #[serde(default)]
    pub only_contains_ca_certs: bool,

    /// Marks the CRL as indirect; its first entry then carries the
    /// certificate-issuer extension.
    #[serde(default)]
    pub indirect_crl: bool,

    /// Stretch nextUpdate of full CRLs to the interval of the next full
    /// CRL.
    #[serde(default)]
    pub extended_next_update: bool,

    #[serde(default = "ConfigDefaults::invalidity_date_mode")]
    pub invalidity_date_mode: TriState,

    /// Omit the reason-code extension from CRL entries.
    #[serde(default)]
    pub exclude_reason: bool,

    /// Embed the certificate-set extension into full CRLs.
    #[serde(default)]
    pub certset_included: bool,

    /// Embed full certificate bytes into the certificate-set extension.
    #[serde(default)]
    pub certset_cert_included: bool,

    /// Freshest-CRL URIs put on full CRLs when delta CRLs are enabled.
    #[serde(default)]
    pub delta_crl_uris: Vec<String>,
}

impl Default for CrlControl {
    fn default() -> Self {
        CrlControl {
            update_mode: CrlUpdateMode::Interval,
            interval_minutes: Some(24 * 60),
            interval_day_time: None,
            full_crl_intervals: 1,
            delta_crl_intervals: 0,
            overlap_minutes: ConfigDefaults::overlap_minutes(),
            include_expired_certs: false,
            only_contains_user_certs: false,
            only_contains_ca_certs: false,
            indirect_crl: false,
            extended_next_update: false,
            invalidity_date_mode: TriState::Optional,
            exclude_reason: false,
            certset_included: false,
            certset_cert_included: false,
            delta_crl_uris: Vec::new(),
        }
    }
}

impl CrlControl {
    /// Minutes per interval, regardless of schedule style.
    pub fn interval_minutes(&self) -> u32 {
        match (self.interval_minutes, self.interval_day_time) {
            (Some(minutes), _) => minutes,
            (None, Some(_)) => 24 * 60,
            (None, None) => 24 * 60,
        }
    }

    pub fn deltas_enabled(&self) -> bool {
        self.delta_crl_intervals > 0
    }

    pub fn validate(&self) -> KilnResult<()> {
        if self.only_contains_user_certs && self.only_contains_ca_certs {
            return Err(Error::system(
                "only_contains_user_certs and only_contains_ca_certs are mutually exclusive",
            ));
        }
        if self.update_mode == CrlUpdateMode::Interval {
            match (self.interval_minutes, self.interval_day_time) {
                (Some(_), None) | (None, Some(_)) => {}
                (Some(_), Some(_)) => {
                    return Err(Error::system(
                        "interval_minutes and interval_day_time are mutually exclusive",
                    ));
                }
                (None, None) => {
                    return Err(Error::system(
                        "interval mode requires interval_minutes or interval_day_time",
                    ));
                }
            }
            if let Some(minutes) = self.interval_minutes {
                if minutes == 0 {
                    return Err(Error::system("interval_minutes must be positive"));
                }
            }
        }
        if self.full_crl_intervals == 0 {
            return Err(Error::system("full_crl_intervals must be positive"));
        }
        if self.delta_crl_intervals >= self.full_crl_intervals
            && self.delta_crl_intervals != 0
        {
            return Err(Error::system(
                "delta_crl_intervals must be smaller than full_crl_intervals",
            ));
        }
        Ok(())
    }
}

//------------ RevokeSuspendedControl ----------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RevokeSuspendedControl {
    /// A suspension untouched for this long is turned into a permanent
    /// revocation.
    #[serde(default = "ConfigDefaults::unchanged_since")]
    pub unchanged_since: Validity,

    #[serde(default = "ConfigDefaults::target_reason")]
    pub target_reason: CrlReason,
}

impl Default for RevokeSuspendedControl {
    fn default() -> Self {
        RevokeSuspendedControl {
            unchanged_since: ConfigDefaults::unchanged_since(),
            target_reason: ConfigDefaults::target_reason(),
        }
    }
}

impl RevokeSuspendedControl {
    pub fn validate(&self) -> KilnResult<()> {
        if !self.target_reason.permitted_in_request()
            || self.target_reason == CrlReason::CertificateHold
        {
            return Err(Error::system(format!(
                "'{}' is not a valid target reason for auto-revocation",
                self.target_reason
            )));
        }
        Ok(())
    }
}

//------------ Tests ---------------------------------------------------------
