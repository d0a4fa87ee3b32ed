//! Data types shared between the CA engine and its collaborators.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::commons::error::Error;
use crate::commons::KilnResult;
use crate::constants::{MAX_RSA_MODULUS_BITS, MIN_RSA_MODULUS_BITS};

//------------ CaIdentity ----------------------------------------------------

/// Immutable identity of a CA: numeric id plus name. The id is the primary
/// key for all store operations.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct CaIdentity {
    pub id: u32,
    pub name: String,
}

impl CaIdentity {
    pub fn new(id: u32, name: &str) -> Self {
        CaIdentity {
            id,
            name: name.to_string(),
        }
    }
}

impl fmt::Display for CaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

//------------ Serial --------------------------------------------------------

/// A certificate serial number. Allocated by the store, strictly
/// increasing per CA and never reused.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct Serial(pub u128);

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl From<u128> for Serial {
    fn from(v: u128) -> Self {
        Serial(v)
    }
}

//------------ Name ----------------------------------------------------------

/// Subject attribute types the engine cares about.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum AttrType {
    CommonName,
    Organization,
    OrganizationalUnit,
    Country,
    Locality,
    State,
    SerialNumber,
    DomainComponent,
    Email,
}

impl AttrType {
    /// Short attribute code, e.g. "cn".
    pub fn code(&self) -> &'static str {
        match self {
            AttrType::CommonName => "cn",
            AttrType::Organization => "o",
            AttrType::OrganizationalUnit => "ou",
            AttrType::Country => "c",
            AttrType::Locality => "l",
            AttrType::State => "st",
            AttrType::SerialNumber => "serialnumber",
            AttrType::DomainComponent => "dc",
            AttrType::Email => "email",
        }
    }
}

/// A single relative distinguished name.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Rdn {
    pub attr: AttrType,
    pub value: String,
}

impl Rdn {
    pub fn new(attr: AttrType, value: &str) -> Self {
        Rdn {
            attr,
            value: value.to_string(),
        }
    }
}

/// An X.500 name as an ordered sequence of RDNs.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Name {
    pub rdns: Vec<Rdn>,
}

impl Name {
    pub fn new(rdns: Vec<Rdn>) -> Self {
        Name { rdns }
    }

    pub fn common_name(cn: &str) -> Self {
        Name {
            rdns: vec![Rdn::new(AttrType::CommonName, cn)],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rdns.is_empty()
    }

    /// Returns the name with all blank-valued RDNs removed.
    pub fn strip_empty_rdns(&self) -> Name {
        Name {
            rdns: self
                .rdns
                .iter()
                .filter(|rdn| !rdn.value.trim().is_empty())
                .cloned()
                .collect(),
        }
    }

    pub fn has_attr(&self, attr: AttrType) -> bool {
        self.rdns.iter().any(|rdn| rdn.attr == attr)
    }

    /// Value of the serialNumber attribute, parsed as a number.
    pub fn serial_number_attr(&self) -> Option<u64> {
        self.rdns
            .iter()
            .find(|rdn| rdn.attr == AttrType::SerialNumber)
            .and_then(|rdn| u64::from_str(rdn.value.trim()).ok())
    }

    /// Returns the name with its serialNumber attribute replaced (or
    /// appended) with the given value.
    pub fn with_serial_number(&self, sn: u64) -> Name {
        let mut rdns: Vec<Rdn> = self
            .rdns
            .iter()
            .filter(|rdn| rdn.attr != AttrType::SerialNumber)
            .cloned()
            .collect();
        rdns.push(Rdn::new(AttrType::SerialNumber, &sn.to_string()));
        Name { rdns }
    }

    /// Returns the name without its serialNumber attribute.
    pub fn without_serial_number(&self) -> Name {
        Name {
            rdns: self
                .rdns
                .iter()
                .filter(|rdn| rdn.attr != AttrType::SerialNumber)
                .cloned()
                .collect(),
        }
    }

    /// Canonical text form used for fingerprinting and equality under
    /// duplicate-subject policy: lowercased, trimmed, RDN order preserved.
    pub fn canonical(&self) -> String {
        let parts: Vec<String> = self
            .rdns
            .iter()
            .map(|rdn| format!("{}={}", rdn.attr.code(), rdn.value.trim().to_lowercase()))
            .collect();
        parts.join(",")
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self.canonical().as_bytes())
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let parts: Vec<String> = self
            .rdns
            .iter()
            .map(|rdn| format!("{}={}", rdn.attr.code().to_uppercase(), rdn.value))
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

//------------ Fingerprint ---------------------------------------------------

/// SHA-256 digest of a canonical subject or of public key bytes.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn of(data: &[u8]) -> Self {
        Fingerprint(openssl::sha::sha256(data))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

//------------ PublicKey -----------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum EcCurve {
    P256,
    P384,
    P521,
}

impl fmt::Display for EcCurve {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EcCurve::P256 => write!(f, "P-256"),
            EcCurve::P384 => write!(f, "P-384"),
            EcCurve::P521 => write!(f, "P-521"),
        }
    }
}

/// A subject public key in algorithm-specific component form.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum PublicKey {
    Rsa {
        /// Big-endian modulus bytes.
        modulus: Vec<u8>,
        exponent: Vec<u8>,
    },
    Ec {
        curve: EcCurve,
        /// Uncompressed point encoding.
        point: Vec<u8>,
    },
    Dsa {
        p: Vec<u8>,
        q: Vec<u8>,
        g: Vec<u8>,
        y: Vec<u8>,
    },
}

impl PublicKey {
    pub fn algorithm(&self) -> &'static str {
        match self {
            PublicKey::Rsa { .. } => "RSA",
            PublicKey::Ec { .. } => "EC",
            PublicKey::Dsa { .. } => "DSA",
        }
    }

    /// Effective modulus size in bits for RSA keys.
    pub fn rsa_bits(&self) -> Option<u32> {
        match self {
            PublicKey::Rsa { modulus, .. } => {
                let skipped = modulus.iter().take_while(|b| **b == 0).count();
                let rest = &modulus[skipped..];
                rest.first()
                    .map(|first| (rest.len() as u32 - 1) * 8 + (8 - first.leading_zeros()))
            }
            _ => None,
        }
    }

    /// Rejects malformed and known-weak keys. For RSA this refuses even,
    /// undersized and oversized moduli and even or trivial exponents.
    pub fn validate(&self) -> KilnResult<()> {
        match self {
            PublicKey::Rsa { modulus, exponent } => {
                let bits = self
                    .rsa_bits()
                    .ok_or_else(|| Error::bad_template("invalid format of RSA public key"))?;
                if bits < MIN_RSA_MODULUS_BITS {
                    return Err(Error::bad_template("RSA public key is too weak"));
                }
                if bits > MAX_RSA_MODULUS_BITS {
                    return Err(Error::bad_template("RSA public key is too large"));
                }
                if modulus.last().map(|b| b % 2) != Some(1) {
                    return Err(Error::bad_template("RSA public key is too weak"));
                }
                match exponent.last() {
                    Some(e) if e % 2 == 1 && !(exponent.len() == 1 && *e == 1) => Ok(()),
                    _ => Err(Error::bad_template("invalid RSA public exponent")),
                }
            }
            PublicKey::Ec { point, .. } => {
                // only the uncompressed form is accepted
                if point.first() == Some(&0x04) {
                    Ok(())
                } else {
                    Err(Error::bad_template("invalid EC point encoding"))
                }
            }
            PublicKey::Dsa { p, q, g, y } => {
                if p.is_empty() || q.is_empty() || g.is_empty() || y.is_empty() {
                    Err(Error::bad_template("incomplete DSA public key"))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Stable byte encoding of the key, input to the key fingerprint.
    pub fn key_bytes(&self) -> Vec<u8> {
        // serde_json struct encoding is stable for a fixed type
        serde_json::to_vec(self).expect("key serialization cannot fail")
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.key_bytes())
    }
}

/// A freshly generated key pair. The private key is handed to the caller
/// and never persisted by the engine.
#[derive(Clone, Debug)]
pub struct KeyPair {
    pub public: PublicKey,
    /// DER-encoded private key.
    pub private: Vec<u8>,
}

//------------ KeypairGenControl ---------------------------------------------

/// Profile directive for CA-side key pair generation.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum KeypairGenControl {
    Forbidden,
    /// Use the same algorithm and parameters as the CA's own key.
    InheritCa,
    Rsa {
        key_size: u32,
    },
    Ec {
        curve: EcCurve,
    },
    Dsa {
        key_size: u32,
    },
}

//------------ CrlReason -----------------------------------------------------

/// Standard CRL reason codes (RFC 5280 section 5.3.1).
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum CrlReason {
    Unspecified,
    KeyCompromise,
    CaCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
    CertificateHold,
    RemoveFromCrl,
    PrivilegeWithdrawn,
    AaCompromise,
}

impl CrlReason {
    pub fn code(&self) -> u8 {
        match self {
            CrlReason::Unspecified => 0,
            CrlReason::KeyCompromise => 1,
            CrlReason::CaCompromise => 2,
            CrlReason::AffiliationChanged => 3,
            CrlReason::Superseded => 4,
            CrlReason::CessationOfOperation => 5,
            CrlReason::CertificateHold => 6,
            CrlReason::RemoveFromCrl => 8,
            CrlReason::PrivilegeWithdrawn => 9,
            CrlReason::AaCompromise => 10,
        }
    }

    /// Whether the reason may be used through the direct revocation API.
    /// CA/AA compromise are reserved for CA revocation, removeFromCRL for
    /// delta-CRL bookkeeping.
    pub fn permitted_in_request(&self) -> bool {
        !matches!(
            self,
            CrlReason::CaCompromise | CrlReason::AaCompromise | CrlReason::RemoveFromCrl
        )
    }
}

impl fmt::Display for CrlReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            CrlReason::Unspecified => "unspecified",
            CrlReason::KeyCompromise => "keyCompromise",
            CrlReason::CaCompromise => "cACompromise",
            CrlReason::AffiliationChanged => "affiliationChanged",
            CrlReason::Superseded => "superseded",
            CrlReason::CessationOfOperation => "cessationOfOperation",
            CrlReason::CertificateHold => "certificateHold",
            CrlReason::RemoveFromCrl => "removeFromCRL",
            CrlReason::PrivilegeWithdrawn => "privilegeWithdrawn",
            CrlReason::AaCompromise => "aACompromise",
        };
        write!(f, "{}", s)
    }
}

//------------ RevocationInfo ------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RevocationInfo {
    pub reason: CrlReason,
    pub revoked_at: DateTime<Utc>,
    pub invalidity_at: Option<DateTime<Utc>>,
}

impl RevocationInfo {
    pub fn new(reason: CrlReason, invalidity_at: Option<DateTime<Utc>>) -> Self {
        RevocationInfo {
            reason,
            revoked_at: Utc::now(),
            invalidity_at,
        }
    }
}

//------------ CertStatus ----------------------------------------------------

/// Lifecycle state of an issued certificate. `Suspended` is revocation
/// with reason certificateHold.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum CertStatus {
    Valid,
    Revoked,
    Suspended,
    Expired,
    Removed,
    Unknown,
}

//------------ CertKind ------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum CertKind {
    Ca,
    EndEntity,
}

//------------ RequestType / RequestorInfo -----------------------------------

/// Protocol through which a request arrived. Informational only.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum RequestType {
    Cmp,
    Scep,
    Rest,
    Api,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RequestorInfo {
    pub name: String,
    /// Whether the requestor is a registration authority.
    pub ra: bool,
}

impl RequestorInfo {
    pub fn ra(name: &str) -> Self {
        RequestorInfo {
            name: name.to_string(),
            ra: true,
        }
    }

    pub fn end_entity(name: &str) -> Self {
        RequestorInfo {
            name: name.to_string(),
            ra: false,
        }
    }
}

//------------ Validity ------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ValidityUnit {
    Hour,
    Day,
    Year,
}

/// A validity duration in calendar units.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Serialize)]
pub struct Validity {
    pub count: u32,
    pub unit: ValidityUnit,
}

impl Validity {
    pub fn hours(count: u32) -> Self {
        Validity {
            count,
            unit: ValidityUnit::Hour,
        }
    }

    pub fn days(count: u32) -> Self {
        Validity {
            count,
            unit: ValidityUnit::Day,
        }
    }

    pub fn years(count: u32) -> Self {
        Validity {
            count,
            unit: ValidityUnit::Year,
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        match self.unit {
            ValidityUnit::Hour => chrono::Duration::hours(self.count as i64),
            ValidityUnit::Day => chrono::Duration::days(self.count as i64),
            ValidityUnit::Year => chrono::Duration::days(365 * self.count as i64),
        }
    }

    pub fn add_to(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        time + self.duration()
    }
}

impl PartialEq for Validity {
    fn eq(&self, other: &Self) -> bool {
        self.duration() == other.duration()
    }
}

impl PartialOrd for Validity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.duration().cmp(&other.duration()))
    }
}

/// Certificates must not outlive this instant.
pub fn end_of_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap()
}

//------------ ValidityMode --------------------------------------------------

/// How a notAfter beyond the CA's own validity is treated.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidityMode {
    /// Truncate silently to the CA's notAfter.
    Cutoff,
    /// Refuse issuance.
    #[default]
    Strict,
    /// Permit the overflow.
    Lax,
}

//------------ HourMinute ----------------------------------------------------

/// A daily point in time, evaluated in UTC.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HourMinute {
    pub hour: u32,
    pub minute: u32,
}

impl HourMinute {
    pub fn new(hour: u32, minute: u32) -> Self {
        HourMinute { hour, minute }
    }

    pub fn minute_of_day(&self) -> i64 {
        self.hour as i64 * 60 + self.minute as i64
    }
}

impl fmt::Display for HourMinute {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for HourMinute {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid hour:minute '{}'", s))?;
        let hour = u32::from_str(h).map_err(|_| format!("invalid hour in '{}'", s))?;
        let minute = u32::from_str(m).map_err(|_| format!("invalid minute in '{}'", s))?;
        if hour > 23 || minute > 59 {
            return Err(format!("hour:minute '{}' out of range", s));
        }
        Ok(HourMinute { hour, minute })
    }
}

impl TryFrom<String> for HourMinute {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        HourMinute::from_str(&s)
    }
}

impl From<HourMinute> for String {
    fn from(hm: HourMinute) -> Self {
        hm.to_string()
    }
}

//------------ Certificate structures ----------------------------------------

/// An X.509 extension in opaque value form.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CertExtension {
    pub oid: String,
    pub critical: bool,
    pub value: Vec<u8>,
}

/// The to-be-signed body of a certificate. Encoding is the signer's
/// concern; the engine only assembles the typed structure.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TbsCertificate {
    pub issuer: Name,
    pub serial: Serial,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub subject: Name,
    pub public_key: PublicKey,
    pub extensions: Vec<CertExtension>,
}

/// The CA's own certificate data, as resolved at startup.
#[derive(Clone, Debug)]
pub struct CaCertData {
    pub subject: Name,
    pub serial: Serial,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub public_key: PublicKey,
    pub cert: Bytes,
}

//------------ CertRecord / CertInfo -----------------------------------------

/// A stored certificate row. The internal id is assigned by the store and
/// orders records by insertion.
#[derive(Clone, Debug)]
pub struct CertRecord {
    pub id: i64,
    pub serial: Serial,
    pub kind: CertKind,
    pub subject: Name,
    pub subject_fp: Fingerprint,
    pub key_fp: Fingerprint,
    pub public_key: PublicKey,
    pub profile: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub cert: Bytes,
    pub status: CertStatus,
    pub revocation: Option<RevocationInfo>,
    pub last_update: DateTime<Utc>,
}

/// Result of a single issuance.
#[derive(Clone, Debug)]
pub struct CertInfo {
    pub record: CertRecord,
    /// Present when the CA generated the key pair on behalf of the
    /// requester. Returned once and never persisted.
    pub private_key: Option<Vec<u8>>,
    /// True when an update/renewal returned an existing certificate
    /// instead of issuing a fresh one.
    pub already_issued: bool,
    pub warning: Option<String>,
    pub requestor: String,
    pub req_type: RequestType,
    pub txn_id: Option<uuid::Uuid>,
}

//------------ CertTemplate --------------------------------------------------

/// A raw certificate request, as assembled by a protocol layer.
#[derive(Clone, Debug)]
pub struct CertTemplate {
    pub profile: String,
    pub subject: Name,
    pub public_key: Option<PublicKey>,
    /// Directive to generate the key pair on the CA side.
    pub ca_generate_keypair: bool,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub extensions: Vec<CertExtension>,
}

//------------ CRL structures ------------------------------------------------

/// A revoked-certificate record as fed into CRL assembly.
#[derive(Clone, Debug)]
pub struct RevokedCertEntry {
    pub id: i64,
    pub serial: Serial,
    pub kind: CertKind,
    pub revocation: RevocationInfo,
}

/// One CRL entry. Only the very first entry of an indirect CRL carries
/// the certificate-issuer extension.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CrlEntry {
    pub serial: Serial,
    pub revoked_at: DateTime<Utc>,
    pub reason: CrlReason,
    pub invalidity_at: Option<DateTime<Utc>>,
    pub cert_issuer: Option<Name>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct IssuingDistributionPoint {
    pub only_user_certs: bool,
    pub only_ca_certs: bool,
    pub indirect: bool,
}

/// Entry of the vendor-specific certificate-set CRL extension.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CrlCertSetEntry {
    pub serial: Serial,
    pub cert: Option<Vec<u8>>,
}

/// The to-be-signed body of a CRL.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TbsCertList {
    pub issuer: Name,
    pub this_update: DateTime<Utc>,
    pub next_update: Option<DateTime<Utc>>,
    pub entries: Vec<CrlEntry>,
    /// Key identifier of the CRL signer, not necessarily of the CA.
    pub auth_key_id: Fingerprint,
    pub crl_number: u64,
    pub idp: Option<IssuingDistributionPoint>,
    /// Freshest-CRL URIs; full CRLs only, when delta CRLs are enabled.
    pub freshest_crl: Option<Vec<String>>,
    pub cert_set: Option<Vec<CrlCertSetEntry>>,
}

/// A stored CRL.
#[derive(Clone, Debug)]
pub struct CrlRecord {
    pub number: u64,
    pub this_update: DateTime<Utc>,
    pub next_update: Option<DateTime<Utc>>,
    pub delta: bool,
    pub crl: Bytes,
}

//------------ PublishQueueEntry ---------------------------------------------

/// Durable record of a pending (re)publication. Removed only after the
/// publisher confirmed delivery.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PublishQueueEntry {
    pub publisher: String,
    pub cert_id: i64,
    pub ca_id: u32,
}

//------------ Tests ---------------------------------------------------------
