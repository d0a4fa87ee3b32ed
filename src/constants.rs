//! Constants used by the CA engine.

use std::time::Duration;

/// A CRL may only be signed this many minutes after an interval boundary.
pub const CRL_SIGN_WINDOW_MINUTES: i64 = 20;

/// A new CRL is skipped if the current one is younger than the signing
/// window plus this slack.
pub const CRL_RECENT_SLACK_MINUTES: i64 = 5;

/// Minimum distance between a CRL's thisUpdate and nextUpdate.
pub const CRL_MIN_WINDOW_MINUTES: i64 = 10;

/// How often the CRL interval scheduler wakes up.
pub const CRL_TICK_SECONDS: u32 = 60;

/// Page size for store queries during CRL assembly and sweeps.
pub const STORE_PAGE_SIZE: usize = 100;

/// Page size when draining the publish queue.
pub const PUBLISH_QUEUE_PAGE_SIZE: usize = 500;

/// Requested notBefore values may lie at most this far in the past, to
/// accommodate clients with skewed clocks.
pub const BACKDATE_TOLERANCE_SECONDS: i64 = 300;

/// Upper bound on attempts to disambiguate a duplicate subject by
/// incrementing its serialNumber attribute.
pub const SUBJECT_DISAMBIGUATION_ATTEMPTS: usize = 100;

/// Largest RSA modulus the CA will generate on behalf of a requester.
pub const MAX_GENERATED_RSA_BITS: u32 = 4096;

/// RSA moduli below this size are rejected as weak.
pub const MIN_RSA_MODULUS_BITS: u32 = 1024;

/// Largest RSA modulus accepted in a request.
pub const MAX_RSA_MODULUS_BITS: u32 = 8192;

/// How long a caller waits for an idle signer before giving up.
pub const SIGNER_BORROW_TIMEOUT: Duration = Duration::from_secs(10);

/// Number of concurrently usable signer instances in a pool.
pub const DEFAULT_SIGNER_POOL_SIZE: usize = 4;

/// Interval of the expired-certificate purge job.
pub const EXPIRED_PURGE_INTERVAL_SECONDS: u32 = 24 * 3600;

/// Interval of the suspended-certificate auto-revocation job.
pub const SUSPENDED_REVOKE_INTERVAL_SECONDS: u32 = 3600;

/// Maximum startup jitter applied to per-CA background jobs.
pub const JOB_START_JITTER_SECONDS: u64 = 3600;

/// Maximum startup jitter for the CRL tick.
pub const CRL_TICK_JITTER_SECONDS: u64 = 60;
