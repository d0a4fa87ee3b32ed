//! The certificate authority engine.

pub mod certauth;
pub mod crl;
pub mod dedup;
pub mod grant;
pub mod jobs;
pub mod profile;

pub use self::certauth::Ca;
