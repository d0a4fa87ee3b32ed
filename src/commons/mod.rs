//! Types and traits shared across the CA engine.

pub mod audit;
pub mod crypto;
pub mod error;
pub mod store;

pub use self::error::{Error, ErrorWithIndex};

/// Result type used all over the crate.
pub type KilnResult<T> = Result<T, Error>;
