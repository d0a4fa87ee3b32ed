//! The _Kiln_ library crate.
//!
//! Kiln is the issuance, revocation and CRL generation core of an X.509
//! Certificate Authority. It is a library: wire protocols (CMP, SCEP,
//! REST), key stores and the persistent database live behind narrow
//! contracts and are provided by the embedding server.

pub mod api;
pub mod commons;
pub mod config;
pub mod constants;
pub mod server;

#[cfg(test)]
pub mod test;
