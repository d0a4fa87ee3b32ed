//! The CA engine and its outward-facing collaborators.

pub mod ca;
pub mod publishers;
