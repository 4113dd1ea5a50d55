//! Persist large key-value indexes in append-only data files.
//!
//! # Status
//!
//! `ledger-storage` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

pub mod datafile;
pub mod hdhm;
