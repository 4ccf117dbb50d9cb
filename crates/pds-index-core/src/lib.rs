//! Core engine for local, query-ready copies of PDS archive index tables.
//!
//! This crate provides the pieces behind `pds-index`:
//!
//! - A file-backed freshness ledger that rate-limits remote checks to one
//!   per key per 24 hours (`ledger` module).
//! - Two interchangeable remote strategies: URLs from a shared static table
//!   checked by `Last-Modified`, and URLs discovered by scraping archive
//!   release listings (`remote` module).
//! - A PDS3 label parser and a label-driven fixed-width table decoder with
//!   tiered timestamp parsing (`label` and `decode` modules).
//! - A registry of per-index data fixes (`fixups` module) and inventory CSV
//!   expansion (`inventory` module).
//! - Atomic parquet cache materialization (`materialize` module) and the
//!   per-key facade and catalog (`index` and `catalog` modules).
//!
//! Instrument pipelines are expected to depend on the `pds-index` wrapper
//! rather than on module paths here.
#![deny(missing_docs)]
pub mod catalog;
pub mod clock;
pub mod decode;
pub mod error;
pub mod fixups;
pub mod http;
pub mod index;
pub mod inventory;
pub mod key;
pub mod label;
pub mod layout;
pub mod ledger;
pub mod materialize;
pub mod remote;
pub mod settings;
pub mod storage;

#[cfg(test)]
mod test_util;
