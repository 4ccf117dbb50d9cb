//! # pds-index
//!
//! Local, query-ready copies of PDS archive index tables.
//!
//! This crate is the supported public entry point for instrument pipelines.
//! It keeps a small, stable surface over `pds-index-core`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use pds_index::prelude::*;
//!
//! let catalog = IndexCatalog::open(IndexSettings::from_env()).await?;
//! let index = catalog.index(&"mro.ctx.edr".parse()?);
//! let batch = index.get(true, false).await?;
//! ```

/// Convenience prelude with the stable, supported surface.
pub mod prelude;

/// Freshness ledger namespace (wrapper-only).
pub mod ledger {
    pub use pds_index_core::ledger::{CHECK_INTERVAL_HOURS, Ledger, LedgerEntry, LedgerError};
}

/// Remote strategy namespace (wrapper-only).
pub mod remote {
    pub use pds_index_core::remote::{
        ArchiveListing, Remote, RemoteError, RemoteKind, RemoteRegistry, StaticUrlTable,
    };
}

/// Per-index data fixes (wrapper-only).
pub mod fixups {
    pub use pds_index_core::fixups::{BatchFix, FixUp, FixupError, FixupRegistry, LineFix};
}

pub use pds_index_core::catalog::{CatalogBuilder, IndexCatalog};
pub use pds_index_core::error::{IndexError, IndexResult};
pub use pds_index_core::index::{CacheState, IndexInfo, IndexStatus, PdsIndex};
pub use pds_index_core::key::{IndexKey, ParseIndexKeyError};
pub use pds_index_core::layout::CacheArtifact;
pub use pds_index_core::materialize::{CacheReport, IndexKind};
pub use pds_index_core::settings::IndexSettings;
