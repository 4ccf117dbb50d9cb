//! Wrapper prelude.
//!
//! The `pds-index` crate is the supported public entry point. Downstream code
//! should prefer importing from this prelude instead of depending on core
//! module paths.

pub use crate::{fixups, ledger, remote};
pub use crate::{
    CacheArtifact, CacheReport, CacheState, CatalogBuilder, IndexCatalog, IndexError, IndexInfo,
    IndexKey, IndexKind, IndexResult, IndexSettings, IndexStatus, ParseIndexKeyError, PdsIndex,
};
