#![allow(missing_docs)]

use pds_index::{prelude::*, remote::Remote};
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[test]
fn keys_parse_through_the_prelude() -> TestResult {
    let key: IndexKey = "missions.mro.ctx.edr".parse()?;
    assert_eq!(key.to_string(), "mro.ctx.edr");
    assert!("mro.ctx".parse::<IndexKey>().is_err());
    assert_eq!(IndexKind::for_key(&"cassini.iss.inventory".parse()?), IndexKind::Inventory);
    Ok(())
}

#[tokio::test]
async fn catalog_reports_uncached_without_touching_the_network() -> TestResult {
    let tmp = TempDir::new()?;
    let catalog = IndexCatalog::open(IndexSettings::with_root(tmp.path())).await?;

    let ctx = catalog.index(&"mro.ctx.edr".parse()?);
    assert_eq!(ctx.remote().kind(), remote::RemoteKind::Dynamic);
    let status = ctx.status().await?;
    assert_eq!(status.state, CacheState::Uncached);
    assert!(!status.stale);

    let go = catalog.index(&"go.ssi.index".parse()?);
    assert_eq!(go.remote().kind(), remote::RemoteKind::Static);
    Ok(())
}
