use anyhow::Result;
use chrono::{Duration, Utc};

use crate::backend::{FileMeta, FsClient};
use crate::local::LocalClient;
use crate::location::parse_location;

pub(crate) const DUMMY_CONTENT: &[u8] = b"dummy content";

/// A temporary directory with a non-hidden name, so default listings see it.
pub(crate) async fn temp_dir() -> Result<tempfile::TempDir> {
    Ok(tempfile::Builder::new().prefix("xcp-test-").tempdir()?)
}

/// A directory holding the standard fixture:
/// - `a.txt`, 13 bytes
/// - `a.csv`, 13 bytes, mtime now-23h, mode 0777
///
/// Both files are written through the local backend writer.
pub(crate) async fn setup_dummy_dir() -> Result<tempfile::TempDir> {
    let tmp = temp_dir().await?;
    let mut params = parse_location(&tmp.path().to_string_lossy(), true)?;
    let client = LocalClient::new(&mut params)?;

    let mut writer = client
        .writer(&tmp.path().join("a.txt").to_string_lossy(), None)
        .await?;
    writer.write_all(DUMMY_CONTENT).await?;
    writer.close().await?;

    let meta = FileMeta {
        mtime: Some(Utc::now() - Duration::hours(23)),
        mode: 0o777,
        attrs: Default::default(),
    };
    let mut writer = client
        .writer(&tmp.path().join("a.csv").to_string_lossy(), Some(meta))
        .await?;
    writer.write_all(DUMMY_CONTENT).await?;
    writer.close().await?;

    Ok(tmp)
}
