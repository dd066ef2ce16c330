//! The uniform backend contract shared by the local, S3 and V3IO clients,
//! together with the data model flowing through the pipelines.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::local::LocalClient;
use crate::location::{Kind, PathParams};
use crate::s3::S3Client;
use crate::v3io::V3ioClient;

/// User-metadata key carrying the caller-preserved modification time
/// (RFC 3339) on object stores without a native mtime.
pub const ORIGINAL_MTIME_KEY: &str = "original_mtime";
/// User-metadata key carrying the caller-preserved permission bits
/// (decimal integer).
pub const ORIGINAL_MODE_KEY: &str = "original_mode";

pub(crate) const FILE_CHANNEL_CAPACITY: usize = 1000;
pub(crate) const ERROR_CHANNEL_CAPACITY: usize = 60;

/// Failure kinds the engine distinguishes. Constructed at the point of
/// failure and carried through `anyhow::Error`, so callers can
/// `downcast_ref::<Error>()` on the kind.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid location {location}: {reason}")]
    BadLocation { location: String, reason: String },
    #[error("bad credentials: {0}")]
    BadCredentials(String),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("target {0} is a directory")]
    TargetConflict(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("cannot decode {key}: {value:?}")]
    Decode { key: String, value: String },
}

/// Query parameters for one enumeration.
#[derive(Debug, Clone, Default)]
pub struct ListDirTask {
    pub source: PathParams,
    /// Lower bound on the item mtime; `None` means no bound.
    pub since: Option<DateTime<Utc>>,
    pub min_size: u64,
    /// Upper size bound in bytes; 0 means unbounded.
    pub max_size: u64,
    pub recursive: bool,
    /// Include zero-byte items.
    pub incl_empty: bool,
    /// Include names starting with `.`.
    pub hidden: bool,
    /// Carry mtime and mode across the transfer.
    pub with_meta: bool,
}

/// One enumerated item.
///
/// `key` is the backend-native identifier: the absolute slash-normalized
/// path for local items, `bucket/objectName` for S3 and the in-container
/// object key for V3IO.
#[derive(Debug, Clone, PartialEq)]
pub struct FileDetails {
    pub key: String,
    pub size: u64,
    /// The item's own modification time as reported by the backend.
    pub mtime: Option<DateTime<Utc>>,
    /// The caller-preserved mtime when present in user metadata.
    pub original_mtime: Option<DateTime<Utc>>,
    /// Permission bits; 0 when unavailable.
    pub mode: u32,
}

/// Write-side metadata. `attrs` is an open-ended attribute map reserved for
/// future use.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileMeta {
    pub mtime: Option<DateTime<Utc>>,
    pub mode: u32,
    pub attrs: HashMap<String, String>,
}

/// Running enumeration totals, incremented by the producer with each
/// emission and safe to read concurrently.
#[derive(Debug, Default)]
pub struct ListSummary {
    total_files: AtomicU64,
    total_bytes: AtomicU64,
}

impl ListSummary {
    pub fn record(&self, size: u64) {
        self.total_files.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
    }

    pub fn total_files(&self) -> u64 {
        self.total_files.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }
}

impl std::fmt::Display for ListSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "total files: {}, total bytes: {}",
            self.total_files(),
            self.total_bytes()
        )
    }
}

/// A byte stream opened for reading plus the stat captured at open time.
pub struct Reader {
    stream: std::pin::Pin<Box<dyn tokio::io::AsyncRead + Send>>,
    meta: FileMeta,
}

impl Reader {
    pub fn new(stream: impl tokio::io::AsyncRead + Send + 'static, meta: FileMeta) -> Self {
        Self {
            stream: Box::pin(stream),
            meta,
        }
    }

    /// The item's `FileMeta`. On object stores this prefers the
    /// caller-preserved `original_mtime`/`original_mode` user metadata over
    /// the native values.
    pub fn meta(&self) -> &FileMeta {
        &self.meta
    }
}

impl tokio::io::AsyncRead for Reader {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.stream.as_mut().poll_read(cx, buf)
    }
}

/// A sink opened for writing. `close` finalizes the object: object stores
/// flush the accumulated buffer as a single PUT, the local backend closes
/// the file and applies a requested mtime.
#[async_trait]
pub trait FsWriter: Send {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()>;
    async fn close(self: Box<Self>) -> Result<()>;
}

/// The capability set every backend exposes.
#[async_trait]
pub trait FsClient: Send + Sync {
    /// Enumerates items matching the task, sending each passing
    /// `FileDetails` to `out` and recording it in `summary`. The sender is
    /// moved in and dropped on every exit path, which closes the channel.
    /// The first fatal error aborts the enumeration.
    async fn list_dir(
        &self,
        out: async_channel::Sender<FileDetails>,
        task: &ListDirTask,
        summary: &ListSummary,
    ) -> Result<()>;

    /// Opens `key` for reading.
    async fn reader(&self, key: &str) -> Result<Reader>;

    /// Opens `key` for writing. When `meta` carries a non-zero mtime and/or
    /// mode the backend persists them. The writer must be closed.
    async fn writer(&self, key: &str, meta: Option<FileMeta>) -> Result<Box<dyn FsWriter>>;
}

/// Creates the backend client selected by `params.kind`.
///
/// Constructors may normalize `params` in place (absolute local path,
/// default endpoint, credentials from the environment) before first use,
/// which is why the factory takes it mutably.
pub fn new_client(params: &mut PathParams) -> Result<Box<dyn FsClient>> {
    match &params.kind {
        Kind::Local => Ok(Box::new(LocalClient::new(params)?)),
        Kind::S3 => Ok(Box::new(S3Client::new(params)?)),
        Kind::V3io => Ok(Box::new(V3ioClient::new(params)?)),
        Kind::Other(scheme) => Err(Error::BadLocation {
            location: params.to_string(),
            reason: format!("unknown backend {}, use s3, v3io or a local path", scheme),
        }
        .into()),
    }
}

pub(crate) fn default_from_env(param: &str, envvar: &str) -> String {
    if param.is_empty() {
        std::env::var(envvar).unwrap_or_default()
    } else {
        param.to_string()
    }
}

/// Looks up a user-metadata value, accepting both the raw key and the
/// server-normalized header form (e.g. `Original_mtime`).
pub(crate) fn meta_value<'a>(attrs: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(key))
        .map(|(_, value)| value.as_str())
}

/// Decodes the preserved mtime from user metadata. Unparseable values are
/// dropped with a debug log.
pub(crate) fn original_mtime(attrs: &HashMap<String, String>) -> Option<DateTime<Utc>> {
    let value = meta_value(attrs, ORIGINAL_MTIME_KEY)?;
    match DateTime::parse_from_rfc3339(value) {
        Ok(time) => Some(time.with_timezone(&Utc)),
        Err(error) => {
            tracing::debug!(
                "dropping undecodable {} value {:?}: {}",
                ORIGINAL_MTIME_KEY,
                value,
                error
            );
            None
        }
    }
}

/// Decodes the preserved mode from user metadata; 0 when absent or
/// unparseable.
pub(crate) fn original_mode(attrs: &HashMap<String, String>) -> u32 {
    let Some(value) = meta_value(attrs, ORIGINAL_MODE_KEY) else {
        return 0;
    };
    match value.parse::<u32>() {
        Ok(mode) => mode,
        Err(error) => {
            tracing::debug!(
                "dropping undecodable {} value {:?}: {}",
                ORIGINAL_MODE_KEY,
                value,
                error
            );
            0
        }
    }
}
