//! The copy pipeline: one producer enumerating the source and W workers
//! draining a bounded channel, each owning its private source and target
//! clients.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::backend::{
    new_client, FileDetails, FsClient, ListDirTask, ListSummary, ERROR_CHANNEL_CAPACITY,
    FILE_CHANNEL_CAPACITY,
};
use crate::location::{ends_with_slash, Kind, PathParams};

const DEFAULT_READ_BUFFER: usize = 128 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct CopySettings {
    /// Number of worker tasks.
    pub workers: usize,
    /// Keep peers running after a failure and report the first recorded
    /// error only at the end. The default cancels the whole pipeline on the
    /// first error.
    pub best_effort: bool,
    /// Chunk size for the per-item stream copy.
    pub read_buffer: usize,
}

impl Default for CopySettings {
    fn default() -> Self {
        Self {
            workers: 8,
            best_effort: false,
            read_buffer: DEFAULT_READ_BUFFER,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopySummary {
    pub files_copied: u64,
    pub bytes_copied: u64,
}

impl std::fmt::Display for CopySummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "transferred files: {}, transferred bytes: {}",
            self.files_copied, self.bytes_copied
        )
    }
}

#[derive(Debug, Default)]
struct Counters {
    files: AtomicU64,
    bytes: AtomicU64,
}

/// Copies every item of `task.source` matching the task to `target`,
/// preserving relative key paths.
///
/// Returns the first producer or worker error after all tasks have been
/// joined; a failing worker stops consuming further items, and unless
/// `settings.best_effort` is set the first error also cancels its peers.
/// Cancelling `cancel` aborts the enumeration and all transfers.
pub async fn copy_dir(
    task: &mut ListDirTask,
    target: &mut PathParams,
    settings: &CopySettings,
    cancel: &CancellationToken,
) -> Result<CopySummary> {
    // workers strip the source path as a prefix to derive relative keys;
    // the local constructor cleans the slash back off when normalizing
    if !task.source.path.is_empty() && !ends_with_slash(&task.source.path) {
        task.source.path.push('/');
    }
    tracing::debug!("copy task from {} to {}", task.source, target);

    let producer_client =
        new_client(&mut task.source).context("failed to create the copy source client")?;
    // constructing the target here surfaces credential and location
    // problems before any worker spawns
    new_client(target).context("failed to create the copy target client")?;

    let (item_tx, item_rx) = async_channel::bounded::<FileDetails>(FILE_CHANNEL_CAPACITY);
    let (error_tx, error_rx) = async_channel::bounded::<anyhow::Error>(ERROR_CHANNEL_CAPACITY);
    let summary = Arc::new(ListSummary::default());
    let counters = Arc::new(Counters::default());

    let producer = {
        let task = task.clone();
        let summary = summary.clone();
        let error_tx = error_tx.clone();
        let cancel = cancel.clone();
        let best_effort = settings.best_effort;
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                result = producer_client.list_dir(item_tx, &task, &summary) => {
                    if let Err(error) = result {
                        tracing::error!("copy source listing failed: {:#}", error);
                        let _ = error_tx.try_send(error);
                        if !best_effort {
                            cancel.cancel();
                        }
                    }
                }
            }
        })
    };

    let mut workers = tokio::task::JoinSet::new();
    for index in 0..settings.workers.max(1) {
        let task = task.clone();
        let target = target.clone();
        let items = item_rx.clone();
        let error_tx = error_tx.clone();
        let cancel = cancel.clone();
        let counters = counters.clone();
        let settings = *settings;
        workers.spawn(async move {
            if let Err(error) =
                run_worker(index, task, target, items, &counters, &settings, &cancel).await
            {
                tracing::error!("copy worker {} failed: {:#}", index, error);
                let _ = error_tx.try_send(error);
                if !settings.best_effort {
                    cancel.cancel();
                }
            }
        });
    }
    drop(item_rx);
    drop(error_tx);

    while workers.join_next().await.is_some() {}
    let _ = producer.await;

    let copy_summary = CopySummary {
        files_copied: counters.files.load(Ordering::Relaxed),
        bytes_copied: counters.bytes.load(Ordering::Relaxed),
    };
    tracing::info!("{} ({})", copy_summary, summary);

    match error_rx.try_recv() {
        Ok(error) => Err(error),
        Err(_) => Ok(copy_summary),
    }
}

/// One worker: owns a private source and target client pair and drains the
/// item channel until it closes, the token is cancelled or an item fails.
async fn run_worker(
    index: usize,
    task: ListDirTask,
    target: PathParams,
    items: async_channel::Receiver<FileDetails>,
    counters: &Counters,
    settings: &CopySettings,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut source_params = task.source.clone();
    let mut target_params = target;
    let source = new_client(&mut source_params).context("failed to create a worker source client")?;
    let destination =
        new_client(&mut target_params).context("failed to create a worker target client")?;

    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            received = items.recv() => match received {
                Ok(item) => item,
                Err(_) => return Ok(()),
            },
        };

        let target_key = target_key(&item, &source_params, &target_params);
        tracing::debug!(
            "worker {} copying {} -> {} ({} bytes)",
            index,
            item.key,
            target_key,
            item.size
        );
        copy_file(
            source.as_ref(),
            destination.as_ref(),
            &item,
            &target_key,
            &task,
            settings,
        )
        .await
        .with_context(|| format!("copy of {} to {} failed", item.key, target_key))?;

        counters.files.fetch_add(1, Ordering::Relaxed);
        counters.bytes.fetch_add(item.size, Ordering::Relaxed);
    }
}

/// Streams exactly `item.size` bytes from the source to the target,
/// propagating the source stat as write-side metadata when the task asks
/// for it.
async fn copy_file(
    source: &dyn FsClient,
    destination: &dyn FsClient,
    item: &FileDetails,
    target_key: &str,
    task: &ListDirTask,
    settings: &CopySettings,
) -> Result<()> {
    let reader = source.reader(&item.key).await?;
    let meta = if task.with_meta {
        Some(reader.meta().clone())
    } else {
        None
    };
    let mut writer = destination.writer(target_key, meta).await?;

    let mut remaining = reader.take(item.size);
    let mut buf = vec![0u8; settings.read_buffer.max(1)];
    loop {
        let n = remaining
            .read(&mut buf)
            .await
            .with_context(|| format!("failed reading data from {:?}", item.key))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .await
            .with_context(|| format!("failed copying data to {:?}", target_key))?;
    }
    writer
        .close()
        .await
        .with_context(|| format!("failed finalizing {:?}", target_key))?;
    Ok(())
}

/// The item's path relative to the source prefix. Object-store keys carry a
/// leading bucket component the source path does not, which is stripped
/// first; a single-file source yields the key's basename.
fn relative_key(item_key: &str, source: &PathParams) -> String {
    let key = match source.kind {
        Kind::S3 => {
            let bucket_prefix = format!("{}/", source.bucket);
            item_key.strip_prefix(&bucket_prefix).unwrap_or(item_key)
        }
        _ => item_key,
    };
    let relative = key
        .strip_prefix(source.path.as_str())
        .unwrap_or(key)
        .trim_start_matches('/');
    if relative.is_empty() {
        key.rsplit('/').next().unwrap_or(key).to_string()
    } else {
        relative.to_string()
    }
}

fn target_key(item: &FileDetails, source: &PathParams, target: &PathParams) -> String {
    let path = join_path(&target.path, &relative_key(&item.key, source));
    match target.kind {
        // object-store writers address `bucket/objectName`
        Kind::S3 => format!("{}/{}", target.bucket, path),
        _ => path,
    }
}

fn join_path(base: &str, relative: &str) -> String {
    if base.is_empty() {
        relative.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, relative)
    } else {
        format!("{}/{}", base, relative)
    }
}
