//! Local filesystem backend.

use anyhow::{Context, Result};
use async_recursion::async_recursion;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::os::unix::fs::PermissionsExt;
use tokio::io::AsyncWriteExt;

use crate::backend::{
    Error, FileDetails, FileMeta, FsClient, FsWriter, ListDirTask, ListSummary, Reader,
};
use crate::filter::is_match;
use crate::location::PathParams;

pub struct LocalClient {
    params: PathParams,
}

impl LocalClient {
    /// Normalizes `params.path` to an absolute, slash-normalized path (the
    /// working directory when empty). The trailing slash the grammar puts
    /// on directory paths is cleaned off so concrete file paths stay
    /// statable.
    pub fn new(params: &mut PathParams) -> Result<Self> {
        let absolute = if params.path.is_empty() {
            std::env::current_dir().context("cannot resolve the working directory")?
        } else {
            std::path::absolute(&params.path)
                .with_context(|| format!("cannot resolve local path {:?}", params.path))?
        };
        let mut path = absolute.to_string_lossy().replace('\\', "/");
        while path.len() > 1 && path.ends_with('/') {
            path.pop();
        }
        params.path = path;
        Ok(Self {
            params: params.clone(),
        })
    }

    /// Walks one directory level, descending when the task is recursive.
    /// Returns false as soon as the output channel is closed.
    #[async_recursion]
    async fn walk(
        &self,
        dir: &std::path::Path,
        out: &async_channel::Sender<FileDetails>,
        task: &ListDirTask,
        summary: &ListSummary,
    ) -> Result<bool> {
        if !task.hidden && file_name(dir).starts_with('.') {
            return Ok(true);
        }

        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("cannot open directory {:?} for reading", dir))?;
        let mut children = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed traversing directory {:?}", dir))?
        {
            children.push(entry);
        }
        children.sort_by_key(|entry| entry.file_name());

        for entry in children {
            let file_type = entry
                .file_type()
                .await
                .with_context(|| format!("failed reading the type of {:?}", entry.path()))?;
            if file_type.is_symlink() {
                continue;
            }
            if file_type.is_dir() {
                if task.recursive && !self.walk(&entry.path(), out, task, summary).await? {
                    return Ok(false);
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let metadata = entry
                .metadata()
                .await
                .with_context(|| format!("failed reading metadata from {:?}", entry.path()))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let mtime = metadata.modified().ok().map(DateTime::<Utc>::from);
            if !is_match(task, &name, mtime, metadata.len()) {
                continue;
            }

            let details = FileDetails {
                key: entry.path().to_string_lossy().replace('\\', "/"),
                size: metadata.len(),
                mtime,
                original_mtime: None,
                mode: metadata.permissions().mode() & 0o7777,
            };
            tracing::debug!(
                "list file: key={} size={} mode={:o}",
                details.key,
                details.size,
                details.mode
            );
            summary.record(details.size);
            if out.send(details).await.is_err() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl FsClient for LocalClient {
    async fn list_dir(
        &self,
        out: async_channel::Sender<FileDetails>,
        task: &ListDirTask,
        summary: &ListSummary,
    ) -> Result<()> {
        let root = std::path::PathBuf::from(&self.params.path);
        let metadata = tokio::fs::symlink_metadata(&root)
            .await
            .with_context(|| format!("list walk failed for {:?}", root))?;

        if metadata.is_file() {
            let name = file_name(&root);
            let mtime = metadata.modified().ok().map(DateTime::<Utc>::from);
            if is_match(task, &name, mtime, metadata.len()) {
                let details = FileDetails {
                    key: root.to_string_lossy().replace('\\', "/"),
                    size: metadata.len(),
                    mtime,
                    original_mtime: None,
                    mode: metadata.permissions().mode() & 0o7777,
                };
                summary.record(details.size);
                let _ = out.send(details).await;
            }
            return Ok(());
        }
        if !metadata.is_dir() {
            return Ok(());
        }

        self.walk(&root, &out, task, summary).await.map(|_| ())
    }

    async fn reader(&self, key: &str) -> Result<Reader> {
        let file = tokio::fs::File::open(key).await.map_err(|error| {
            if error.kind() == std::io::ErrorKind::NotFound {
                anyhow::Error::new(Error::NotFound(key.to_string()))
            } else {
                anyhow::Error::new(error).context(format!("cannot open {:?} for reading", key))
            }
        })?;
        let metadata = file
            .metadata()
            .await
            .with_context(|| format!("failed reading metadata from {:?}", key))?;
        let meta = FileMeta {
            mtime: metadata.modified().ok().map(DateTime::<Utc>::from),
            mode: metadata.permissions().mode() & 0o7777,
            attrs: Default::default(),
        };
        Ok(Reader::new(file, meta))
    }

    async fn writer(&self, key: &str, meta: Option<FileMeta>) -> Result<Box<dyn FsWriter>> {
        valid_fs_target(key).await?;

        let mode = match &meta {
            Some(meta) if meta.mode > 0 => meta.mode,
            _ => 0o666,
        };
        let file = open_with_mode(key, mode)
            .await
            .with_context(|| format!("cannot open {:?} for writing", key))?;
        if meta.as_ref().is_some_and(|meta| meta.mode > 0) {
            // explicit chmod so the requested bits survive the umask
            file.set_permissions(std::fs::Permissions::from_mode(mode))
                .await
                .with_context(|| format!("cannot set {:?} permissions to {:o}", key, mode))?;
        }

        Ok(Box::new(LocalWriter {
            file: Some(file),
            path: key.to_string(),
            mtime: meta.and_then(|meta| meta.mtime),
        }))
    }
}

/// Verifies the target is not an existing directory and creates any missing
/// parent directories with mode 0700.
async fn valid_fs_target(path: &str) -> Result<()> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_dir() => {
            return Err(Error::TargetConflict(path.to_string()).into());
        }
        Ok(_) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => {
            return Err(anyhow::Error::new(error).context(format!("cannot stat target {:?}", path)));
        }
    }

    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            let mut builder = tokio::fs::DirBuilder::new();
            builder.recursive(true).mode(0o700);
            builder
                .create(parent)
                .await
                .with_context(|| format!("cannot create parent directories for {:?}", path))?;
        }
    }
    Ok(())
}

async fn open_with_mode(path: &str, mode: u32) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .await
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

struct LocalWriter {
    file: Option<tokio::fs::File>,
    path: String,
    mtime: Option<DateTime<Utc>>,
}

#[async_trait]
impl FsWriter for LocalWriter {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("writer for {:?} is already closed", self.path))?;
        file.write_all(buf)
            .await
            .with_context(|| format!("failed writing to {:?}", self.path))?;
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .with_context(|| format!("failed flushing {:?}", self.path))?;
        }
        let Some(mtime) = self.mtime else {
            return Ok(());
        };
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let times = nix::sys::time::TimeSpec::new(
                mtime.timestamp(),
                mtime.timestamp_subsec_nanos() as i64,
            );
            nix::sys::stat::utimensat(
                None,
                std::path::Path::new(&path),
                &times,
                &times,
                nix::sys::stat::UtimensatFlags::NoFollowSymlink,
            )
            .with_context(|| format!("failed setting the mtime of {:?}", path))?;
            Ok(())
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::new_client;
    use crate::location::parse_location;
    use chrono::Duration;
    use test_log::test;

    async fn client_for(dir: &std::path::Path) -> (LocalClient, PathParams) {
        let mut params = parse_location(&dir.to_string_lossy(), true).unwrap();
        let client = LocalClient::new(&mut params).unwrap();
        (client, params)
    }

    async fn write_file(
        client: &LocalClient,
        path: &std::path::Path,
        content: &[u8],
        meta: Option<FileMeta>,
    ) {
        let mut writer = client
            .writer(&path.to_string_lossy(), meta)
            .await
            .unwrap();
        writer.write_all(content).await.unwrap();
        writer.close().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_writer_reader_roundtrip() {
        let tmp = crate::testutils::temp_dir().await.unwrap();
        let (client, _) = client_for(tmp.path()).await;
        let path = tmp.path().join("a.txt");
        write_file(&client, &path, b"dummy content", None).await;

        let mut reader = client.reader(&path.to_string_lossy()).await.unwrap();
        let mut data = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut data)
            .await
            .unwrap();
        assert_eq!(data, b"dummy content");
    }

    #[test(tokio::test)]
    async fn test_writer_applies_mode_and_mtime() {
        let tmp = crate::testutils::temp_dir().await.unwrap();
        let (client, _) = client_for(tmp.path()).await;
        let mtime = Utc::now() - Duration::hours(23);
        let meta = FileMeta {
            mtime: Some(mtime),
            mode: 0o777,
            attrs: Default::default(),
        };
        let path = tmp.path().join("a.csv");
        write_file(&client, &path, b"dummy content", Some(meta)).await;

        let reader = client.reader(&path.to_string_lossy()).await.unwrap();
        let meta = reader.meta();
        assert_eq!(meta.mode, 0o777);
        assert_eq!(meta.mtime.unwrap().timestamp(), mtime.timestamp());
    }

    #[test(tokio::test)]
    async fn test_writer_creates_missing_parents() {
        let tmp = crate::testutils::temp_dir().await.unwrap();
        let (client, _) = client_for(tmp.path()).await;
        let path = tmp.path().join("sub").join("deeper").join("a.txt");
        write_file(&client, &path, b"x", None).await;

        let parent_mode = std::fs::metadata(tmp.path().join("sub"))
            .unwrap()
            .permissions()
            .mode()
            & 0o7777;
        assert_eq!(parent_mode, 0o700);
        assert_eq!(std::fs::read(&path).unwrap(), b"x");
    }

    #[test(tokio::test)]
    async fn test_writer_rejects_directory_target() {
        let tmp = crate::testutils::temp_dir().await.unwrap();
        let (client, _) = client_for(tmp.path()).await;
        let error = match client.writer(&tmp.path().to_string_lossy(), None).await {
            Ok(_) => panic!("expected writer to fail"),
            Err(e) => e,
        };
        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::TargetConflict(_))
        ));
    }

    #[test(tokio::test)]
    async fn test_reader_missing_file_is_not_found() {
        let tmp = crate::testutils::temp_dir().await.unwrap();
        let (client, _) = client_for(tmp.path()).await;
        let missing = tmp.path().join("nope.txt");
        let error = match client.reader(&missing.to_string_lossy()).await {
            Ok(_) => panic!("expected reader to fail"),
            Err(e) => e,
        };
        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::NotFound(_))
        ));
    }

    #[test(tokio::test)]
    async fn test_list_skips_symlinks() {
        let tmp = crate::testutils::temp_dir().await.unwrap();
        let (client, params) = client_for(tmp.path()).await;
        write_file(&client, &tmp.path().join("real.txt"), b"content", None).await;
        tokio::fs::symlink(tmp.path().join("real.txt"), tmp.path().join("link.txt"))
            .await
            .unwrap();

        let task = ListDirTask {
            source: params,
            ..Default::default()
        };
        let summary = ListSummary::default();
        let (tx, rx) = async_channel::bounded(16);
        client.list_dir(tx, &task, &summary).await.unwrap();
        let mut keys = vec![];
        while let Ok(details) = rx.recv().await {
            keys.push(details.key);
        }
        assert_eq!(keys.len(), 1);
        assert!(keys[0].ends_with("real.txt"));
    }

    #[test(tokio::test)]
    async fn test_non_recursive_list_stays_at_root_level() {
        let tmp = crate::testutils::temp_dir().await.unwrap();
        let (client, params) = client_for(tmp.path()).await;
        write_file(&client, &tmp.path().join("top.txt"), b"1", None).await;
        write_file(&client, &tmp.path().join("sub").join("below.txt"), b"2", None).await;

        let task = ListDirTask {
            source: params.clone(),
            ..Default::default()
        };
        let summary = ListSummary::default();
        let (tx, rx) = async_channel::bounded(16);
        client.list_dir(tx, &task, &summary).await.unwrap();
        drop(rx);
        assert_eq!(summary.total_files(), 1);

        let task = ListDirTask {
            source: params,
            recursive: true,
            ..Default::default()
        };
        let summary = ListSummary::default();
        let (tx, rx) = async_channel::bounded(16);
        client.list_dir(tx, &task, &summary).await.unwrap();
        drop(rx);
        assert_eq!(summary.total_files(), 2);
    }

    #[test(tokio::test)]
    async fn test_single_file_root_is_listed() {
        let tmp = crate::testutils::temp_dir().await.unwrap();
        let (client, _) = client_for(tmp.path()).await;
        write_file(&client, &tmp.path().join("only.txt"), b"abc", None).await;

        let mut params = parse_location(&tmp.path().join("only.txt").to_string_lossy(), true)
            .unwrap();
        let client = new_client(&mut params).unwrap();
        let task = ListDirTask {
            source: params,
            ..Default::default()
        };
        let summary = ListSummary::default();
        let (tx, rx) = async_channel::bounded(16);
        client.list_dir(tx, &task, &summary).await.unwrap();
        let details = rx.recv().await.unwrap();
        assert!(details.key.ends_with("only.txt"));
        assert_eq!(details.size, 3);
        assert_eq!(summary.total_files(), 1);
    }
}
