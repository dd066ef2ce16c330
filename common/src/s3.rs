//! S3-compatible object store backend.
//!
//! Keys exposed by this backend are `bucket/objectName`. Modification times
//! and permission bits survive the trip through user metadata under the
//! `original_mtime` / `original_mode` keys, since the object API has no
//! native notion of either.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::backend::{
    self, Error, FileDetails, FileMeta, FsClient, FsWriter, ListDirTask, ListSummary, Reader,
    ORIGINAL_MODE_KEY, ORIGINAL_MTIME_KEY,
};
use crate::filter::is_match;
use crate::location::{split_path, PathParams};

const DEFAULT_ENDPOINT: &str = "s3.amazonaws.com";
const DEFAULT_REGION: &str = "us-east-1";

pub struct S3Client {
    params: PathParams,
    client: aws_sdk_s3::Client,
}

impl S3Client {
    /// Fills in the default endpoint and environment credentials, then
    /// builds a client pinned to that endpoint.
    pub fn new(params: &mut PathParams) -> Result<Self> {
        if params.endpoint.is_empty() {
            params.endpoint = DEFAULT_ENDPOINT.to_string();
        }
        params.user_key = backend::default_from_env(&params.user_key, "AWS_ACCESS_KEY_ID");
        params.secret = backend::default_from_env(&params.secret, "AWS_SECRET_ACCESS_KEY");

        let session_token = if params.token.is_empty() {
            None
        } else {
            Some(params.token.clone())
        };
        let credentials = aws_sdk_s3::config::Credentials::new(
            params.user_key.clone(),
            params.secret.clone(),
            session_token,
            None,
            "xcp",
        );
        let region = if params.tag.is_empty() {
            DEFAULT_REGION.to_string()
        } else {
            params.tag.clone()
        };
        let scheme = if params.secure { "https" } else { "http" };
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region))
            .endpoint_url(format!("{}://{}", scheme, params.endpoint))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Ok(Self {
            params: params.clone(),
            client: aws_sdk_s3::Client::from_conf(config),
        })
    }

    /// HEADs one object for the preserved mtime/mode user metadata.
    async fn head_meta(&self, key: &str) -> Result<(Option<DateTime<Utc>>, u32)> {
        let response = self
            .client
            .head_object()
            .bucket(&self.params.bucket)
            .key(key)
            .send()
            .await
            .map_err(|error| {
                Error::Transport(format!(
                    "head of {}/{} failed: {}",
                    self.params.bucket,
                    key,
                    DisplayErrorContext(&error)
                ))
            })?;
        Ok(match response.metadata() {
            Some(attrs) => (backend::original_mtime(attrs), backend::original_mode(attrs)),
            None => (None, 0),
        })
    }
}

#[async_trait]
impl FsClient for S3Client {
    async fn list_dir(
        &self,
        out: async_channel::Sender<FileDetails>,
        task: &ListDirTask,
        summary: &ListSummary,
    ) -> Result<()> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.params.bucket)
            .prefix(&self.params.path);
        if !task.recursive {
            // only the immediate level
            request = request.delimiter("/");
        }

        let mut pages = request.into_paginator().send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|error| {
                Error::Transport(format!(
                    "listing {} failed: {}",
                    self.params,
                    DisplayErrorContext(&error)
                ))
            })?;
            for object in page.contents() {
                let key = object.key().unwrap_or_default();
                if key.ends_with('/') {
                    // logical folder
                    continue;
                }
                let name = key.rsplit('/').next().unwrap_or(key);
                let size = object.size().unwrap_or(0).max(0) as u64;
                let mtime = object
                    .last_modified()
                    .and_then(|time| DateTime::from_timestamp(time.secs(), time.subsec_nanos()));
                if !is_match(task, name, mtime, size) {
                    continue;
                }

                // the list API does not return user metadata
                let (original_mtime, mode) = if task.with_meta {
                    self.head_meta(key).await?
                } else {
                    (None, 0)
                };
                let details = FileDetails {
                    key: format!("{}/{}", self.params.bucket, key),
                    size,
                    mtime,
                    original_mtime,
                    mode,
                };
                tracing::debug!("list object: key={} size={}", details.key, details.size);
                summary.record(size);
                if out.send(details).await.is_err() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn reader(&self, key: &str) -> Result<Reader> {
        let (bucket, object_key) = split_path(key);
        check_bucket_name(&bucket)?;
        check_object_key(&object_key)?;

        let response = self
            .client
            .get_object()
            .bucket(&bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|error| {
                let service = error.into_service_error();
                if service.is_no_such_key() {
                    anyhow::Error::new(Error::NotFound(key.to_string()))
                } else {
                    anyhow::Error::new(Error::Transport(format!(
                        "get of {} failed: {}",
                        key,
                        DisplayErrorContext(&service)
                    )))
                }
            })?;

        let mut meta = FileMeta {
            mtime: response
                .last_modified()
                .and_then(|time| DateTime::from_timestamp(time.secs(), time.subsec_nanos())),
            mode: 0,
            attrs: Default::default(),
        };
        if let Some(attrs) = response.metadata() {
            if let Some(original) = backend::original_mtime(attrs) {
                meta.mtime = Some(original);
            }
            meta.mode = backend::original_mode(attrs);
            meta.attrs = attrs.clone();
        }

        let stream = response.body.into_async_read();
        Ok(Reader::new(stream, meta))
    }

    async fn writer(&self, key: &str, meta: Option<FileMeta>) -> Result<Box<dyn FsWriter>> {
        let (bucket, object_key) = split_path(key);
        check_bucket_name(&bucket)?;
        let object_key = object_key
            .strip_prefix('/')
            .unwrap_or(&object_key)
            .to_string();
        check_object_key(&object_key)?;

        Ok(Box::new(S3Writer {
            client: self.client.clone(),
            bucket,
            key: object_key,
            buf: Vec::new(),
            meta,
        }))
    }
}

/// Buffers all written bytes and flushes them as a single PUT on close.
struct S3Writer {
    client: aws_sdk_s3::Client,
    bucket: String,
    key: String,
    buf: Vec<u8>,
    meta: Option<FileMeta>,
}

#[async_trait]
impl FsWriter for S3Writer {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        let body = aws_sdk_s3::primitives::ByteStream::from(std::mem::take(&mut self.buf));
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .body(body);
        if let Some(meta) = &self.meta {
            request = request.set_metadata(Some(user_metadata(meta)));
        }
        request.send().await.map_err(|error| {
            Error::Transport(format!(
                "put of {}/{} failed: {}",
                self.bucket,
                self.key,
                DisplayErrorContext(&error)
            ))
        })?;
        Ok(())
    }
}

fn user_metadata(meta: &FileMeta) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    if let Some(mtime) = meta.mtime {
        attrs.insert(
            ORIGINAL_MTIME_KEY.to_string(),
            mtime.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }
    attrs.insert(ORIGINAL_MODE_KEY.to_string(), meta.mode.to_string());
    attrs
}

fn check_bucket_name(name: &str) -> Result<()> {
    let valid = name.len() >= 3
        && name.len() <= 63
        && !name.starts_with(['.', '-'])
        && !name.ends_with(['.', '-'])
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-');
    if !valid {
        return Err(Error::BadLocation {
            location: name.to_string(),
            reason: "invalid bucket name".to_string(),
        }
        .into());
    }
    Ok(())
}

fn check_object_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > 1024 {
        return Err(Error::BadLocation {
            location: key.to_string(),
            reason: "invalid object name".to_string(),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_name_validation() {
        assert!(check_bucket_name("my-bucket.1").is_ok());
        assert!(check_bucket_name("ab").is_err());
        assert!(check_bucket_name("UPPER").is_err());
        assert!(check_bucket_name("-leading").is_err());
        assert!(check_bucket_name("trailing.").is_err());
        assert!(check_bucket_name(&"x".repeat(64)).is_err());
    }

    #[test]
    fn test_object_key_validation() {
        assert!(check_object_key("dir/file.txt").is_ok());
        assert!(check_object_key("").is_err());
        assert!(check_object_key(&"x".repeat(1025)).is_err());
    }

    #[test]
    fn test_user_metadata_keys() {
        let meta = FileMeta {
            mtime: Some(DateTime::from_timestamp(1537971020, 0).unwrap()),
            mode: 0o777,
            attrs: Default::default(),
        };
        let attrs = user_metadata(&meta);
        assert_eq!(
            attrs.get(ORIGINAL_MTIME_KEY).map(String::as_str),
            Some("2018-09-26T14:10:20Z")
        );
        assert_eq!(
            attrs.get(ORIGINAL_MODE_KEY).map(String::as_str),
            Some("511")
        );
    }

    #[test]
    fn test_user_metadata_without_mtime() {
        let meta = FileMeta::default();
        let attrs = user_metadata(&meta);
        assert!(!attrs.contains_key(ORIGINAL_MTIME_KEY));
        assert_eq!(attrs.get(ORIGINAL_MODE_KEY).map(String::as_str), Some("0"));
    }
}
