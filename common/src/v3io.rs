//! V3IO container backend, speaking the container web API over HTTP.
//!
//! Listing walks the container with `prefix`/`delimiter` queries and
//! recurses into the returned common prefixes; reads fetch the whole object
//! and writes flush the accumulated buffer as a single PUT. Keys are object
//! keys within the container.

use anyhow::{Context, Result};
use async_recursion::async_recursion;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

use crate::backend::{
    self, Error, FileDetails, FileMeta, FsClient, FsWriter, ListDirTask, ListSummary, Reader,
};
use crate::filter::is_match;
use crate::location::PathParams;

const V3IO_API_ENV: &str = "V3IO_API";
const V3IO_USER_ENV: &str = "V3IO_USERNAME";
const V3IO_PASSWORD_ENV: &str = "V3IO_PASSWORD";
const V3IO_ACCESS_KEY_ENV: &str = "V3IO_ACCESS_KEY";

const SESSION_KEY_HEADER: &str = "X-v3io-session-key";

// characters escaped within one path segment; `/` separators are kept
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

lazy_static::lazy_static! {
    static ref CONTENTS_RE: regex::Regex =
        regex::Regex::new(r"(?s)<Contents>(.*?)</Contents>").unwrap();
    static ref COMMON_PREFIXES_RE: regex::Regex =
        regex::Regex::new(r"(?s)<CommonPrefixes>(.*?)</CommonPrefixes>").unwrap();
}

pub struct V3ioClient {
    params: PathParams,
    http: reqwest::Client,
    base_url: String,
}

impl V3ioClient {
    /// Fills in the endpoint and credentials from the environment and pins
    /// the client to one container.
    pub fn new(params: &mut PathParams) -> Result<Self> {
        if params.token.is_empty() {
            params.user_key = backend::default_from_env(&params.user_key, V3IO_USER_ENV);
            params.secret = backend::default_from_env(&params.secret, V3IO_PASSWORD_ENV);
            params.token = backend::default_from_env(&params.token, V3IO_ACCESS_KEY_ENV);
        }
        params.endpoint = backend::default_from_env(&params.endpoint, V3IO_API_ENV);
        if params.endpoint.is_empty() {
            return Err(Error::BackendUnavailable(format!(
                "no v3io endpoint configured for {}, set {} or use v3io://<endpoint>/...",
                params, V3IO_API_ENV
            ))
            .into());
        }

        let http = reqwest::Client::builder()
            .build()
            .context("failed to initialize the v3io http client")?;
        let scheme = if params.secure { "https" } else { "http" };
        let base_url = format!("{}://{}/{}", scheme, params.endpoint, params.bucket);

        Ok(Self {
            params: params.clone(),
            http,
            base_url,
        })
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let request = self.http.request(method, url);
        if !self.params.token.is_empty() {
            request.header(SESSION_KEY_HEADER, &self.params.token)
        } else if !self.params.user_key.is_empty() {
            request.basic_auth(&self.params.user_key, Some(&self.params.secret))
        } else {
            request
        }
    }

    fn object_url(&self, key: &str) -> String {
        let escaped = key
            .split('/')
            .map(|segment| utf8_percent_encode(segment, SEGMENT).to_string())
            .collect::<Vec<_>>()
            .join("/");
        format!("{}/{}", self.base_url, escaped)
    }

    /// Lists one prefix level, following listing pagination, and recurses
    /// into common prefixes when the task asks for it. Returns false as
    /// soon as the output channel is closed.
    #[async_recursion]
    async fn get_dir(
        &self,
        path: &str,
        out: &async_channel::Sender<FileDetails>,
        task: &ListDirTask,
        summary: &ListSummary,
    ) -> Result<bool> {
        let mut marker = String::new();
        loop {
            let mut request = self
                .request(reqwest::Method::GET, &self.base_url)
                .query(&[("prefix", path), ("delimiter", "/")]);
            if !marker.is_empty() {
                request = request.query(&[("marker", marker.as_str())]);
            }
            let response = request.send().await.map_err(|error| {
                Error::Transport(format!("listing {} failed: {}", self.params, error))
            })?;
            check_status(response.status(), &self.params.to_string())?;
            let body = response.text().await.map_err(|error| {
                Error::Transport(format!("listing {} failed: {}", self.params, error))
            })?;
            let listing = parse_list_output(&body)?;

            for entry in &listing.contents {
                if entry.key.ends_with('/') {
                    continue;
                }
                let name = entry.key.rsplit('/').next().unwrap_or(&entry.key);
                let mtime = Some(parse_last_modified(&entry.last_modified)?);
                if !is_match(task, name, mtime, entry.size) {
                    continue;
                }

                let details = FileDetails {
                    key: entry.key.clone(),
                    size: entry.size,
                    mtime,
                    original_mtime: None,
                    mode: 0,
                };
                tracing::debug!("list object: key={} size={}", details.key, details.size);
                summary.record(entry.size);
                if out.send(details).await.is_err() {
                    return Ok(false);
                }
            }

            if task.recursive {
                for prefix in &listing.common_prefixes {
                    let trimmed = prefix.strip_suffix('/').unwrap_or(prefix);
                    let name = trimmed.rsplit('/').next().unwrap_or(trimmed);
                    if (task.hidden || !name.starts_with('.'))
                        && !self.get_dir(prefix, out, task, summary).await?
                    {
                        return Ok(false);
                    }
                }
            }

            if !listing.truncated || listing.next_marker.is_empty() {
                return Ok(true);
            }
            marker = listing.next_marker;
        }
    }
}

#[async_trait]
impl FsClient for V3ioClient {
    async fn list_dir(
        &self,
        out: async_channel::Sender<FileDetails>,
        task: &ListDirTask,
        summary: &ListSummary,
    ) -> Result<()> {
        self.get_dir(&self.params.path, &out, task, summary)
            .await
            .map(|_| ())
    }

    async fn reader(&self, key: &str) -> Result<Reader> {
        let response = self
            .request(reqwest::Method::GET, &self.object_url(key))
            .send()
            .await
            .map_err(|error| Error::Transport(format!("get of {} failed: {}", key, error)))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(key.to_string()).into());
        }
        check_status(response.status(), key)?;
        let body = response
            .bytes()
            .await
            .map_err(|error| Error::Transport(format!("get of {} failed: {}", key, error)))?;
        Ok(Reader::new(std::io::Cursor::new(body), FileMeta::default()))
    }

    async fn writer(&self, key: &str, meta: Option<FileMeta>) -> Result<Box<dyn FsWriter>> {
        if meta.is_some() {
            // the container API carries no user metadata on PUT
            tracing::debug!("v3io writer drops file metadata for {}", key);
        }
        Ok(Box::new(V3ioWriter {
            request: self.request(reqwest::Method::PUT, &self.object_url(key)),
            key: key.to_string(),
            buf: Vec::new(),
        }))
    }
}

/// Accumulates bytes and flushes them as one PUT on close.
struct V3ioWriter {
    request: reqwest::RequestBuilder,
    key: String,
    buf: Vec<u8>,
}

#[async_trait]
impl FsWriter for V3ioWriter {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        let response = self
            .request
            .body(std::mem::take(&mut self.buf))
            .send()
            .await
            .map_err(|error| Error::Transport(format!("put of {} failed: {}", self.key, error)))?;
        check_status(response.status(), &self.key)?;
        Ok(())
    }
}

fn check_status(status: reqwest::StatusCode, what: &str) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(Error::BadCredentials(format!("{} rejected with status {}", what, status)).into());
    }
    Err(Error::Transport(format!("{} failed with status {}", what, status)).into())
}

struct ListOutput {
    contents: Vec<ContentEntry>,
    common_prefixes: Vec<String>,
    truncated: bool,
    next_marker: String,
}

struct ContentEntry {
    key: String,
    size: u64,
    last_modified: String,
}

fn parse_list_output(xml: &str) -> Result<ListOutput> {
    let mut contents = vec![];
    for captures in CONTENTS_RE.captures_iter(xml) {
        let block = &captures[1];
        let key = extract_tag(block, "Key").ok_or_else(|| Error::Decode {
            key: "Key".to_string(),
            value: block.chars().take(80).collect(),
        })?;
        let size = extract_tag(block, "Size")
            .and_then(|size| size.trim().parse::<u64>().ok())
            .unwrap_or(0);
        let last_modified = extract_tag(block, "LastModified").unwrap_or_default();
        contents.push(ContentEntry {
            key: unescape_xml(&key),
            size,
            last_modified,
        });
    }

    let mut common_prefixes = vec![];
    for captures in COMMON_PREFIXES_RE.captures_iter(xml) {
        if let Some(prefix) = extract_tag(&captures[1], "Prefix") {
            common_prefixes.push(unescape_xml(&prefix));
        }
    }

    let truncated = extract_tag(xml, "IsTruncated").as_deref() == Some("true");
    let next_marker = extract_tag(xml, "NextMarker").unwrap_or_default();

    Ok(ListOutput {
        contents,
        common_prefixes,
        truncated,
        next_marker,
    })
}

fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].to_string())
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Container listings return naive timestamps; a `Z` suffix is appended
/// before parsing when no zone is present.
fn parse_last_modified(value: &str) -> Result<DateTime<Utc>> {
    let mut value = value.trim().to_string();
    if !value.ends_with('Z') && !value.contains('+') {
        value.push('Z');
    }
    DateTime::parse_from_rfc3339(&value)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|_| {
            Error::Decode {
                key: "lastModified".to_string(),
                value,
            }
            .into()
        })
}
