//! Location grammar: maps user-facing location strings onto backend
//! addressing.
//!
//! A location is either a bare filesystem path or a URL of the form
//! `scheme://[user[:secret]@]host/path[#tag]`. A trailing glob segment in the
//! path (a final component containing `*`, `?` or `[`) is split off into the
//! filter; wildcards anywhere else are rejected.

use anyhow::Result;
use percent_encoding::percent_decode_str;

use crate::backend::Error;

/// Storage kind a location resolves to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Kind {
    #[default]
    Local,
    S3,
    V3io,
    /// Unrecognized scheme, passed through as-is. Rejected by the client
    /// factory.
    Other(String),
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Kind::Local => write!(f, "local"),
            Kind::S3 => write!(f, "s3"),
            Kind::V3io => write!(f, "v3io"),
            Kind::Other(scheme) => write!(f, "{}", scheme),
        }
    }
}

/// Addresses one endpoint: a local directory, an S3 bucket prefix or a V3IO
/// container path, together with the credentials and the filter that apply
/// to it.
///
/// Empty strings mean "unset". Backend constructors may normalize a value in
/// place (absolute local path, default endpoint, credentials from the
/// environment) before first use.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathParams {
    pub kind: Kind,
    pub endpoint: String,
    pub bucket: String,
    pub path: String,
    /// Region for S3, taken from the URL fragment.
    pub tag: String,
    pub secure: bool,
    pub user_key: String,
    pub secret: String,
    pub token: String,
    /// Glob matched against the final path component during enumeration.
    pub filter: String,
    /// Set when the user named a concrete path rather than a glob prefix.
    pub is_file: bool,
}

impl std::fmt::Display for PathParams {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}://{}/{}/{}",
            self.kind, self.endpoint, self.bucket, self.path
        )
    }
}

/// Parses a user location string into `PathParams`.
///
/// With `force_dir` set, a concrete (non-glob) path is taken to denote a
/// directory or object prefix; single named files still resolve since the
/// path is left statable.
pub fn parse_location(fullpath: &str, force_dir: bool) -> Result<PathParams> {
    if !fullpath.contains("://") {
        let mut params = PathParams::default();
        split_filter(fullpath, &mut params, force_dir)?;
        return Ok(params);
    }

    let url = url::Url::parse(fullpath).map_err(|error| Error::BadLocation {
        location: fullpath.to_string(),
        reason: error.to_string(),
    })?;

    let mut params = PathParams {
        tag: url.fragment().unwrap_or_default().to_string(),
        ..Default::default()
    };

    let path = decode(url.path(), fullpath)?;
    let path = path.strip_prefix('/').unwrap_or(&path);
    split_filter(path, &mut params, force_dir)?;

    let username = decode(url.username(), fullpath)?;
    match url.password() {
        // a password with no username is a bearer token
        Some(password) if username.is_empty() => params.token = decode(password, fullpath)?,
        Some(password) => {
            params.user_key = username;
            params.secret = decode(password, fullpath)?;
        }
        None => params.user_key = username,
    }

    let mut host = url.host_str().unwrap_or_default().to_string();
    if let Some(port) = url.port() {
        host = format!("{}:{}", host, port);
    }

    let scheme = url.scheme().to_ascii_lowercase();
    match scheme.as_str() {
        "s3" => {
            params.kind = Kind::S3;
            params.bucket = host;
        }
        "v3io" | "v3ios" => {
            params.kind = Kind::V3io;
            params.secure = scheme == "v3ios";
            params.endpoint = host;
            let (bucket, path) = split_path(&params.path);
            params.bucket = bucket;
            params.path = path;
        }
        "http" | "https" => {
            params.kind = Kind::S3;
            params.secure = scheme == "https";
            params.endpoint = host;
            let (bucket, path) = split_path(&params.path);
            params.bucket = bucket;
            params.path = path;
        }
        other => {
            params.kind = Kind::Other(other.to_string());
            params.endpoint = host;
        }
    }

    Ok(params)
}

/// Splits `path` into a bucket (the first component) and the remainder.
pub fn split_path(path: &str) -> (String, String) {
    let path = path.strip_prefix('/').unwrap_or(path);
    match path.split_once('/') {
        Some((bucket, rest)) => (bucket.to_string(), rest.to_string()),
        None => (path.to_string(), String::new()),
    }
}

/// Splits a trailing glob segment off `fullpath` into `params.filter`.
///
/// Wildcards in directory components are unsupported and rejected with
/// `BadLocation`.
fn split_filter(fullpath: &str, params: &mut PathParams, force_dir: bool) -> Result<()> {
    let (dir, last) = match fullpath.rfind('/') {
        Some(index) => fullpath.split_at(index + 1),
        None => ("", fullpath),
    };
    if has_magics(dir) {
        return Err(Error::BadLocation {
            location: fullpath.to_string(),
            reason: "no support for wildcard directory names".to_string(),
        }
        .into());
    }

    params.path = dir.to_string();
    if last.is_empty() || has_magics(last) {
        params.filter = last.to_string();
        return Ok(());
    }

    // a concrete final segment: with force_dir the path is taken to denote
    // a directory or object prefix and gets its trailing slash; the local
    // client cleans it back off while normalizing, keeping file paths
    // statable
    params.path = format!("{}{}", dir, last);
    if force_dir && !ends_with_slash(&params.path) {
        params.path.push('/');
    }
    params.is_file = true;
    Ok(())
}

pub(crate) fn has_magics(text: &str) -> bool {
    text.contains(['*', '?', '['])
}

pub(crate) fn ends_with_slash(path: &str) -> bool {
    path.ends_with('/') || path.ends_with('\\')
}

fn decode(text: &str, location: &str) -> Result<String> {
    let decoded = percent_decode_str(text)
        .decode_utf8()
        .map_err(|error| Error::BadLocation {
            location: location.to_string(),
            reason: error.to_string(),
        })?;
    Ok(decoded.into_owned())
}
