use std::{
    collections::BTreeMap,
    error::Error as StdError,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use futures::TryStream;
use serde::Serialize;
use serde_json::Value;

use crate::{
    context::SECRET_HEADER, options::ResponseEncoding, util::lock_unpoisoned, ApiClientError,
    Result,
};

/// Headers whose values never appear in `Debug` output.
const REDACTED_HEADERS: [&str; 2] = ["authorization", SECRET_HEADER];

/// HTTP verbs supported by the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl Method {
    pub const ALL: [Method; 6] = [
        Method::Get,
        Method::Post,
        Method::Put,
        Method::Patch,
        Method::Delete,
        Method::Head,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
        }
    }

    /// Whether repeating the request has the same effect as sending it once.
    pub const fn is_idempotent(self) -> bool {
        matches!(self, Self::Get | Self::Head | Self::Put | Self::Delete)
    }

    pub(crate) fn to_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Patch => reqwest::Method::PATCH,
            Self::Delete => reqwest::Method::DELETE,
            Self::Head => reqwest::Method::HEAD,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request body that can be read exactly once.
///
/// Clones share the same underlying stream, so a body taken by one attempt is
/// gone for every later attempt.
#[derive(Clone)]
pub struct StreamBody {
    inner: Arc<Mutex<Option<reqwest::Body>>>,
}

impl StreamBody {
    pub fn new<S>(stream: S) -> Self
    where
        S: TryStream + Send + 'static,
        S::Error: Into<Box<dyn StdError + Send + Sync>>,
        Bytes: From<S::Ok>,
    {
        Self {
            inner: Arc::new(Mutex::new(Some(reqwest::Body::wrap_stream(stream)))),
        }
    }

    pub fn is_consumed(&self) -> bool {
        lock_unpoisoned(&self.inner).is_none()
    }

    pub(crate) fn take(&self) -> Option<reqwest::Body> {
        lock_unpoisoned(&self.inner).take()
    }
}

impl fmt::Debug for StreamBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamBody")
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

impl PartialEq for StreamBody {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Outbound request payload.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    Bytes(Bytes),
    Stream(StreamBody),
}

impl RequestBody {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }
}

impl From<Value> for RequestBody {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<Bytes> for RequestBody {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<StreamBody> for RequestBody {
    fn from(value: StreamBody) -> Self {
        Self::Stream(value)
    }
}

/// Fully resolved request, as handed to the transport.
///
/// Header names are stored lower-cased so each name appears once and the last
/// write wins.
#[derive(Clone, PartialEq)]
pub struct WireRequest {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: RequestBody,
    pub timeout: Option<Duration>,
    pub encoding: ResponseEncoding,
}

impl fmt::Debug for WireRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: BTreeMap<&str, &str> = self
            .headers
            .iter()
            .map(|(name, value)| {
                let value = if REDACTED_HEADERS.contains(&name.as_str()) {
                    "<redacted>"
                } else {
                    value.as_str()
                };
                (name.as_str(), value)
            })
            .collect();
        f.debug_struct("WireRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &headers)
            .field("query", &self.query)
            .field("body", &self.body)
            .field("timeout", &self.timeout)
            .field("encoding", &self.encoding)
            .finish()
    }
}

impl WireRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: RequestBody::Empty,
            timeout: None,
            encoding: ResponseEncoding::default(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn set_header(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        self.headers.remove(&name.to_ascii_lowercase())
    }

    pub fn set_query(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.query.insert(name.into(), value.into());
    }

    pub fn is_streamed(&self) -> bool {
        self.body.is_stream()
    }

    /// Connection pool key: `scheme://host:port`.
    pub fn host_key(&self) -> Result<String> {
        host_key(&self.url)
    }
}

pub(crate) fn host_key(url: &str) -> Result<String> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|err| ApiClientError::Validation(format!("invalid url '{url}': {err}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| ApiClientError::Validation(format!("url '{url}' has no host")))?;
    match parsed.port_or_known_default() {
        Some(port) => Ok(format!("{}://{host}:{port}", parsed.scheme())),
        None => Ok(format!("{}://{host}", parsed.scheme())),
    }
}
