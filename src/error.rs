use std::fmt;

use serde::{ser::SerializeStruct, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::{Method, WireRequest};

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum ApiClientError {
    /// The call could not be turned into a request. Never retried.
    #[error("invalid call: {0}")]
    Validation(String),
    /// No response was received.
    #[error(transparent)]
    Network(Box<NetworkError>),
    /// 5xx response whose payload does not name the error.
    #[error(transparent)]
    Server(Box<RemoteError>),
    /// Any other non-2xx response.
    #[error(transparent)]
    Remote(Box<RemoteError>),
    /// A request modificator refused the request.
    #[error("request modificator failed: {0}")]
    Modificator(String),
    /// Response body could not be decoded into the requested type.
    #[error("decode error: {0}")]
    Decode(String),
    /// Invalid factory or transport configuration.
    #[error("configuration error: {0}")]
    Config(String),
    /// The owning factory was shut down.
    #[error("client factory has been shut down")]
    Shutdown,
}

impl ApiClientError {
    /// Error name as seen by remote peers and logs.
    pub fn name(&self) -> &str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::Network(_) => NetworkError::NAME,
            Self::Server(err) | Self::Remote(err) => &err.name,
            Self::Modificator(_) => "ModificatorError",
            Self::Decode(_) => "DecodeError",
            Self::Config(_) => "ConfigError",
            Self::Shutdown => "ShutdownError",
        }
    }

    /// HTTP status of a response failure; `None` when no response was received.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Server(err) | Self::Remote(err) => Some(err.http_status),
            _ => None,
        }
    }

    /// The peer answered 404.
    pub fn is_not_found(&self) -> bool {
        self.http_status() == Some(404)
    }

    /// Attempt bookkeeping for failures produced by the retry engine.
    pub fn retry_info(&self) -> Option<&RetryInfo> {
        match self {
            Self::Network(err) => Some(&err.retry_info),
            Self::Server(err) | Self::Remote(err) => Some(&err.retry_info),
            _ => None,
        }
    }

    pub fn as_network(&self) -> Option<&NetworkError> {
        match self {
            Self::Network(err) => Some(err),
            _ => None,
        }
    }

    /// The failure payload for both unnamed 5xx and named remote errors.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Server(err) | Self::Remote(err) => Some(err),
            _ => None,
        }
    }
}

impl From<NetworkError> for ApiClientError {
    fn from(err: NetworkError) -> Self {
        Self::Network(Box::new(err))
    }
}

/// Low-level failure codes, named after the errno values peers log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum NetworkErrorCode {
    #[serde(rename = "ECONNRESET")]
    ConnectionReset,
    #[serde(rename = "ECONNREFUSED")]
    ConnectionRefused,
    #[serde(rename = "ETIMEDOUT")]
    TimedOut,
    #[serde(rename = "EHOSTUNREACH")]
    HostUnreachable,
    #[serde(rename = "ENOTFOUND")]
    DnsFailure,
    #[serde(rename = "EPIPE")]
    BrokenPipe,
    #[serde(rename = "ENETWORK")]
    Other,
}

impl NetworkErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionReset => "ECONNRESET",
            Self::ConnectionRefused => "ECONNREFUSED",
            Self::TimedOut => "ETIMEDOUT",
            Self::HostUnreachable => "EHOSTUNREACH",
            Self::DnsFailure => "ENOTFOUND",
            Self::BrokenPipe => "EPIPE",
            Self::Other => "ENETWORK",
        }
    }

    /// The failure happened before a connection existed, so the peer never
    /// saw the request.
    pub const fn never_reached_peer(self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused | Self::HostUnreachable | Self::DnsFailure
        )
    }
}

impl fmt::Display for NetworkErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed attempt that was followed by a retry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub attempt: u32,
    pub code: NetworkErrorCode,
    pub elapsed_ms: u64,
}

/// How many attempts a call took and why it stopped.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryInfo {
    /// Number of attempts made, starting at 1.
    #[serde(rename = "try")]
    pub tries: u32,
    /// Verdict of the retry strategy on the last failure; `None` when the
    /// strategy was not consulted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_supported: Option<bool>,
    /// Most recent retried failures, oldest first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<AttemptRecord>,
    /// Retried failures no longer kept in `history`.
    #[serde(skip_serializing_if = "is_zero")]
    pub history_dropped: usize,
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

/// Transport failure: the call never got a response.
///
/// The message is the error code. Serialized, only `name`, `code` and
/// `message` are exposed.
#[derive(Debug, thiserror::Error)]
#[error("{code}")]
pub struct NetworkError {
    pub code: NetworkErrorCode,
    pub retry_info: RetryInfo,
    /// Request as it was last sent.
    pub request: WireRequest,
    #[source]
    pub source: Option<reqwest::Error>,
}

impl NetworkError {
    pub const NAME: &'static str = "NetworkError";

    /// Error with empty retry bookkeeping and no transport source.
    pub fn new(code: NetworkErrorCode, request: WireRequest) -> Self {
        Self {
            code,
            retry_info: RetryInfo::default(),
            request,
            source: None,
        }
    }

    /// Same text as the code, as peers expect.
    pub fn message(&self) -> &'static str {
        self.code.as_str()
    }
}

impl Serialize for NetworkError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("NetworkError", 3)?;
        state.serialize_field("name", Self::NAME)?;
        state.serialize_field("code", self.code.as_str())?;
        state.serialize_field("message", self.message())?;
        state.end()
    }
}

/// Non-2xx response from the peer.
///
/// Fields of a JSON object payload are kept in `payload`; serialized they are
/// flattened next to `name`, `httpStatus` and `message`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteError {
    pub name: String,
    pub http_status: u16,
    pub message: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
    #[serde(skip)]
    pub method: Method,
    #[serde(skip)]
    pub url: String,
    #[serde(skip)]
    pub retry_info: RetryInfo,
}

impl RemoteError {
    pub const SERVER_ERROR: &'static str = "ServerError";
    pub const REMOTE_ERROR: &'static str = "RemoteError";

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (http {}) for {} {}: {}",
            self.name, self.http_status, self.method, self.url, self.message
        )
    }
}

impl std::error::Error for RemoteError {}
