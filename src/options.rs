use std::{collections::BTreeMap, fmt, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;

use crate::{pool::AgentOptions, retry::RetryPolicy, ApiClientError, Result};

/// Option keys understood by [`CallOptions`]. Anything else is ignored.
pub(crate) const RECOGNIZED_OPTION_KEYS: [&str; 11] = [
    "qs",
    "filter",
    "order",
    "range",
    "headers",
    "timeout",
    "encoding",
    "notFoundIsNull",
    "details",
    "test",
    "retryOnTransientError",
];

/// How the response body is decoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseEncoding {
    /// Parse as JSON, falling back to text when the body is not JSON.
    #[default]
    Json,
    Text,
    /// Raw bytes, no decoding.
    Binary,
}

/// Per-call options.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallOptions {
    /// Extra query parameters. Non-string values are sent as JSON text.
    pub qs: BTreeMap<String, Value>,
    /// Sent as the `filter` query parameter, JSON encoded.
    pub filter: Option<Value>,
    /// Sent as the `order` query parameter, JSON encoded.
    pub order: Option<Value>,
    /// Sent as the `range` query parameter, JSON encoded.
    pub range: Option<Value>,
    /// Headers with the highest precedence.
    pub headers: BTreeMap<String, String>,
    /// Per-call timeout in milliseconds.
    #[serde(rename = "timeout")]
    pub timeout_ms: Option<u64>,
    pub encoding: Option<ResponseEncoding>,
    /// Resolve a 404 response as an absent body instead of an error.
    pub not_found_is_null: bool,
    /// Resolve with the full response envelope instead of the bare body.
    pub details: bool,
    /// Assemble the request and return it without sending anything.
    pub test: bool,
    /// Allow retrying transient failures for non-idempotent methods.
    pub retry_on_transient_error: bool,
}

impl CallOptions {
    /// Reads options out of a JSON object, ignoring unknown keys.
    pub fn from_json_object(object: &Map<String, Value>) -> Result<Self> {
        let ignored: Vec<&str> = object
            .keys()
            .map(String::as_str)
            .filter(|key| !RECOGNIZED_OPTION_KEYS.contains(key))
            .collect();
        if !ignored.is_empty() {
            tracing::debug!(?ignored, "ignoring unknown call option keys");
        }
        serde_json::from_value(Value::Object(object.clone()))
            .map_err(|err| ApiClientError::Validation(format!("invalid call options: {err}")))
    }

    /// Applies every option set in `other` on top of `self`.
    pub fn overlay(&mut self, other: CallOptions) {
        self.qs.extend(other.qs);
        self.headers.extend(other.headers);
        if other.filter.is_some() {
            self.filter = other.filter;
        }
        if other.order.is_some() {
            self.order = other.order;
        }
        if other.range.is_some() {
            self.range = other.range;
        }
        if other.timeout_ms.is_some() {
            self.timeout_ms = other.timeout_ms;
        }
        if other.encoding.is_some() {
            self.encoding = other.encoding;
        }
        self.not_found_is_null |= other.not_found_is_null;
        self.details |= other.details;
        self.test |= other.test;
        self.retry_on_transient_error |= other.retry_on_transient_error;
    }
}

/// Request settings applied when a call does not set them itself.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDefaults {
    pub timeout_ms: Option<u64>,
    pub encoding: Option<ResponseEncoding>,
}

impl RequestDefaults {
    /// Fills the fields missing here from `fallback`.
    pub fn or(&self, fallback: &RequestDefaults) -> RequestDefaults {
        RequestDefaults {
            timeout_ms: self.timeout_ms.or(fallback.timeout_ms),
            encoding: self.encoding.or(fallback.encoding),
        }
    }

    /// Overwrites the fields set in `other`.
    pub fn merge(&mut self, other: RequestDefaults) {
        if other.timeout_ms.is_some() {
            self.timeout_ms = other.timeout_ms;
        }
        if other.encoding.is_some() {
            self.encoding = other.encoding;
        }
    }
}

/// Factory-wide configuration.
#[derive(Clone, Default)]
pub struct FactoryOptions {
    pub retry: RetryPolicy,
    pub agent: AgentOptions,
    pub defaults: RequestDefaults,
    /// Sent as `x-secret` on every request of every client of the factory.
    pub secret: Option<String>,
}

impl fmt::Debug for FactoryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryOptions")
            .field("retry", &self.retry)
            .field("agent", &self.agent)
            .field("defaults", &self.defaults)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl FactoryOptions {
    /// Builds options from environment variables.
    ///
    /// Reads (all optional):
    /// - `INTERCALL_SECRET`
    /// - `INTERCALL_TIMEOUT_MS`
    /// - `INTERCALL_MAX_ATTEMPTS`
    /// - `INTERCALL_RETRY_DELAY_MS`
    /// - `INTERCALL_KEEP_ALIVE` (`true`/`false`)
    /// - `INTERCALL_MAX_SOCKETS_PER_HOST`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut options = Self::default();

        if let Some(secret) = non_empty(lookup("INTERCALL_SECRET")) {
            options.secret = Some(secret);
        }
        if let Some(timeout_ms) = parse_var::<u64>(&lookup, "INTERCALL_TIMEOUT_MS")? {
            options.defaults.timeout_ms = Some(timeout_ms);
        }
        if let Some(max_attempts) = parse_var::<u32>(&lookup, "INTERCALL_MAX_ATTEMPTS")? {
            if max_attempts == 0 {
                return Err(ApiClientError::Config(
                    "INTERCALL_MAX_ATTEMPTS must be at least 1".to_owned(),
                ));
            }
            options.retry = options.retry.with_max_attempts(max_attempts);
        }
        if let Some(delay_ms) = parse_var::<u64>(&lookup, "INTERCALL_RETRY_DELAY_MS")? {
            options.retry = options.retry.with_retry_delay(Duration::from_millis(delay_ms));
        }
        if let Some(keep_alive) = parse_var::<bool>(&lookup, "INTERCALL_KEEP_ALIVE")? {
            options.agent.keep_alive = keep_alive;
        }
        if let Some(limit) = parse_var::<usize>(&lookup, "INTERCALL_MAX_SOCKETS_PER_HOST")? {
            if limit == 0 || limit > Semaphore::MAX_PERMITS {
                return Err(ApiClientError::Config(format!(
                    "INTERCALL_MAX_SOCKETS_PER_HOST must be between 1 and {}",
                    Semaphore::MAX_PERMITS
                )));
            }
            options.agent.max_sockets_per_host = limit;
        }

        Ok(options)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(lookup(key)) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|err| ApiClientError::Config(format!("{key}={raw:?} is invalid: {err}"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use serde_json::json;

    use super::{CallOptions, FactoryOptions, RequestDefaults, ResponseEncoding};
    use crate::ApiClientError;

    #[test]
    fn call_options_from_camel_case_object() {
        let object = json!({
            "qs": {"page": 2, "q": "x"},
            "filter": {"id": {"gt": 500}},
            "timeout": 250,
            "encoding": "text",
            "notFoundIsNull": true,
            "retryOnTransientError": true,
            "somethingElse": 1
        });
        let options = CallOptions::from_json_object(object.as_object().unwrap()).unwrap();
        assert_eq!(options.qs["page"], json!(2));
        assert_eq!(options.filter, Some(json!({"id": {"gt": 500}})));
        assert_eq!(options.timeout_ms, Some(250));
        assert_eq!(options.encoding, Some(ResponseEncoding::Text));
        assert!(options.not_found_is_null);
        assert!(options.retry_on_transient_error);
        assert!(!options.test);
    }

    #[test]
    fn call_options_reject_mistyped_known_keys() {
        let object = json!({"timeout": "soon"});
        let err = CallOptions::from_json_object(object.as_object().unwrap()).unwrap_err();
        assert!(matches!(err, ApiClientError::Validation(_)));
    }

    #[test]
    fn overlay_keeps_unset_fields() {
        let mut base = CallOptions {
            order: Some(json!(["date", "asc"])),
            timeout_ms: Some(100),
            ..CallOptions::default()
        };
        base.headers.insert("a".to_owned(), "1".to_owned());

        let mut extra = CallOptions {
            test: true,
            ..CallOptions::default()
        };
        extra.headers.insert("b".to_owned(), "2".to_owned());
        base.overlay(extra);

        assert!(base.test);
        assert_eq!(base.order, Some(json!(["date", "asc"])));
        assert_eq!(base.timeout_ms, Some(100));
        assert_eq!(base.headers.len(), 2);
    }

    #[test]
    fn request_defaults_fall_back_field_by_field() {
        let client = RequestDefaults {
            timeout_ms: None,
            encoding: Some(ResponseEncoding::Binary),
        };
        let factory = RequestDefaults {
            timeout_ms: Some(5_000),
            encoding: Some(ResponseEncoding::Text),
        };
        let effective = client.or(&factory);
        assert_eq!(effective.timeout_ms, Some(5_000));
        assert_eq!(effective.encoding, Some(ResponseEncoding::Binary));
    }

    #[test]
    fn factory_options_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("INTERCALL_SECRET", " s3cret "),
            ("INTERCALL_TIMEOUT_MS", "1500"),
            ("INTERCALL_MAX_ATTEMPTS", "5"),
            ("INTERCALL_RETRY_DELAY_MS", "20"),
            ("INTERCALL_KEEP_ALIVE", "false"),
            ("INTERCALL_MAX_SOCKETS_PER_HOST", "4"),
        ]);
        let options =
            FactoryOptions::from_lookup(|key| vars.get(key).map(|value| (*value).to_owned()))
                .unwrap();

        assert_eq!(options.secret.as_deref(), Some("s3cret"));
        assert_eq!(options.defaults.timeout_ms, Some(1_500));
        assert_eq!(options.retry.max_attempts(), 5);
        assert_eq!(options.retry.retry_delay(), Duration::from_millis(20));
        assert!(!options.agent.keep_alive);
        assert_eq!(options.agent.max_sockets_per_host, 4);
        assert!(!format!("{options:?}").contains("s3cret"));
    }

    #[test]
    fn factory_options_reject_invalid_values() {
        let err = FactoryOptions::from_lookup(|key| {
            (key == "INTERCALL_MAX_ATTEMPTS").then(|| "many".to_owned())
        })
        .unwrap_err();
        assert!(matches!(err, ApiClientError::Config(_)));

        let err = FactoryOptions::from_lookup(|key| {
            (key == "INTERCALL_MAX_ATTEMPTS").then(|| "0".to_owned())
        })
        .unwrap_err();
        assert!(matches!(err, ApiClientError::Config(_)));

        let err = FactoryOptions::from_lookup(|key| {
            (key == "INTERCALL_MAX_SOCKETS_PER_HOST").then(|| usize::MAX.to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ApiClientError::Config(_)));
    }
}
