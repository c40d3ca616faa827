use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use crate::{
    options::{CallOptions, ResponseEncoding},
    request::{RequestBody, StreamBody},
    retry::RetryPolicy,
    url::UrlSpec,
    util::duration_millis,
    ApiClientError, Result,
};

/// Everything needed to issue one call: path, body and options.
///
/// Verbs take a `Call` (or anything convertible, such as a path):
///
/// ```no_run
/// # async fn demo(client: intercall_http::ApiClient) -> intercall_http::Result<()> {
/// use intercall_http::Call;
///
/// let note = client
///     .get(Call::new(["/notes/??", "a/b"]).order(serde_json::json!(["date", "asc"])))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct Call {
    pub(crate) url: UrlSpec,
    pub(crate) body: RequestBody,
    pub(crate) options: CallOptions,
    pub(crate) retry_policy: Option<RetryPolicy>,
}

impl Call {
    pub fn new(url: impl Into<UrlSpec>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn url(&self) -> &UrlSpec {
        &self.url
    }

    pub fn body_ref(&self) -> &RequestBody {
        &self.body
    }

    pub fn options_ref(&self) -> &CallOptions {
        &self.options
    }

    /// Serializes `body` as the JSON payload.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self> {
        let value = serde_json::to_value(body).map_err(|err| {
            ApiClientError::Validation(format!("body is not serializable: {err}"))
        })?;
        self.body = RequestBody::Json(value);
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    pub fn bytes(self, bytes: impl Into<Bytes>) -> Self {
        self.body(RequestBody::Bytes(bytes.into()))
    }

    /// Streams the body. Such a call is never retried.
    pub fn stream(self, stream: StreamBody) -> Self {
        self.body(RequestBody::Stream(stream))
    }

    /// Replaces all options.
    pub fn options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    /// Query parameter; non-string values are sent as JSON text.
    pub fn query(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.qs.insert(name.into(), value.into());
        self
    }

    /// Sent as the `filter` query parameter, JSON encoded.
    pub fn filter(mut self, filter: impl Into<Value>) -> Self {
        self.options.filter = Some(filter.into());
        self
    }

    /// Sent as the `order` query parameter, JSON encoded.
    pub fn order(mut self, order: impl Into<Value>) -> Self {
        self.options.order = Some(order.into());
        self
    }

    /// Sent as the `range` query parameter, JSON encoded.
    pub fn range(mut self, range: impl Into<Value>) -> Self {
        self.options.range = Some(range.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.headers.insert(name.into(), value.into());
        self
    }

    /// Per-attempt timeout, truncated to milliseconds. Zero falls back to the defaults.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout_ms = Some(duration_millis(timeout));
        self
    }

    pub fn encoding(mut self, encoding: ResponseEncoding) -> Self {
        self.options.encoding = Some(encoding);
        self
    }

    /// Resolve a 404 to an absent body instead of an error.
    pub fn not_found_is_null(mut self) -> Self {
        self.options.not_found_is_null = true;
        self
    }

    /// Resolve to a [`ResponseEnvelope`](crate::ResponseEnvelope) with status and headers.
    pub fn details(mut self) -> Self {
        self.options.details = true;
        self
    }

    /// Assemble only; nothing is sent.
    pub fn test(mut self) -> Self {
        self.options.test = true;
        self
    }

    /// Allow retries of POST and PATCH.
    pub fn retry_on_transient_error(mut self) -> Self {
        self.options.retry_on_transient_error = true;
        self
    }

    /// Uses `policy` instead of the factory policy for this call.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

impl From<&str> for Call {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

impl From<String> for Call {
    fn from(url: String) -> Self {
        Self::new(url)
    }
}

impl From<UrlSpec> for Call {
    fn from(url: UrlSpec) -> Self {
        Self::new(url)
    }
}

impl<const N: usize> From<[&str; N]> for Call {
    fn from(parts: [&str; N]) -> Self {
        Self::new(parts)
    }
}
