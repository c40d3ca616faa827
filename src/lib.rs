//! `intercall-http` is an async HTTP client for service-to-service calls.
//!
//! An [`ApiClientFactory`] owns the connection pool and retry policy for one
//! downstream API and hands out [`ApiClient`]s bound to a caller identity:
//! - [`ApiClient::get`], [`ApiClient::post`], [`ApiClient::put`],
//!   [`ApiClient::patch`], [`ApiClient::delete`], [`ApiClient::head`]
//! - [`ApiClient::exists`]
//! - [`ApiClient::request_with_callback`] for callback-style callers
//!
//! Transport failures are retried according to the factory's [`RetryPolicy`];
//! responses are never retried. Failures surface as [`ApiClientError`].

mod assemble;
mod call;
mod classify;
mod client;
mod completion;
mod context;
mod engine;
mod error;
mod events;
mod factory;
mod modify;
mod options;
mod pool;
mod request;
mod response;
mod retry;
mod url;
mod util;

pub use call::Call;
pub use client::ApiClient;
pub use completion::{Completion, CompletionCallback};
pub use context::{
    AuthCredential, CallContext, Identity, DEVICE_ID_HEADER, REQUEST_ID_HEADER, SECRET_HEADER,
    SESSION_ID_HEADER,
};
pub use error::{
    ApiClientError, AttemptRecord, NetworkError, NetworkErrorCode, RemoteError, RetryInfo,
};
pub use events::{ClientEvent, EVENT_CHANNEL_CAPACITY};
pub use factory::ApiClientFactory;
pub use modify::{modificator_fn, ModificatorError, RequestModificator};
pub use options::{CallOptions, FactoryOptions, RequestDefaults, ResponseEncoding};
pub use pool::{AgentOptions, ConnectionPool, HostStats, PoolStats};
pub use request::{Method, RequestBody, StreamBody, WireRequest};
pub use response::{RawResponse, Reply, ResponseBody, ResponseEnvelope};
pub use retry::{
    AnyNetworkErrorStrategy, AttemptContext, AttemptFailure, FnStrategy, NeverRetry,
    RetryDecision, RetryPolicy, RetryStrategy, TransientErrorStrategy, MAX_RECORDED_ATTEMPTS,
};
pub use url::{substitute_named, UrlSpec, NAMED_PLACEHOLDER_PREFIX, POSITIONAL_PLACEHOLDER};

pub type Result<T> = std::result::Result<T, ApiClientError>;
