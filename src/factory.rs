use std::{
    fmt,
    sync::{Arc, RwLock},
};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    call::Call,
    client::ApiClient,
    context::{AuthCredential, CallContext, Identity},
    events::{ClientEvent, EventBus},
    options::{FactoryOptions, RequestDefaults},
    pool::{AgentOptions, ConnectionPool, PoolStats},
    request::host_key,
    response::Reply,
    retry::RetryPolicy,
    util::{read_unpoisoned, write_unpoisoned},
    ApiClientError, Method, Result,
};

/// State shared by a factory and every client it created.
pub(crate) struct FactoryShared {
    pub(crate) pool: RwLock<ConnectionPool>,
    pub(crate) retry: RwLock<RetryPolicy>,
    pub(crate) secret: RwLock<Option<String>>,
    pub(crate) defaults: RwLock<RequestDefaults>,
    pub(crate) events: EventBus,
    pub(crate) shutdown: CancellationToken,
}

/// Owns the connection pool and retry policy for one downstream API and
/// hands out clients bound to it.
///
/// ```no_run
/// # async fn demo() -> intercall_http::Result<()> {
/// use intercall_http::ApiClientFactory;
///
/// let factory = ApiClientFactory::new("http://notes.internal:8080/api")?;
/// let client = factory.get_client(Some(42), "web");
/// let exists = client.exists(["/notes/??", "n-1"]).await?;
/// # Ok(())
/// # }
/// ```
pub struct ApiClientFactory {
    api_url: String,
    shared: Arc<FactoryShared>,
    root: ApiClient,
}

impl fmt::Debug for ApiClientFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let has_secret = read_unpoisoned(&self.shared.secret).is_some();
        f.debug_struct("ApiClientFactory")
            .field("api_url", &self.api_url)
            .field("retry", &*read_unpoisoned(&self.shared.retry))
            .field("pool", &*read_unpoisoned(&self.shared.pool))
            .field("secret", &if has_secret { "<redacted>" } else { "<none>" })
            .field("shut_down", &self.shared.shutdown.is_cancelled())
            .finish()
    }
}

impl ApiClientFactory {
    /// Factory with default retry policy, pool options and no secret.
    pub fn new(api_url: impl Into<String>) -> Result<Self> {
        Self::with_options(api_url, FactoryOptions::default())
    }

    /// Fails with [`ApiClientError::Config`] when `api_url` is not an absolute
    /// http(s) URL or the pool options are out of range.
    pub fn with_options(api_url: impl Into<String>, options: FactoryOptions) -> Result<Self> {
        let api_url = api_url.into();
        host_key(&api_url).map_err(|err| ApiClientError::Config(err.to_string()))?;

        let shared = Arc::new(FactoryShared {
            pool: RwLock::new(ConnectionPool::new(options.agent)?),
            retry: RwLock::new(options.retry),
            secret: RwLock::new(options.secret),
            defaults: RwLock::new(options.defaults),
            events: EventBus::default(),
            shutdown: CancellationToken::new(),
        });
        let root = ApiClient::new(Arc::clone(&shared), api_url.clone(), Identity::default());
        tracing::debug!(%api_url, "client factory created");

        Ok(Self {
            api_url,
            shared,
            root,
        })
    }

    /// Reads `INTERCALL_API_URL` plus everything [`FactoryOptions::from_env`] reads.
    pub fn from_env() -> Result<Self> {
        let api_url = std::env::var("INTERCALL_API_URL")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ApiClientError::Config("missing INTERCALL_API_URL".to_owned()))?;
        Self::with_options(api_url, FactoryOptions::from_env()?)
    }

    /// Base URL shared by every client of this factory.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Policy applied to calls that carry no override.
    pub fn retry_policy(&self) -> RetryPolicy {
        read_unpoisoned(&self.shared.retry).clone()
    }

    /// Applies to every client of this factory, including existing ones.
    pub fn set_retry_policy(&self, policy: RetryPolicy) {
        *write_unpoisoned(&self.shared.retry) = policy;
    }

    /// Options of the current connection pool.
    pub fn agent_options(&self) -> AgentOptions {
        read_unpoisoned(&self.shared.pool).options().clone()
    }

    /// Replaces the connection pool. Calls already in flight finish on the old one.
    pub fn set_agent_options(&self, options: AgentOptions) -> Result<()> {
        let pool = ConnectionPool::new(options)?;
        *write_unpoisoned(&self.shared.pool) = pool;
        tracing::debug!(api_url = %self.api_url, "connection pool replaced");
        Ok(())
    }

    /// Shared secret sent as `x-secret` by every client; `None` stops sending it.
    pub fn set_secret(&self, secret: Option<String>) {
        *write_unpoisoned(&self.shared.secret) = secret;
    }

    /// Factory-wide defaults; client defaults take precedence.
    pub fn request_defaults(&self) -> RequestDefaults {
        read_unpoisoned(&self.shared.defaults).clone()
    }

    /// Overwrites the defaults set in `defaults`, keeping the others.
    pub fn set_request_defaults(&self, defaults: RequestDefaults) {
        write_unpoisoned(&self.shared.defaults).merge(defaults);
    }

    /// Client without any identity.
    pub fn client(&self) -> ApiClient {
        self.get_raw_client(Identity::default())
    }

    /// Client authenticated as `Internal <user_id>:<app>`; no user id means guest `0`.
    pub fn get_client(&self, user_id: Option<u64>, app: &str) -> ApiClient {
        self.get_raw_client(Identity::with_auth(AuthCredential::internal(user_id, app)))
    }

    /// Client with an arbitrary identity.
    pub fn get_raw_client(&self, identity: Identity) -> ApiClient {
        ApiClient::new(Arc::clone(&self.shared), self.api_url.clone(), identity)
    }

    /// Client acting on behalf of the caller described by `context`.
    pub fn get_client_by_context(&self, context: &CallContext) -> ApiClient {
        self.get_raw_client(context.identity())
    }

    /// Client behind the factory's own verbs.
    pub fn root_client(&self) -> &ApiClient {
        &self.root
    }

    /// Register modificators for the factory's own verbs here.
    pub fn root_client_mut(&mut self) -> &mut ApiClient {
        &mut self.root
    }

    /// Verbs below send through the root client.
    pub async fn request(&self, method: Method, call: impl Into<Call>) -> Result<Reply> {
        self.root.request(method, call).await
    }

    pub async fn get(&self, call: impl Into<Call>) -> Result<Reply> {
        self.root.get(call).await
    }

    pub async fn post(&self, call: impl Into<Call>) -> Result<Reply> {
        self.root.post(call).await
    }

    pub async fn put(&self, call: impl Into<Call>) -> Result<Reply> {
        self.root.put(call).await
    }

    pub async fn patch(&self, call: impl Into<Call>) -> Result<Reply> {
        self.root.patch(call).await
    }

    pub async fn delete(&self, call: impl Into<Call>) -> Result<Reply> {
        self.root.delete(call).await
    }

    pub async fn head(&self, call: impl Into<Call>) -> Result<Reply> {
        self.root.head(call).await
    }

    pub async fn exists(&self, call: impl Into<Call>) -> Result<bool> {
        self.root.exists(call).await
    }

    /// Handle to the current connection pool.
    pub fn pool(&self) -> ConnectionPool {
        read_unpoisoned(&self.shared.pool).clone()
    }

    /// Per-host counters of the current pool.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool().stats()
    }

    /// Receiver of completion and network error events from every client.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Cancels pending retry delays and rejects new calls with
    /// [`ApiClientError::Shutdown`]. Responses already being read complete.
    pub fn shutdown(&self) {
        if !self.shared.shutdown.is_cancelled() {
            tracing::info!(api_url = %self.api_url, "client factory shutting down");
        }
        self.shared.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }
}
