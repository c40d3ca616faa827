use std::{fmt, sync::Arc};

use serde::de::DeserializeOwned;

use crate::{
    assemble::{Assembled, Assembler},
    call::Call,
    completion::{CallOutcome, Completion},
    context::{AuthCredential, Identity},
    engine::Engine,
    factory::FactoryShared,
    modify::{ModificatorPipeline, RequestModificator},
    options::RequestDefaults,
    response::Reply,
    url::UrlSpec,
    util::read_unpoisoned,
    Method, Result,
};

/// Client bound to a base URL and a caller identity.
///
/// Created by [`ApiClientFactory`](crate::ApiClientFactory); every client of a
/// factory shares its connection pool and retry policy. Cloning is cheap.
#[derive(Clone)]
pub struct ApiClient {
    shared: Arc<FactoryShared>,
    api_url: String,
    identity: Identity,
    defaults: RequestDefaults,
    modificators: ModificatorPipeline,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("api_url", &self.api_url)
            .field("identity", &self.identity)
            .field("defaults", &self.defaults)
            .field("modificators", &self.modificators.len())
            .finish()
    }
}

impl ApiClient {
    pub(crate) fn new(shared: Arc<FactoryShared>, api_url: String, identity: Identity) -> Self {
        Self {
            shared,
            api_url,
            identity,
            defaults: RequestDefaults::default(),
            modificators: ModificatorPipeline::default(),
        }
    }

    /// Base URL every call path is appended to.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Identity whose headers are stamped on every request.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Sent as `x-request-id`.
    pub fn set_request_id(&mut self, request_id: impl Into<String>) {
        self.identity.request_id = Some(request_id.into());
    }

    /// Sent as `x-session-id`.
    pub fn set_session_id(&mut self, session_id: impl Into<String>) {
        self.identity.session_id = Some(session_id.into());
    }

    /// Sent as `x-device-id`.
    pub fn set_device_id(&mut self, device_id: impl Into<String>) {
        self.identity.device_id = Some(device_id.into());
    }

    /// Sets or clears the `authorization` credential.
    pub fn set_auth(&mut self, auth: Option<AuthCredential>) {
        self.identity.auth = auth;
    }

    /// Header sent with every request of this client; per-call headers still win.
    pub fn set_default_header(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.identity
            .default_headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    /// Value substituted for `?:name` in request URLs.
    pub fn set_url_placeholder(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.identity
            .url_placeholders
            .insert(name.into(), value.into());
    }

    /// Timeout and encoding used when a call sets neither.
    pub fn request_defaults(&self) -> &RequestDefaults {
        &self.defaults
    }

    /// Overwrites the defaults set in `defaults`, keeping the others.
    pub fn set_request_defaults(&mut self, defaults: RequestDefaults) {
        self.defaults.merge(defaults);
    }

    /// Client for a sub-resource: same factory, identity, defaults and
    /// modificators, base URL extended by `sub_url`.
    pub fn fork(&self, sub_url: impl Into<UrlSpec>) -> Result<ApiClient> {
        let sub_url = sub_url.into().resolve()?;
        let mut forked = self.clone();
        forked.api_url = format!("{}{sub_url}", self.api_url);
        Ok(forked)
    }

    /// Returns `false` when the modificator was already registered.
    pub fn add_request_modificator(&mut self, modificator: Arc<dyn RequestModificator>) -> bool {
        self.modificators.add(modificator)
    }

    /// Returns `false` when the modificator was not registered.
    pub fn remove_request_modificator(&mut self, modificator: &Arc<dyn RequestModificator>) -> bool {
        self.modificators.remove(modificator)
    }

    /// Sends `call` with `method`. Transport failures are retried per the
    /// retry policy; any received response settles the call.
    pub async fn request(&self, method: Method, call: impl Into<Call>) -> Result<Reply> {
        self.execute(method, call.into()).await.result
    }

    /// Like [`request`](Self::request), and also hands the outcome to `completion`.
    pub async fn request_with_callback(
        &self,
        method: Method,
        call: impl Into<Call>,
        completion: &Completion,
    ) -> Result<Reply> {
        let outcome = self.execute(method, call.into()).await;
        completion.deliver_outcome(&outcome);
        outcome.result
    }

    /// GET. A JSON object body is read as call options.
    pub async fn get(&self, call: impl Into<Call>) -> Result<Reply> {
        self.request(Method::Get, call).await
    }

    /// POST. Retried only with `retry_on_transient_error`.
    pub async fn post(&self, call: impl Into<Call>) -> Result<Reply> {
        self.request(Method::Post, call).await
    }

    /// PUT.
    pub async fn put(&self, call: impl Into<Call>) -> Result<Reply> {
        self.request(Method::Put, call).await
    }

    /// PATCH. Retried only with `retry_on_transient_error`.
    pub async fn patch(&self, call: impl Into<Call>) -> Result<Reply> {
        self.request(Method::Patch, call).await
    }

    /// DELETE.
    pub async fn delete(&self, call: impl Into<Call>) -> Result<Reply> {
        self.request(Method::Delete, call).await
    }

    /// HEAD.
    pub async fn head(&self, call: impl Into<Call>) -> Result<Reply> {
        self.request(Method::Head, call).await
    }

    /// Sends a HEAD: `true` on success, `false` on 404, any other failure is an error.
    pub async fn exists(&self, call: impl Into<Call>) -> Result<bool> {
        let mut call = call.into();
        call.options.not_found_is_null = false;
        match self.head(call).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// GET deserialized into `T`; `None` for empty bodies and suppressed 404s.
    pub async fn get_json<T: DeserializeOwned>(&self, call: impl Into<Call>) -> Result<Option<T>> {
        self.get(call).await?.into_json()
    }

    async fn execute(&self, method: Method, call: Call) -> CallOutcome {
        tracing::debug!(%method, url = ?call.url, "client request");

        let assembled = self.assemble(method, &call);
        let Assembled {
            mut request,
            options,
        } = match assembled {
            Ok(assembled) => assembled,
            Err(err) => {
                return CallOutcome {
                    result: Err(err),
                    response: None,
                    request: None,
                }
            }
        };

        if options.test {
            tracing::debug!(%method, url = %request.url, "test mode; request not sent");
            return CallOutcome {
                result: Ok(Reply::Assembled(Box::new(request.clone()))),
                response: None,
                request: Some(request),
            };
        }

        if let Err(err) = self.modificators.run(&mut request).await {
            return CallOutcome {
                result: Err(err),
                response: None,
                request: Some(request),
            };
        }

        let policy = match &call.retry_policy {
            Some(policy) => policy.clone(),
            None => read_unpoisoned(&self.shared.retry).clone(),
        };
        let pool = read_unpoisoned(&self.shared.pool).clone();
        let engine = Engine {
            pool,
            policy,
            events: &self.shared.events,
            shutdown: &self.shared.shutdown,
        };
        engine.run(request, &options).await
    }

    fn assemble(&self, method: Method, call: &Call) -> Result<Assembled> {
        let secret = read_unpoisoned(&self.shared.secret).clone();
        let defaults = self.defaults.or(&read_unpoisoned(&self.shared.defaults));
        Assembler {
            api_url: &self.api_url,
            identity: &self.identity,
            secret: secret.as_deref(),
            defaults: &defaults,
        }
        .assemble(method, call)
    }
}
