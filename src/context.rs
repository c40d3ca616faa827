use std::{collections::BTreeMap, fmt};

use serde::Deserialize;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const SESSION_ID_HEADER: &str = "x-session-id";
pub const DEVICE_ID_HEADER: &str = "x-device-id";
pub const SECRET_HEADER: &str = "x-secret";

/// Value of the `Authorization` header: `<kind> <credentials>`.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthCredential {
    pub kind: String,
    pub credentials: String,
}

impl fmt::Debug for AuthCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCredential")
            .field("kind", &self.kind)
            .field("credentials", &"<redacted>")
            .finish()
    }
}

impl AuthCredential {
    pub const INTERNAL: &'static str = "Internal";

    pub fn new(kind: impl Into<String>, credentials: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            credentials: credentials.into(),
        }
    }

    /// Service-to-service credential acting for a user of an app.
    ///
    /// A missing user id is the guest user `0`.
    pub fn internal(user_id: Option<u64>, app: &str) -> Self {
        Self::new(Self::INTERNAL, format!("{}:{app}", user_id.unwrap_or(0)))
    }

    pub fn header_value(&self) -> String {
        format!("{} {}", self.kind, self.credentials)
    }
}

/// Metadata a client attaches to every request it sends.
///
/// Read once when a request is assembled. Changing it while a call is in
/// flight has no effect on that call; share a client across tasks only if
/// nobody mutates it, or `fork` one per request scope.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Identity {
    pub auth: Option<AuthCredential>,
    pub request_id: Option<String>,
    pub session_id: Option<String>,
    pub device_id: Option<String>,
    pub default_headers: BTreeMap<String, String>,
    /// Values for `?:name` URL placeholders.
    pub url_placeholders: BTreeMap<String, String>,
}

impl Identity {
    pub fn with_auth(auth: AuthCredential) -> Self {
        Self {
            auth: Some(auth),
            ..Self::default()
        }
    }
}

/// Caller context passed explicitly to build a client for a request scope.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallContext {
    pub user_id: Option<u64>,
    pub remote_app_code: Option<String>,
    pub request_id: Option<String>,
    pub session_id: Option<String>,
    pub device_id: Option<String>,
}

impl CallContext {
    pub fn identity(&self) -> Identity {
        Identity {
            auth: self
                .remote_app_code
                .as_deref()
                .map(|app| AuthCredential::internal(self.user_id, app)),
            request_id: self.request_id.clone(),
            session_id: self.session_id.clone(),
            device_id: self.device_id.clone(),
            ..Identity::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{AuthCredential, CallContext};

    #[test]
    fn internal_credential_defaults_to_guest() {
        assert_eq!(
            AuthCredential::internal(None, "web").header_value(),
            "Internal 0:web"
        );
        assert_eq!(
            AuthCredential::internal(Some(123), "app").header_value(),
            "Internal 123:app"
        );
    }

    #[test]
    fn debug_redacts_credentials() {
        let debug = format!("{:?}", AuthCredential::new("Session", "sss:app"));
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("sss:app"));
    }

    #[test]
    fn context_builds_identity() {
        let context: CallContext = serde_json::from_value(json!({
            "userId": 1,
            "remoteAppCode": "app",
            "requestId": "request-id",
            "sessionId": "session-id"
        }))
        .unwrap();
        let identity = context.identity();
        assert_eq!(identity.auth, Some(AuthCredential::new("Internal", "1:app")));
        assert_eq!(identity.request_id.as_deref(), Some("request-id"));
        assert_eq!(identity.session_id.as_deref(), Some("session-id"));
        assert_eq!(identity.device_id, None);
    }
}
