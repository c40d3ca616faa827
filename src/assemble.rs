use std::time::Duration;

use serde_json::Value;

use crate::{
    call::Call,
    context::{Identity, DEVICE_ID_HEADER, REQUEST_ID_HEADER, SECRET_HEADER, SESSION_ID_HEADER},
    options::{CallOptions, RequestDefaults},
    request::{host_key, RequestBody},
    url::substitute_named,
    ApiClientError, Method, Result, WireRequest,
};

/// Client state read once per call.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Assembler<'a> {
    pub(crate) api_url: &'a str,
    pub(crate) identity: &'a Identity,
    pub(crate) secret: Option<&'a str>,
    /// Client defaults already layered over the factory defaults.
    pub(crate) defaults: &'a RequestDefaults,
}

/// A request ready for the modificators, plus the options steering the call.
#[derive(Debug)]
pub(crate) struct Assembled {
    pub(crate) request: WireRequest,
    pub(crate) options: CallOptions,
}

impl Assembler<'_> {
    pub(crate) fn assemble(&self, method: Method, call: &Call) -> Result<Assembled> {
        let mut options = call.options.clone();
        let mut body = call.body.clone();

        if method == Method::Get {
            match std::mem::take(&mut body) {
                RequestBody::Json(Value::Object(fields)) => {
                    options.overlay(CallOptions::from_json_object(&fields)?);
                }
                RequestBody::Bytes(_) | RequestBody::Stream(_) => {
                    return Err(ApiClientError::Validation(
                        "GET requests cannot carry a byte or stream body".to_owned(),
                    ));
                }
                RequestBody::Json(_) | RequestBody::Empty => {}
            }
        }

        let url = substitute_named(
            &format!("{}{}", self.api_url, call.url.resolve()?),
            &self.identity.url_placeholders,
        );
        host_key(&url)?;

        let mut request = WireRequest::new(method, url);
        request.body = body;

        for (name, value) in &options.qs {
            request.set_query(name.clone(), query_value(value));
        }
        for (name, value) in [
            ("filter", &options.filter),
            ("order", &options.order),
            ("range", &options.range),
        ] {
            if let Some(value) = value {
                request.set_query(name, value.to_string());
            }
        }

        if let Some(auth) = &self.identity.auth {
            request.set_header("authorization", auth.header_value());
        }
        for (name, value) in [
            (REQUEST_ID_HEADER, &self.identity.request_id),
            (SESSION_ID_HEADER, &self.identity.session_id),
            (DEVICE_ID_HEADER, &self.identity.device_id),
        ] {
            if let Some(value) = value {
                request.set_header(name, value.clone());
            }
        }
        if let Some(secret) = self.secret {
            request.set_header(SECRET_HEADER, secret);
        }
        for (name, value) in &self.identity.default_headers {
            request.set_header(name, value.clone());
        }
        for (name, value) in &options.headers {
            request.set_header(name, value.clone());
        }

        // A zero timeout means "not set".
        request.timeout = options
            .timeout_ms
            .filter(|ms| *ms > 0)
            .or(self.defaults.timeout_ms.filter(|ms| *ms > 0))
            .map(Duration::from_millis);
        request.encoding = options
            .encoding
            .or(self.defaults.encoding)
            .unwrap_or_default();

        Ok(Assembled { request, options })
    }
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, time::Duration};

    use bytes::Bytes;
    use serde_json::json;

    use super::{Assembled, Assembler};
    use crate::{
        call::Call,
        context::{AuthCredential, Identity},
        options::{RequestDefaults, ResponseEncoding},
        request::RequestBody,
        ApiClientError, Method,
    };

    fn identity() -> Identity {
        Identity {
            auth: Some(AuthCredential::internal(Some(7), "app")),
            request_id: Some("rid".to_owned()),
            session_id: Some("sid".to_owned()),
            device_id: Some("did".to_owned()),
            default_headers: BTreeMap::from([("x-request-id".to_owned(), "override".to_owned())]),
            url_placeholders: BTreeMap::from([("ws".to_owned(), "w1".to_owned())]),
        }
    }

    fn assemble(method: Method, call: &Call) -> crate::Result<Assembled> {
        let identity = identity();
        let defaults = RequestDefaults {
            timeout_ms: Some(2_000),
            encoding: None,
        };
        Assembler {
            api_url: "http://svc.local/api",
            identity: &identity,
            secret: Some("s3cret"),
            defaults: &defaults,
        }
        .assemble(method, call)
    }

    #[test]
    fn url_template_and_named_placeholders() {
        let call = Call::new(["/ws/?:ws/notes/??", "a b"]);
        let assembled = assemble(Method::Get, &call).unwrap();
        assert_eq!(
            assembled.request.url,
            "http://svc.local/api/ws/w1/notes/a%20b"
        );
    }

    #[test]
    fn filter_order_range_are_json_query_params() {
        let filter = json!([{"key": 1}, {"field": "id", "type": "gt", "value": 500}]);
        let call = Call::new("/notes")
            .query("page", 2)
            .query("q", "text")
            .filter(filter.clone())
            .order(json!(["date", "desc"]))
            .range(json!([0, 10]));
        let request = assemble(Method::Get, &call).unwrap().request;

        assert_eq!(request.query["filter"], serde_json::to_string(&filter).unwrap());
        assert_eq!(request.query["order"], r#"["date","desc"]"#);
        assert_eq!(request.query["range"], "[0,10]");
        assert_eq!(request.query["page"], "2");
        assert_eq!(request.query["q"], "text");
        assert!(!request.query.contains_key("filterFields"));
    }

    #[test]
    fn caller_options_are_never_mutated() {
        let call = Call::new("/notes").query("a", 1).filter(json!({"x": 1}));
        let snapshot = call.options_ref().clone();
        let first = assemble(Method::Get, &call).unwrap().request;
        let second = assemble(Method::Get, &call).unwrap().request;
        assert_eq!(call.options_ref(), &snapshot);
        assert_eq!(first, second);
    }

    #[test]
    fn header_precedence() {
        let call = Call::new("/notes").header("X-Secret", "per-call");
        let request = assemble(Method::Post, &call).unwrap().request;

        assert_eq!(request.header("authorization"), Some("Internal 7:app"));
        assert_eq!(request.header("x-session-id"), Some("sid"));
        assert_eq!(request.header("x-device-id"), Some("did"));
        // client defaults beat identity headers, per-call headers beat everything
        assert_eq!(request.header("x-request-id"), Some("override"));
        assert_eq!(request.header("x-secret"), Some("per-call"));
    }

    #[test]
    fn get_body_is_merged_into_options() {
        let call = Call::new("/notes").body(json!({
            "qs": {"a": "1"},
            "notFoundIsNull": true,
            "timeout": 50,
            "unknown": true
        }));
        let assembled = assemble(Method::Get, &call).unwrap();
        assert_eq!(assembled.request.body, RequestBody::Empty);
        assert_eq!(assembled.request.query["a"], "1");
        assert_eq!(assembled.request.timeout, Some(Duration::from_millis(50)));
        assert!(assembled.options.not_found_is_null);
    }

    #[test]
    fn get_with_bytes_body_is_rejected() {
        let call = Call::new("/upload").bytes(Bytes::from_static(b"raw"));
        assert!(matches!(
            assemble(Method::Get, &call),
            Err(ApiClientError::Validation(_))
        ));
        let request = assemble(Method::Put, &call).unwrap().request;
        assert_eq!(request.body, RequestBody::Bytes(Bytes::from_static(b"raw")));
    }

    #[test]
    fn defaults_fill_timeout_and_encoding() {
        let request = assemble(Method::Get, &Call::new("/a")).unwrap().request;
        assert_eq!(request.timeout, Some(Duration::from_millis(2_000)));
        assert_eq!(request.encoding, ResponseEncoding::Json);

        let call = Call::new("/a")
            .timeout(Duration::from_millis(10))
            .encoding(ResponseEncoding::Text);
        let request = assemble(Method::Get, &call).unwrap().request;
        assert_eq!(request.timeout, Some(Duration::from_millis(10)));
        assert_eq!(request.encoding, ResponseEncoding::Text);
    }

    #[test]
    fn zero_timeout_falls_back_to_defaults() {
        let call = Call::new("/a").timeout(Duration::from_micros(300));
        let request = assemble(Method::Get, &call).unwrap().request;
        assert_eq!(request.timeout, Some(Duration::from_millis(2_000)));

        let identity = Identity::default();
        let defaults = RequestDefaults {
            timeout_ms: Some(0),
            encoding: None,
        };
        let assembler = Assembler {
            api_url: "http://svc.local",
            identity: &identity,
            secret: None,
            defaults: &defaults,
        };
        let request = assembler
            .assemble(Method::Get, &Call::new("/a"))
            .unwrap()
            .request;
        assert_eq!(request.timeout, None);
    }

    #[test]
    fn absolute_paths_stay_under_the_base_url() {
        let request = assemble(Method::Get, &Call::new("http://other.local/x"))
            .unwrap()
            .request;
        assert!(request.url.ends_with("http://other.local/x"));
        assert!(!request.url.starts_with("http://other.local"));
    }

    #[test]
    fn invalid_url_is_a_validation_error() {
        let identity = Identity::default();
        let defaults = RequestDefaults::default();
        let assembler = Assembler {
            api_url: "not a url",
            identity: &identity,
            secret: None,
            defaults: &defaults,
        };
        assert!(matches!(
            assembler.assemble(Method::Get, &Call::new("/x")),
            Err(ApiClientError::Validation(_))
        ));
        assert!(matches!(
            assembler.assemble(Method::Get, &Call::new(["/x/??"])),
            Err(ApiClientError::Validation(_))
        ));
    }
}
