use std::{error::Error as StdError, io};

use serde_json::{Map, Value};

use crate::{
    error::{NetworkErrorCode, RemoteError},
    response::{RawResponse, ResponseBody},
    ApiClientError, WireRequest,
};

/// Maps a transport failure to the code reported to callers.
pub(crate) fn network_code(err: &reqwest::Error) -> NetworkErrorCode {
    if err.is_timeout() {
        return NetworkErrorCode::TimedOut;
    }

    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(code) = cause.downcast_ref::<io::Error>().and_then(io_code) {
            return code;
        }
        let text = cause.to_string().to_ascii_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return NetworkErrorCode::DnsFailure;
        }
        if text.contains("connection closed before message completed") {
            return NetworkErrorCode::ConnectionReset;
        }
        source = cause.source();
    }

    if err.is_connect() {
        NetworkErrorCode::ConnectionRefused
    } else if err.is_request() || err.is_body() {
        NetworkErrorCode::ConnectionReset
    } else {
        NetworkErrorCode::Other
    }
}

fn io_code(err: &io::Error) -> Option<NetworkErrorCode> {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => Some(NetworkErrorCode::ConnectionRefused),
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof => Some(NetworkErrorCode::ConnectionReset),
        io::ErrorKind::BrokenPipe => Some(NetworkErrorCode::BrokenPipe),
        io::ErrorKind::TimedOut => Some(NetworkErrorCode::TimedOut),
        io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
            Some(NetworkErrorCode::HostUnreachable)
        }
        _ => None,
    }
}

/// Builds the error for a non-2xx response.
///
/// A 5xx status whose payload carries no `name` is a server error; everything
/// else is a remote error named after the payload, or `RemoteError`.
pub(crate) fn response_error(
    raw: &RawResponse,
    body: Option<&ResponseBody>,
    request: &WireRequest,
) -> ApiClientError {
    let mut payload = match body {
        Some(ResponseBody::Json(Value::Object(object))) => object.clone(),
        _ => Map::new(),
    };
    payload.remove("httpStatus");

    let name = payload
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let message = payload
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| body.and_then(ResponseBody::as_text).map(str::to_owned))
        .unwrap_or_else(|| default_message(raw.status));
    payload.remove("name");
    payload.remove("message");

    let is_server = (500..600).contains(&raw.status) && name.is_none();
    let error = RemoteError {
        name: name.unwrap_or_else(|| {
            if is_server {
                RemoteError::SERVER_ERROR.to_owned()
            } else {
                RemoteError::REMOTE_ERROR.to_owned()
            }
        }),
        http_status: raw.status,
        message,
        payload,
        method: request.method,
        url: request.url.clone(),
        retry_info: raw.retry_info.clone(),
    };

    if is_server {
        ApiClientError::Server(Box::new(error))
    } else {
        ApiClientError::Remote(Box::new(error))
    }
}

fn default_message(status: u16) -> String {
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|status| status.canonical_reason())
        .map(str::to_owned)
        .unwrap_or_else(|| format!("http status {status}"))
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, io};

    use serde_json::json;

    use super::{io_code, response_error};
    use crate::{
        error::{NetworkErrorCode, RetryInfo},
        response::{RawResponse, ResponseBody},
        ApiClientError, Method, WireRequest,
    };

    fn raw(status: u16) -> RawResponse {
        RawResponse {
            status,
            headers: BTreeMap::new(),
            retry_info: RetryInfo {
                tries: 1,
                ..RetryInfo::default()
            },
        }
    }

    fn request() -> WireRequest {
        WireRequest::new(Method::Get, "http://svc.local/notes")
    }

    #[test]
    fn unnamed_5xx_is_server_error() {
        let body = ResponseBody::Text("Gateway Timeout!".to_owned());
        let err = response_error(&raw(503), Some(&body), &request());
        match err {
            ApiClientError::Server(err) => {
                assert_eq!(err.name, "ServerError");
                assert_eq!(err.http_status, 503);
                assert_eq!(err.message, "Gateway Timeout!");
                assert_eq!(err.url, "http://svc.local/notes");
            }
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[test]
    fn named_5xx_keeps_its_name() {
        let body = ResponseBody::Json(json!({"name": "DbLocked", "message": "try later"}));
        let err = response_error(&raw(500), Some(&body), &request());
        assert!(matches!(err, ApiClientError::Remote(_)));
        assert_eq!(err.name(), "DbLocked");
        assert_eq!(err.http_status(), Some(500));
    }

    #[test]
    fn payload_fields_are_merged() {
        let body = ResponseBody::Json(json!({
            "name": "ValidationError",
            "message": "bad email",
            "field": "email",
            "httpStatus": 200
        }));
        let err = response_error(&raw(422), Some(&body), &request());
        let remote = err.as_remote().unwrap();
        assert_eq!(remote.field("field"), Some(&json!("email")));
        assert_eq!(remote.http_status, 422);
        assert!(remote.field("httpStatus").is_none());
    }

    #[test]
    fn bodiless_4xx_uses_reason_phrase() {
        let err = response_error(&raw(404), None, &request());
        assert_eq!(err.name(), "RemoteError");
        assert!(err.is_not_found());
        assert_eq!(err.as_remote().unwrap().message, "Not Found");
    }

    #[test]
    fn io_kinds_map_to_codes() {
        let code = |kind: io::ErrorKind| io_code(&io::Error::from(kind));
        assert_eq!(
            code(io::ErrorKind::ConnectionRefused),
            Some(NetworkErrorCode::ConnectionRefused)
        );
        assert_eq!(
            code(io::ErrorKind::ConnectionReset),
            Some(NetworkErrorCode::ConnectionReset)
        );
        assert_eq!(
            code(io::ErrorKind::BrokenPipe),
            Some(NetworkErrorCode::BrokenPipe)
        );
        assert_eq!(code(io::ErrorKind::Other), None);
    }
}
