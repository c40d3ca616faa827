use std::collections::BTreeMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{error::RetryInfo, options::ResponseEncoding, ApiClientError, Result, WireRequest};

/// Decoded response body.
#[derive(Clone, Debug, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    Text(String),
    Bytes(Bytes),
}

impl ResponseBody {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Json(Value::String(text)) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn into_json<T: DeserializeOwned>(self) -> Result<T> {
        let value = match self {
            Self::Json(value) => value,
            Self::Text(text) => Value::String(text),
            Self::Bytes(bytes) => serde_json::from_slice(&bytes)
                .map_err(|err| ApiClientError::Decode(format!("invalid JSON body: {err}")))?,
        };
        serde_json::from_value(value)
            .map_err(|err| ApiClientError::Decode(format!("unexpected body shape: {err}")))
    }
}

/// Status line and headers of a received response.
#[derive(Clone, Debug, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    /// Lower-cased header names.
    pub headers: BTreeMap<String, String>,
    pub retry_info: RetryInfo,
}

/// Full response, returned when a call asks for details.
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseEnvelope {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Option<ResponseBody>,
    pub retry_info: RetryInfo,
}

/// Successful outcome of a call.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    /// Response body; `None` for empty bodies and suppressed 404s.
    Body(Option<ResponseBody>),
    Details(ResponseEnvelope),
    /// Test mode: the request that would have been sent.
    Assembled(Box<WireRequest>),
}

impl Reply {
    pub fn body(&self) -> Option<&ResponseBody> {
        match self {
            Self::Body(body) => body.as_ref(),
            Self::Details(envelope) => envelope.body.as_ref(),
            Self::Assembled(_) => None,
        }
    }

    pub fn into_body(self) -> Option<ResponseBody> {
        match self {
            Self::Body(body) => body,
            Self::Details(envelope) => envelope.body,
            Self::Assembled(_) => None,
        }
    }

    /// No body: empty response or suppressed 404.
    pub fn is_absent(&self) -> bool {
        self.body().is_none()
    }

    pub fn json(&self) -> Option<&Value> {
        self.body().and_then(ResponseBody::as_json)
    }

    /// Deserializes the body; `None` when it is absent.
    pub fn into_json<T: DeserializeOwned>(self) -> Result<Option<T>> {
        self.into_body().map(ResponseBody::into_json).transpose()
    }

    pub fn details(&self) -> Option<&ResponseEnvelope> {
        match self {
            Self::Details(envelope) => Some(envelope),
            _ => None,
        }
    }

    /// Request built in test mode.
    pub fn assembled(&self) -> Option<&WireRequest> {
        match self {
            Self::Assembled(request) => Some(request),
            _ => None,
        }
    }

    pub fn into_assembled(self) -> Option<WireRequest> {
        match self {
            Self::Assembled(request) => Some(*request),
            _ => None,
        }
    }
}

pub(crate) fn decode_body(bytes: Bytes, encoding: ResponseEncoding) -> Option<ResponseBody> {
    if bytes.is_empty() {
        return None;
    }
    let body = match encoding {
        ResponseEncoding::Binary => ResponseBody::Bytes(bytes),
        ResponseEncoding::Text => ResponseBody::Text(String::from_utf8_lossy(&bytes).into_owned()),
        ResponseEncoding::Json => match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => ResponseBody::Json(value),
            Err(_) => ResponseBody::Text(String::from_utf8_lossy(&bytes).into_owned()),
        },
    };
    Some(body)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde::Deserialize;
    use serde_json::json;

    use super::{decode_body, Reply, ResponseBody};
    use crate::options::ResponseEncoding;

    #[test]
    fn json_encoding_falls_back_to_text() {
        assert_eq!(
            decode_body(Bytes::from_static(br#"{"a":1}"#), ResponseEncoding::Json),
            Some(ResponseBody::Json(json!({"a": 1})))
        );
        assert_eq!(
            decode_body(Bytes::from_static(b"done"), ResponseEncoding::Json),
            Some(ResponseBody::Text("done".to_owned()))
        );
    }

    #[test]
    fn empty_body_is_absent() {
        assert_eq!(decode_body(Bytes::new(), ResponseEncoding::Json), None);
        assert!(Reply::Body(None).is_absent());
    }

    #[test]
    fn binary_encoding_keeps_bytes() {
        let body = decode_body(Bytes::from_static(b"[1]"), ResponseEncoding::Binary).unwrap();
        assert_eq!(body.as_bytes(), Some(&b"[1]"[..]));
    }

    #[test]
    fn reply_into_typed_json() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Note {
            title: String,
        }

        let reply = Reply::Body(Some(ResponseBody::Json(json!({"title": "test note"}))));
        assert_eq!(
            reply.into_json::<Note>().unwrap(),
            Some(Note {
                title: "test note".to_owned()
            })
        );
        assert_eq!(Reply::Body(None).into_json::<Note>().unwrap(), None);
    }
}
