//! JSON-RPC 2.0 envelope classification and encoding.
//!
//! The codec only understands the envelope (`jsonrpc`, `id`, `method`,
//! `params`, `result`, `error`); payloads stay opaque [`Value`] trees. The
//! `id` handling follows the lenient baseline: a frame carrying `method`
//! together with a malformed `id` (null, float, empty string, container) is
//! demoted to a notification instead of being rejected, because `id: null`
//! is used inconsistently across ACP peers. [`IdPolicy::Strict`] restores
//! rejection for peers known to be well-behaved.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Identifier correlating a request with its response.
///
/// Either a signed integer or a non-empty string; the issuing side owns a
/// private counter, so ids are scoped per direction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    Text(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::Text(s) => write!(f, "{s}"),
        }
    }
}

/// JSON-RPC error object carried by error responses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// `error.code` for a method outside the routed set.
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
/// `error.code` for handler failures and a missing handler.
pub const CODE_INTERNAL_ERROR: i64 = -32603;

impl RpcErrorObject {
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: CODE_METHOD_NOT_FOUND,
            message: format!("method not found: {method}"),
            data: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: CODE_INTERNAL_ERROR,
            message: message.into(),
            data: None,
        }
    }

    /// Error sent for routed methods that arrive before a handler exists.
    pub fn delegate_not_set() -> Self {
        Self::internal("delegate not set: no handler installed for inbound requests")
    }
}

/// Inbound notification as surfaced on the notification stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// A classified JSON-RPC frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Response {
        id: RequestId,
        outcome: Result<Value, RpcErrorObject>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

/// Classification policy for frames with `method` plus a malformed `id`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IdPolicy {
    /// Demote to a notification, discarding the id.
    #[default]
    Lenient,
    /// Reject the frame.
    Strict,
}

/// Why a frame failed envelope classification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvelopeError {
    NotAnObject,
    MalformedId,
    MissingMethodAndId,
    /// A response must carry exactly one of `result`/`error`.
    ResponseBody,
    MalformedError,
    BadVersion,
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeError::NotAnObject => write!(f, "frame is not a JSON object"),
            EnvelopeError::MalformedId => write!(f, "id is not an integer or non-empty string"),
            EnvelopeError::MissingMethodAndId => write!(f, "frame has neither method nor id"),
            EnvelopeError::ResponseBody => {
                write!(f, "response must carry exactly one of result/error")
            }
            EnvelopeError::MalformedError => write!(f, "error member is not a valid error object"),
            EnvelopeError::BadVersion => write!(f, "jsonrpc member is not \"2.0\""),
        }
    }
}

fn parse_id(value: &Value) -> Option<RequestId> {
    match value {
        Value::Number(n) => n.as_i64().map(RequestId::Number),
        Value::String(s) if !s.is_empty() => Some(RequestId::Text(s.clone())),
        _ => None,
    }
}

/// Classifies one decoded frame per the envelope rules.
///
/// Arrays parse at the framer level but are rejected here.
pub fn classify(value: Value, policy: IdPolicy) -> Result<Envelope, EnvelopeError> {
    let Value::Object(mut object) = value else {
        return Err(EnvelopeError::NotAnObject);
    };

    if policy == IdPolicy::Strict {
        match object.get("jsonrpc") {
            None => {}
            Some(Value::String(v)) if v == "2.0" => {}
            Some(_) => return Err(EnvelopeError::BadVersion),
        }
    }

    let id = object.remove("id");
    let method = match object.remove("method") {
        Some(Value::String(m)) => Some(m),
        Some(_) => None,
        None => None,
    };
    let params = object.remove("params");

    if let Some(method) = method {
        return match id {
            None => Ok(Envelope::Notification { method, params }),
            Some(raw) => match parse_id(&raw) {
                Some(id) => Ok(Envelope::Request { id, method, params }),
                None => match policy {
                    IdPolicy::Lenient => Ok(Envelope::Notification { method, params }),
                    IdPolicy::Strict => Err(EnvelopeError::MalformedId),
                },
            },
        };
    }

    let Some(raw_id) = id else {
        return Err(EnvelopeError::MissingMethodAndId);
    };
    let id = parse_id(&raw_id).ok_or(EnvelopeError::MalformedId)?;

    let result = object.remove("result");
    let error = object.remove("error");
    match (result, error) {
        (Some(result), None) => Ok(Envelope::Response {
            id,
            outcome: Ok(result),
        }),
        (None, Some(error)) => {
            let error: RpcErrorObject =
                serde_json::from_value(error).map_err(|_| EnvelopeError::MalformedError)?;
            Ok(Envelope::Response {
                id,
                outcome: Err(error),
            })
        }
        _ => Err(EnvelopeError::ResponseBody),
    }
}

impl Envelope {
    /// Encodes the envelope as a JSON object ready for framing.
    pub fn to_value(&self) -> Value {
        match self {
            Envelope::Request { id, method, params } => {
                let mut object = Map::new();
                object.insert("jsonrpc".into(), json!("2.0"));
                object.insert("id".into(), id_value(id));
                object.insert("method".into(), json!(method));
                if let Some(params) = params {
                    object.insert("params".into(), params.clone());
                }
                Value::Object(object)
            }
            Envelope::Response { id, outcome } => {
                let mut object = Map::new();
                object.insert("jsonrpc".into(), json!("2.0"));
                object.insert("id".into(), id_value(id));
                match outcome {
                    Ok(result) => {
                        object.insert("result".into(), result.clone());
                    }
                    Err(error) => {
                        object.insert(
                            "error".into(),
                            serde_json::to_value(error).unwrap_or(Value::Null),
                        );
                    }
                }
                Value::Object(object)
            }
            Envelope::Notification { method, params } => {
                let mut object = Map::new();
                object.insert("jsonrpc".into(), json!("2.0"));
                object.insert("method".into(), json!(method));
                if let Some(params) = params {
                    object.insert("params".into(), params.clone());
                }
                Value::Object(object)
            }
        }
    }

    /// Serializes the envelope to the bytes of one unframed JSON value.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.to_value()).unwrap_or_default()
    }
}

fn id_value(id: &RequestId) -> Value {
    match id {
        RequestId::Number(n) => json!(n),
        RequestId::Text(s) => json!(s),
    }
}
