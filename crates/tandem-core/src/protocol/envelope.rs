//! Wire envelopes and their classification.
//!
//! Every frame carries one JSON object. Decoding never fails: anything that
//! cannot be classified comes back as [`Envelope::Malformed`] so untrusted
//! input cannot take an endpoint down.
//!
//! ```text
//! Connect   {version, id, method: "connect", params: {id: <token>}}
//!           {version, id, method: "connect", params: {result: <bool>, message?}}
//! Request   {version, id, method, params}
//! Response  {version, id, result}
//! Error     {version, id, error}
//! ```

use crate::config::ProtocolConfig;
use crate::{Result, RpcError};
use serde::Serialize;
use serde_json::{Map, Value};

/// The two directions of the identity handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum Handshake {
    /// Client → server: declares the connecting identity.
    Hello { token: Option<String> },
    /// Server → client: the authorization outcome.
    Reply {
        accepted: bool,
        message: Option<String>,
    },
}

/// One classified wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Connect {
        id: String,
        handshake: Handshake,
    },
    Request {
        id: String,
        method: String,
        params: Value,
    },
    Response {
        id: String,
        result: Value,
    },
    Error {
        id: String,
        error: String,
    },
    Malformed {
        id: Option<String>,
        reason: String,
    },
}

#[derive(Serialize)]
struct WireCall<'a> {
    version: &'a str,
    id: &'a str,
    method: &'a str,
    params: &'a Value,
}

#[derive(Serialize)]
struct WireResult<'a> {
    version: &'a str,
    id: &'a str,
    result: &'a Value,
}

#[derive(Serialize)]
struct WireError<'a> {
    version: &'a str,
    id: &'a str,
    error: &'a str,
}

impl Envelope {
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Envelope::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    pub fn response(id: impl Into<String>, result: Value) -> Self {
        Envelope::Response {
            id: id.into(),
            result,
        }
    }

    pub fn error(id: impl Into<String>, error: impl Into<String>) -> Self {
        Envelope::Error {
            id: id.into(),
            error: error.into(),
        }
    }

    pub fn connect_hello(id: impl Into<String>, token: impl Into<String>) -> Self {
        Envelope::Connect {
            id: id.into(),
            handshake: Handshake::Hello {
                token: Some(token.into()),
            },
        }
    }

    pub fn connect_reply(id: impl Into<String>, accepted: bool, message: Option<String>) -> Self {
        Envelope::Connect {
            id: id.into(),
            handshake: Handshake::Reply { accepted, message },
        }
    }

    /// Call id carried by the envelope, if one could be recovered.
    pub fn id(&self) -> Option<&str> {
        match self {
            Envelope::Connect { id, .. }
            | Envelope::Request { id, .. }
            | Envelope::Response { id, .. }
            | Envelope::Error { id, .. } => Some(id),
            Envelope::Malformed { id, .. } => id.as_deref(),
        }
    }

    /// Short name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Connect { .. } => "connect",
            Envelope::Request { .. } => "request",
            Envelope::Response { .. } => "response",
            Envelope::Error { .. } => "error",
            Envelope::Malformed { .. } => "malformed",
        }
    }

    /// Classify raw frame bytes.
    pub fn decode(raw: &[u8]) -> Envelope {
        let value: Value = match serde_json::from_slice(raw) {
            Ok(v) => v,
            Err(e) => return malformed(None, format!("Parse error: {}", e)),
        };

        let Value::Object(mut obj) = value else {
            return malformed(None, "envelope is not a JSON object");
        };

        let id = match obj.remove("id") {
            Some(Value::String(id)) => id,
            Some(_) => return malformed(None, "id must be a string"),
            None => return malformed(None, "missing id"),
        };

        match obj.get("version").and_then(Value::as_str) {
            Some(v) if v == ProtocolConfig::VERSION => {}
            Some(v) => return malformed(Some(id), format!("unsupported version {}", v)),
            None => return malformed(Some(id), "missing version"),
        }

        if let Some(method) = obj.remove("method") {
            let Value::String(method) = method else {
                return malformed(Some(id), "method must be a string");
            };
            let params = obj.remove("params").unwrap_or(Value::Null);

            if method == ProtocolConfig::CONNECT_METHOD {
                return Envelope::Connect {
                    id,
                    handshake: classify_handshake(params),
                };
            }
            return Envelope::Request { id, method, params };
        }

        if let Some(result) = obj.remove("result") {
            return Envelope::Response { id, result };
        }

        if let Some(error) = obj.remove("error") {
            let error = match error {
                Value::String(s) => s,
                other => other.to_string(),
            };
            return Envelope::Error { id, error };
        }

        malformed(Some(id), "envelope has neither method, result nor error")
    }

    /// Serialize to frame bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let version = ProtocolConfig::VERSION;
        let bytes = match self {
            Envelope::Connect { id, handshake } => {
                let params = handshake_params(handshake);
                serde_json::to_vec(&WireCall {
                    version,
                    id,
                    method: ProtocolConfig::CONNECT_METHOD,
                    params: &params,
                })?
            }
            Envelope::Request { id, method, params } => serde_json::to_vec(&WireCall {
                version,
                id,
                method,
                params,
            })?,
            Envelope::Response { id, result } => {
                serde_json::to_vec(&WireResult { version, id, result })?
            }
            Envelope::Error { id, error } => serde_json::to_vec(&WireError { version, id, error })?,
            Envelope::Malformed { .. } => {
                return Err(RpcError::invalid("cannot encode a malformed envelope"));
            }
        };
        Ok(bytes)
    }
}

fn malformed(id: Option<String>, reason: impl Into<String>) -> Envelope {
    Envelope::Malformed {
        id,
        reason: reason.into(),
    }
}

fn classify_handshake(params: Value) -> Handshake {
    if let Some(accepted) = params.get("result").and_then(Value::as_bool) {
        return Handshake::Reply {
            accepted,
            message: params
                .get("message")
                .and_then(Value::as_str)
                .map(String::from),
        };
    }
    Handshake::Hello {
        token: params.get("id").and_then(Value::as_str).map(String::from),
    }
}

fn handshake_params(handshake: &Handshake) -> Value {
    let mut params = Map::new();
    match handshake {
        Handshake::Hello { token } => {
            if let Some(token) = token {
                params.insert("id".to_string(), Value::String(token.clone()));
            }
        }
        Handshake::Reply { accepted, message } => {
            params.insert("result".to_string(), Value::Bool(*accepted));
            if let Some(message) = message {
                params.insert("message".to_string(), Value::String(message.clone()));
            }
        }
    }
    Value::Object(params)
}
