//! JSON-RPC 2.0 wire types shared between the proxy and the sidecar.
//!
//! Params and results are carried as [`RawValue`] so that payloads pass
//! through without a decode/encode round trip.

use serde::{Deserialize, Serialize};
use serde_json::{value::RawValue, Value};
use thiserror::Error as ThisError;

pub const VERSION: &str = "2.0";

pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const PARSE_ERROR: i64 = -32700;

/// Emitted when the eligible client set is empty.
pub const NO_CLIENT_AVAILABLE: i64 = -3200;

/// Generic wrapper for unexpected request failures. The extra digit is
/// part of the wire contract.
pub const REQUEST_FAILED: i64 = -326000;

fn version() -> String {
    VERSION.to_owned()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id:      Option<Value>,
    pub method:  String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params:  Option<Box<RawValue>>,
    #[serde(default = "version")]
    pub jsonrpc: String,
}

impl Request {
    pub fn new(id: Option<Value>, method: impl Into<String>, params: Option<Box<RawValue>>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
            jsonrpc: version(),
        }
    }

    /// Decode `params` as a positional array. Absent params decode to an
    /// empty array.
    pub fn params_array(&self) -> Result<Vec<Value>, serde_json::Error> {
        match &self.params {
            None => Ok(vec![]),
            Some(raw) => serde_json::from_str(raw.get()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ThisError)]
#[error("[{code}] {message}")]
pub struct Error {
    pub code:    i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data:    Option<Value>,
}

impl Error {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "parse error")
    }

    #[must_use]
    pub fn method_not_found() -> Self {
        Self::new(METHOD_NOT_FOUND, "method not found")
    }

    #[must_use]
    pub fn invalid_params() -> Self {
        Self::new(INVALID_PARAMS, "invalid params")
    }

    #[must_use]
    pub fn internal_error() -> Self {
        Self::new(INTERNAL_ERROR, "internal error")
    }

    #[must_use]
    pub fn no_client_available() -> Self {
        Self::new(NO_CLIENT_AVAILABLE, "no client available")
    }

    #[must_use]
    pub fn request_failed(message: impl Into<String>) -> Self {
        Self::new(REQUEST_FAILED, message)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id:      Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result:  Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error:   Option<Error>,
    #[serde(default = "version")]
    pub jsonrpc: String,
}

impl Response {
    pub fn result(id: Option<Value>, result: Box<RawValue>) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
            jsonrpc: version(),
        }
    }

    pub fn error(id: Option<Value>, error: Error) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
            jsonrpc: version(),
        }
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn request_decodes_without_params() {
        let req: Request = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"method":"eth_blockNumber"}"#,
        )
        .unwrap();
        assert_eq!(req.id, Some(json!(1)));
        assert_eq!(req.method, "eth_blockNumber");
        assert_eq!(req.params_array().unwrap(), Vec::<Value>::new());
    }

    #[test]
    fn request_params_pass_through_verbatim() {
        let raw = r#"{"jsonrpc":"2.0","id":"a","method":"eth_getBalance","params":["0xabc","latest"]}"#;
        let req: Request = serde_json::from_str(raw).unwrap();
        assert_eq!(req.params.as_ref().unwrap().get(), r#"["0xabc","latest"]"#);
        assert_eq!(
            req.params_array().unwrap(),
            vec![json!("0xabc"), json!("latest")]
        );
    }

    #[test]
    fn response_roundtrip_preserves_id() {
        let resp = Response::error(Some(json!(42)), Error::method_not_found());
        let encoded = serde_json::to_string(&resp).unwrap();
        let decoded: Response = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, Some(json!(42)));
        assert_eq!(decoded.error.unwrap().code, METHOD_NOT_FOUND);
        assert_eq!(decoded.jsonrpc, VERSION);
    }

    #[test]
    fn error_display_includes_code() {
        let err = Error::no_client_available();
        assert_eq!(err.to_string(), "[-3200] no client available");
    }
}
