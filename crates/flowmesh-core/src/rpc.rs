//! JSON-RPC 2.0 wire types for the provider boundary (spec.md §6).
//!
//! No existing teacher crate implements JSON-RPC (`internal-protocol` is a
//! gRPC/tonic boundary); these are authored fresh as plain `serde` structs
//! following the JSON-RPC 2.0 spec literally.

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn jsonrpc_version() -> String {
    "2.0".to_string()
}

/// A JSON-RPC 2.0 request, one per task dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(rename = "jsonrpc", default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 response: either `result` or `error`, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(rename = "jsonrpc", default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_some()
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Standard JSON-RPC 2.0 reservations plus the orchestrator's private
/// namespace (spec.md §4.3/§7, expanded per SPEC_FULL.md §7 against the
/// original's `ErrorCode` enum).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    ProviderNotAvailable,
    ProviderTimeout,
    ProviderUnhealthy,
    ProviderInitializationFailed,
    AuthenticationFailed,
    AuthorizationFailed,
    RateLimitExceeded,
    ConnectionRefused,
    ConnectionTimeout,
    SystemNotInitialized,
}

impl RpcErrorCode {
    /// The numeric code on the wire. Standard JSON-RPC codes use their
    /// reserved range; private codes use the `-32000..-32099` "server
    /// error" range reserved by the spec for implementation-defined use.
    pub fn code(self) -> i64 {
        match self {
            RpcErrorCode::ParseError => -32700,
            RpcErrorCode::InvalidRequest => -32600,
            RpcErrorCode::MethodNotFound => -32601,
            RpcErrorCode::InvalidParams => -32602,
            RpcErrorCode::InternalError => -32603,
            RpcErrorCode::ProviderNotAvailable => -32000,
            RpcErrorCode::ProviderTimeout => -32001,
            RpcErrorCode::ProviderUnhealthy => -32002,
            RpcErrorCode::ProviderInitializationFailed => -32003,
            RpcErrorCode::AuthenticationFailed => -32004,
            RpcErrorCode::AuthorizationFailed => -32005,
            RpcErrorCode::RateLimitExceeded => -32006,
            RpcErrorCode::ConnectionRefused => -32007,
            RpcErrorCode::ConnectionTimeout => -32008,
            RpcErrorCode::SystemNotInitialized => -32009,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RpcErrorCode::ParseError => "PARSE_ERROR",
            RpcErrorCode::InvalidRequest => "INVALID_REQUEST",
            RpcErrorCode::MethodNotFound => "METHOD_NOT_FOUND",
            RpcErrorCode::InvalidParams => "INVALID_PARAMS",
            RpcErrorCode::InternalError => "INTERNAL_ERROR",
            RpcErrorCode::ProviderNotAvailable => "PROVIDER_NOT_AVAILABLE",
            RpcErrorCode::ProviderTimeout => "PROVIDER_TIMEOUT",
            RpcErrorCode::ProviderUnhealthy => "PROVIDER_UNHEALTHY",
            RpcErrorCode::ProviderInitializationFailed => "PROVIDER_INITIALIZATION_FAILED",
            RpcErrorCode::AuthenticationFailed => "AUTHENTICATION_FAILED",
            RpcErrorCode::AuthorizationFailed => "AUTHORIZATION_FAILED",
            RpcErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            RpcErrorCode::ConnectionRefused => "CONNECTION_REFUSED",
            RpcErrorCode::ConnectionTimeout => "CONNECTION_TIMEOUT",
            RpcErrorCode::SystemNotInitialized => "SYSTEM_NOT_INITIALIZED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_defaults_jsonrpc_version() {
        let req: JsonRpcRequest =
            serde_json::from_value(json!({"id": 1, "method": "add", "params": {}})).unwrap();
        assert_eq!(req.jsonrpc, "2.0");
    }

    #[test]
    fn response_success_has_no_error_field() {
        let resp = JsonRpcResponse::success(json!(1), json!({"sum": 5}));
        let v = serde_json::to_value(&resp).unwrap();
        assert!(v.get("error").is_none());
        assert!(v.get("result").is_some());
    }

    #[test]
    fn method_not_found_matches_standard_code() {
        assert_eq!(RpcErrorCode::MethodNotFound.code(), -32601);
        assert_eq!(RpcErrorCode::InvalidParams.code(), -32602);
    }

    #[test]
    fn private_codes_are_distinct() {
        let mut codes = vec![
            RpcErrorCode::ProviderNotAvailable.code(),
            RpcErrorCode::ProviderTimeout.code(),
            RpcErrorCode::ProviderUnhealthy.code(),
            RpcErrorCode::AuthenticationFailed.code(),
        ];
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), 4);
    }
}
