//! Operator surface.
//!
//! Every exported operation is listed once in [`ops::OPS`] and dispatched by
//! [`ops::dispatch`]; the JSON-lines [`server`] and the interactive [`shell`]
//! both go through that table.
//!
//! Wire format, one JSON object per line:
//!
//! ```text
//! -> {"id": 7, "op": "set_camera_mode", "args": ["HALF"]}
//! <- {"id": 7, "status": "ok", "result": {...}}
//! <- {"id": 7, "status": "error", "result": null, "error": "Invalid camera mode: FOO"}
//! ```

pub mod ops;
pub mod server;
pub mod shell;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use ops::{dispatch, OpSpec, OPS};
pub use server::{call, RpcServer};

/// One request line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Echoed in the response
    #[serde(default)]
    pub id: u64,
    /// Operation name
    pub op: String,
    /// Positional arguments
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcStatus {
    /// The operation succeeded
    Ok,
    /// The operation failed; see `error`
    Error,
}

/// One response line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Id of the request
    pub id: u64,
    /// Outcome
    pub status: RpcStatus,
    /// Operation result; `null` on error
    #[serde(default)]
    pub result: Value,
    /// Error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    /// Successful response.
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            status: RpcStatus::Ok,
            result,
            error: None,
        }
    }

    /// Failed response.
    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            status: RpcStatus::Error,
            result: Value::Null,
            error: Some(message.into()),
        }
    }

    /// Whether the operation succeeded.
    pub fn is_ok(&self) -> bool {
        self.status == RpcStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_args_default_to_empty() {
        let req: RpcRequest = serde_json::from_str(r#"{"id": 3, "op": "state"}"#).unwrap();
        assert_eq!(req.op, "state");
        assert!(req.args.is_empty());

        let resp = RpcResponse::error(3, "nope");
        let line = serde_json::to_string(&resp).unwrap();
        assert_eq!(
            line,
            r#"{"id":3,"status":"error","result":null,"error":"nope"}"#
        );
    }
}
