//! RPC response types.

use serde::{Deserialize, Serialize};

use super::error::{ErrorCode, ParkrpcError, Result};
use super::RequestId;

/// RPC method result (JSON value).
pub type RpcResult = serde_json::Value;

/// An RPC response returned from a node to the caller.
///
/// A failed response carries both a human-readable `error` message and a
/// machine-readable `error_code`; the failover layer classifies on the code
/// and ignores the message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    /// Request identifier this response corresponds to
    pub id: RequestId,
    /// Result value (present on success)
    pub result: Option<RpcResult>,
    /// Error message (present on failure)
    pub error: Option<String>,
    /// Error class (present on failure)
    pub error_code: Option<ErrorCode>,
    /// Whether the request succeeded
    pub success: bool,
}

impl Response {
    /// Creates a successful response.
    pub fn success(id: RequestId, result: RpcResult) -> Self {
        Response {
            id,
            result: Some(result),
            error: None,
            error_code: None,
            success: true,
        }
    }

    /// Creates a failed response from a server-side error.
    ///
    /// Errors without a wire code (transport-local classes) are degraded to
    /// `ServiceUnavailable`: from the caller's point of view the node could
    /// not serve the request, whatever the internal cause.
    pub fn failure(id: RequestId, err: &ParkrpcError) -> Self {
        Response {
            id,
            result: None,
            error: Some(err.to_string()),
            error_code: Some(err.wire_code().unwrap_or(ErrorCode::ServiceUnavailable)),
            success: false,
        }
    }

    /// Converts the response into a `Result`, rebuilding the typed error on
    /// failure.
    pub fn into_result(self) -> Result<RpcResult> {
        if self.success {
            self.result.ok_or_else(|| {
                ParkrpcError::InvalidRequest("Missing result in success response".to_string())
            })
        } else {
            let message = self.error.unwrap_or_else(|| "Unknown error".to_string());
            match self.error_code {
                Some(code) => Err(code.into_error(message)),
                None => Err(ParkrpcError::ServiceUnavailable(message)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_response() {
        let response = Response::success(123, json!({"levels": [1, 2]}));
        assert!(response.success);
        assert_eq!(response.into_result().unwrap(), json!({"levels": [1, 2]}));
    }

    #[test]
    fn test_failure_response_keeps_class() {
        let err = ParkrpcError::UnknownClient(7);
        let response = Response::failure(5, &err);
        assert!(!response.success);
        match response.into_result() {
            Err(ParkrpcError::UnknownClient(7)) => {}
            other => panic!("expected UnknownClient, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_failure_without_code_degrades_to_unavailable() {
        let response = Response {
            id: 1,
            result: None,
            error: Some("boom".to_string()),
            error_code: None,
            success: false,
        };
        match response.into_result() {
            Err(ParkrpcError::ServiceUnavailable(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected ServiceUnavailable, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_success_without_result_is_invalid() {
        let response = Response {
            id: 1,
            result: None,
            error: None,
            error_code: None,
            success: true,
        };
        assert!(matches!(
            response.into_result(),
            Err(ParkrpcError::InvalidRequest(_))
        ));
    }
}
