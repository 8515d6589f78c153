use crate::protocol::error::Result;
use crate::protocol::{Request, Response};

/// JSON codec for encoding/decoding RPC messages.
///
/// JSON keeps the wire format debuggable and matches the
/// `serde_json::Value` types used in `Request` args and `Response` results.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a request to bytes
    pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(request)?)
    }

    /// Decode a request from bytes
    pub fn decode_request(data: &[u8]) -> Result<Request> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Encode a response to bytes
    pub fn encode_response(response: &Response) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(response)?)
    }

    /// Decode a response from bytes
    pub fn decode_response(data: &[u8]) -> Result<Response> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LotError, ParkrpcError};
    use serde_json::json;

    #[test]
    fn test_json_codec_request_round_trip() {
        let request = Request::new("enter_lot", json!({"client_id": 1, "seq": 4, "lot": 2}));

        let encoded = JsonCodec::encode_request(&request).unwrap();
        let decoded = JsonCodec::decode_request(&encoded).unwrap();

        assert_eq!(request, decoded);
    }

    #[test]
    fn test_json_codec_response_round_trip() {
        let response = Response::success(123, json!({"levels": [1, 2, 3]}));

        let encoded = JsonCodec::encode_response(&response).unwrap();
        let decoded = JsonCodec::decode_response(&encoded).unwrap();

        assert_eq!(response, decoded);
    }

    #[test]
    fn test_error_response_round_trip() {
        let response = Response::failure(9, &ParkrpcError::Lot(LotError::NotInLot));

        let encoded = JsonCodec::encode_response(&response).unwrap();
        let decoded = JsonCodec::decode_response(&encoded).unwrap();

        assert_eq!(response, decoded);
        assert!(!decoded.success);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(JsonCodec::decode_request(b"not json").is_err());
        assert!(JsonCodec::decode_response(b"{\"partial\":").is_err());
    }
}
