//! Tests for the protocol module: request/response serialization, ID
//! generation and error class round-trips.

#[cfg(test)]
mod tests {
    use super::super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_request_creation() {
        let req = Request::new("enter_lot", json!({"client_id": 1, "seq": 1, "lot": 2}));
        assert_eq!(req.method, "enter_lot");
        assert_eq!(req.args, json!({"client_id": 1, "seq": 1, "lot": 2}));
        assert!(req.timeout_ms.is_none());
    }

    #[test]
    fn test_request_with_timeout() {
        let req = Request::new("probe", json!({})).with_timeout(2000);
        assert_eq!(req.timeout_ms, Some(2000));
    }

    #[test]
    fn test_request_id_uniqueness() {
        let ids: HashSet<_> = (0..1000)
            .map(|_| Request::new("probe", json!({})).id)
            .collect();
        assert_eq!(ids.len(), 1000, "All request IDs should be unique");
    }

    #[test]
    fn test_serialization_roundtrip() {
        let req = Request::new("exit_lot", json!({"client_id": 3, "seq": 9}));
        let serialized = serde_json::to_value(&req).unwrap();
        let deserialized: Request = serde_json::from_value(serialized).unwrap();
        assert_eq!(req, deserialized);
    }

    #[test]
    fn test_response_serialization_roundtrip() {
        let resp = Response::success(1, json!({"level": 2}));
        let serialized = serde_json::to_value(&resp).unwrap();
        let deserialized: Response = serde_json::from_value(serialized).unwrap();
        assert_eq!(resp, deserialized);
    }

    #[test]
    fn test_failure_serialization_roundtrip() {
        let resp = Response::failure(7, &ParkrpcError::Lot(LotError::LotFull(4)));
        let serialized = serde_json::to_value(&resp).unwrap();
        let deserialized: Response = serde_json::from_value(serialized).unwrap();
        assert_eq!(resp, deserialized);
        assert!(matches!(
            deserialized.into_result(),
            Err(ParkrpcError::Lot(LotError::LotFull(4)))
        ));
    }

    #[test]
    fn test_request_id_uniqueness_under_stress() {
        use std::sync::{Arc, Mutex};
        use std::thread;

        let ids = Arc::new(Mutex::new(HashSet::new()));
        let mut handles = vec![];

        // Spawn 10 threads, each creating 1000 requests
        for _ in 0..10 {
            let ids = Arc::clone(&ids);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let id = Request::new("probe", json!({})).id;
                    ids.lock().unwrap().insert(id);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ids.lock().unwrap().len(), 10_000);
    }
}
