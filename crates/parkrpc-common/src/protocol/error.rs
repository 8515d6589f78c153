use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Domain errors raised by the lot operations themselves.
///
/// These are application-level failures: the backend and the store are
/// healthy, the request was simply not permitted by the lot rules. The
/// failover layer never retries them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LotError {
    #[error("Car is already in lot {0}")]
    AlreadyInLot(u32),

    #[error("Car is not in a lot")]
    NotInLot,

    #[error("Lot {0} is full")]
    LotFull(u32),

    #[error("Lot {0} is not known to the system")]
    LotNotFound(u32),

    #[error("Car is already on the top level")]
    AtTopLevel,

    #[error("Car is already on the bottom level")]
    AtBottomLevel,

    #[error("Car is not on an exit level")]
    NotOnExitLevel,
}

#[derive(Error, Debug)]
pub enum ParkrpcError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Client {0} is not known to the system")]
    UnknownClient(u64),

    #[error(transparent)]
    Lot(#[from] LotError),

    #[error("Name not found in directory: {0}")]
    NameNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ParkrpcError {
    /// True for transport-level failures: the remote may be fine, the call
    /// may simply never have arrived. Always retried by the failover layer.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ParkrpcError::Connection(_) | ParkrpcError::Timeout(_) | ParkrpcError::Io(_)
        )
    }

    /// True when the failover layer should retry against another node.
    ///
    /// `ServiceUnavailable` means the node answered but cannot serve (its
    /// store is unreachable); it is retried identically to a transport
    /// failure.
    pub fn is_retryable(&self) -> bool {
        self.is_transient() || matches!(self, ParkrpcError::ServiceUnavailable(_))
    }

    /// Maps this error to its wire representation, if it has one.
    ///
    /// Transport-local failures (`Connection`, `Timeout`, `Io`,
    /// `Serialization`) never cross the wire as codes: they are produced on
    /// the caller's side of the socket.
    pub fn wire_code(&self) -> Option<ErrorCode> {
        match self {
            ParkrpcError::ServiceUnavailable(_) => Some(ErrorCode::ServiceUnavailable),
            ParkrpcError::UnknownClient(client_id) => Some(ErrorCode::UnknownClient {
                client_id: *client_id,
            }),
            ParkrpcError::Lot(LotError::AlreadyInLot(lot)) => {
                Some(ErrorCode::AlreadyInLot { lot: *lot })
            }
            ParkrpcError::Lot(LotError::NotInLot) => Some(ErrorCode::NotInLot),
            ParkrpcError::Lot(LotError::LotFull(lot)) => Some(ErrorCode::LotFull { lot: *lot }),
            ParkrpcError::Lot(LotError::LotNotFound(lot)) => {
                Some(ErrorCode::LotNotFound { lot: *lot })
            }
            ParkrpcError::Lot(LotError::AtTopLevel) => Some(ErrorCode::AtTopLevel),
            ParkrpcError::Lot(LotError::AtBottomLevel) => Some(ErrorCode::AtBottomLevel),
            ParkrpcError::Lot(LotError::NotOnExitLevel) => Some(ErrorCode::NotOnExitLevel),
            ParkrpcError::NameNotFound(name) => Some(ErrorCode::NameNotFound { name: name.clone() }),
            ParkrpcError::InvalidRequest(_) => Some(ErrorCode::BadRequest),
            _ => None,
        }
    }
}

/// Machine-readable error class carried in every failed `Response`.
///
/// The failover layer classifies failures by this code rather than by
/// message text, so the set here is the authoritative taxonomy of what a
/// node can report across the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "code", content = "data")]
pub enum ErrorCode {
    /// Node is up but cannot serve (its store is unreachable).
    ServiceUnavailable,
    /// The client identity is not in the ledger. Fatal: client and backend
    /// state have diverged.
    UnknownClient { client_id: u64 },
    AlreadyInLot { lot: u32 },
    NotInLot,
    LotFull { lot: u32 },
    LotNotFound { lot: u32 },
    AtTopLevel,
    AtBottomLevel,
    NotOnExitLevel,
    /// Directory lookup miss.
    NameNotFound { name: String },
    /// Malformed request; a caller-side contract violation.
    BadRequest,
}

impl ErrorCode {
    /// Reconstructs the error on the receiving side of the wire.
    pub fn into_error(self, message: String) -> ParkrpcError {
        match self {
            ErrorCode::ServiceUnavailable => ParkrpcError::ServiceUnavailable(message),
            ErrorCode::UnknownClient { client_id } => ParkrpcError::UnknownClient(client_id),
            ErrorCode::AlreadyInLot { lot } => LotError::AlreadyInLot(lot).into(),
            ErrorCode::NotInLot => LotError::NotInLot.into(),
            ErrorCode::LotFull { lot } => LotError::LotFull(lot).into(),
            ErrorCode::LotNotFound { lot } => LotError::LotNotFound(lot).into(),
            ErrorCode::AtTopLevel => LotError::AtTopLevel.into(),
            ErrorCode::AtBottomLevel => LotError::AtBottomLevel.into(),
            ErrorCode::NotOnExitLevel => LotError::NotOnExitLevel.into(),
            ErrorCode::NameNotFound { name } => ParkrpcError::NameNotFound(name),
            ErrorCode::BadRequest => ParkrpcError::InvalidRequest(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, ParkrpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ParkrpcError::Connection("refused".to_string()).is_transient());
        assert!(ParkrpcError::Timeout(5000).is_transient());
        assert!(!ParkrpcError::ServiceUnavailable("db down".to_string()).is_transient());
        assert!(!ParkrpcError::UnknownClient(7).is_transient());
    }

    #[test]
    fn test_retryable_includes_service_unavailable() {
        assert!(ParkrpcError::ServiceUnavailable("db down".to_string()).is_retryable());
        assert!(ParkrpcError::Connection("reset".to_string()).is_retryable());
        assert!(!ParkrpcError::UnknownClient(7).is_retryable());
        assert!(!ParkrpcError::Lot(LotError::LotFull(3)).is_retryable());
        assert!(!ParkrpcError::InvalidRequest("bad args".to_string()).is_retryable());
    }

    #[test]
    fn test_wire_round_trip_preserves_class() {
        let errors = vec![
            ParkrpcError::ServiceUnavailable("db down".to_string()),
            ParkrpcError::UnknownClient(42),
            ParkrpcError::Lot(LotError::AlreadyInLot(2)),
            ParkrpcError::Lot(LotError::LotFull(1)),
            ParkrpcError::Lot(LotError::AtTopLevel),
            ParkrpcError::NameNotFound("primary".to_string()),
        ];
        for err in errors {
            let code = err.wire_code().expect("server-side error must have a code");
            let rebuilt = code.into_error(err.to_string());
            assert_eq!(rebuilt.to_string(), err.to_string());
        }
    }

    #[test]
    fn test_transport_errors_have_no_wire_code() {
        assert!(ParkrpcError::Connection("lost".to_string()).wire_code().is_none());
        assert!(ParkrpcError::Timeout(100).wire_code().is_none());
    }

    #[test]
    fn test_error_code_serialization() {
        let code = ErrorCode::UnknownClient { client_id: 9 };
        let json = serde_json::to_string(&code).unwrap();
        let decoded: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(code, decoded);
    }
}
