use crate::id::{AllocationId, HoldId, ResourceId};
use crate::wire::ErrorCode;

/// Engine failures. Every variant maps onto the closed wire code set;
/// input and domain errors never leave partial state behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    BadRequest(String),
    HoldNotFound(HoldId),
    AllocationNotFound(AllocationId),
    CutNotFound(String),
    /// Requested tail predates what the log still retains.
    TailTruncated(ResourceId),
    /// Idempotency key reused with a different command payload.
    IdemConflict(String),
    CapacityViolation {
        resource: ResourceId,
        available: i64,
        demand: i64,
    },
    ExpiredHold(HoldId),
    Internal(String),
}

impl EngineError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        EngineError::BadRequest(msg.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::BadRequest(_) => ErrorCode::BadRequest,
            EngineError::HoldNotFound(_)
            | EngineError::AllocationNotFound(_)
            | EngineError::CutNotFound(_)
            | EngineError::TailTruncated(_) => ErrorCode::NotFound,
            EngineError::IdemConflict(_) => ErrorCode::Conflict,
            EngineError::CapacityViolation { .. } => ErrorCode::CapacityViolation,
            EngineError::ExpiredHold(_) => ErrorCode::ExpiredHold,
            EngineError::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            EngineError::HoldNotFound(id) => write!(f, "hold not found: {id}"),
            EngineError::AllocationNotFound(id) => write!(f, "allocation not found: {id}"),
            EngineError::CutNotFound(id) => write!(f, "cut not found: {id}"),
            EngineError::TailTruncated(resource) => {
                write!(f, "log tail for {resource} no longer retained")
            }
            EngineError::IdemConflict(msg) => write!(f, "idempotency conflict: {msg}"),
            EngineError::CapacityViolation {
                resource,
                available,
                demand,
            } => write!(
                f,
                "capacity violation on {resource}: available {available}, demanded {demand}"
            ),
            EngineError::ExpiredHold(id) => write!(f, "hold expired: {id}"),
            EngineError::Internal(msg) => write!(f, "internal: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}
