use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use thiserror::Error;
use uuid::Uuid;

use crate::models::ErrorResponse;

/// Errors raised by the matching engine
///
/// Every variant except `ProvisioningFailed` aborts the operation that raised it
/// and is rendered verbatim to the admin, offending identifiers included.
#[derive(Debug, Error)]
pub enum MatchingError {
    #[error("Event not found: {0}")]
    EventNotFound(String),

    #[error("No eligible participants for event {0}")]
    NoEligibleParticipants(String),

    #[error("Matching already in progress for event {0}")]
    MatchingAlreadyInProgress(String),

    #[error("Participant {user_id} is already assigned to group {group_id}")]
    ParticipantAlreadyAssigned { user_id: String, group_id: Uuid },

    #[error("Group {group_id} is full ({max_size} members)")]
    GroupCapacityExceeded { group_id: Uuid, max_size: usize },

    #[error("Group {group_id} was modified concurrently (expected version {expected}, found {actual})")]
    ConcurrentModification {
        group_id: Uuid,
        expected: i64,
        actual: i64,
    },

    #[error("Invalid group size: {0}")]
    InvalidGroupSize(String),

    #[error("Invalid trait vector for user {user_id}: {reason}")]
    InvalidTraitVector { user_id: String, reason: String },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Provisioning failed for group {group_id}: {reason}")]
    ProvisioningFailed { group_id: Uuid, reason: String },

    #[error("No committed matching run for event {0}")]
    RunNotFound(String),

    #[error("Group not found: {0}")]
    GroupNotFound(Uuid),

    #[error("Preview {0} not found or expired")]
    PreviewNotFound(Uuid),

    #[error("Participant {0} is not a paid attendee of this event")]
    ParticipantNotFound(String),

    #[error("Participant {user_id} is not an active member of group {group_id}")]
    ParticipantNotInGroup { user_id: String, group_id: Uuid },

    #[error("Participant {0} is listed more than once")]
    DuplicateMember(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl MatchingError {
    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::EventNotFound(_) => "EventNotFound",
            Self::NoEligibleParticipants(_) => "NoEligibleParticipants",
            Self::MatchingAlreadyInProgress(_) => "MatchingAlreadyInProgress",
            Self::ParticipantAlreadyAssigned { .. } => "ParticipantAlreadyAssigned",
            Self::GroupCapacityExceeded { .. } => "GroupCapacityExceeded",
            Self::ConcurrentModification { .. } => "ConcurrentModification",
            Self::InvalidGroupSize(_) => "InvalidGroupSize",
            Self::InvalidTraitVector { .. } => "InvalidTraitVector",
            Self::Timeout(_) => "Timeout",
            Self::ProvisioningFailed { .. } => "ProvisioningFailed",
            Self::RunNotFound(_) => "RunNotFound",
            Self::GroupNotFound(_) => "GroupNotFound",
            Self::PreviewNotFound(_) => "PreviewNotFound",
            Self::ParticipantNotFound(_) => "ParticipantNotFound",
            Self::ParticipantNotInGroup { .. } => "ParticipantNotInGroup",
            Self::DuplicateMember(_) => "DuplicateMember",
            Self::Storage(_) => "StorageError",
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.code().to_string(),
            message: self.to_string(),
            status_code: self.status_code().as_u16(),
        }
    }
}

impl ResponseError for MatchingError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::EventNotFound(_)
            | Self::RunNotFound(_)
            | Self::GroupNotFound(_)
            | Self::PreviewNotFound(_)
            | Self::ParticipantNotFound(_) => StatusCode::NOT_FOUND,
            Self::MatchingAlreadyInProgress(_)
            | Self::ParticipantAlreadyAssigned { .. }
            | Self::GroupCapacityExceeded { .. }
            | Self::ConcurrentModification { .. } => StatusCode::CONFLICT,
            Self::NoEligibleParticipants(_)
            | Self::InvalidGroupSize(_)
            | Self::InvalidTraitVector { .. }
            | Self::ParticipantNotInGroup { .. }
            | Self::DuplicateMember(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::ProvisioningFailed { .. } | Self::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(self.to_response())
    }
}
