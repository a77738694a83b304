// Model exports
pub mod domain;
pub mod requests;
pub mod responses;

pub use domain::{
    Allocation, AssignedBy, AuditAction, DependsRule, Gender, GenderMixPreference, GroupMember,
    GroupSizePolicy, MatchingAuditEntry, MatchingGroup, MatchingRun, PaidAttendee, Participant,
    PersonalityProfile, PreviewSnapshot, ProposedGroup, RelationshipIntent, RunState, ScoringWeights, TraitVector,
    DEFAULT_TRAIT_DIMENSIONS,
};
pub use requests::{
    AssignUserRequest, BulkAssignRequest, CreateGroupRequest, MoveUserRequest, RemoveUserRequest,
};
pub use responses::{
    BulkAssignItemResult, BulkAssignResponse, ErrorResponse, GroupView, HealthResponse,
    HistoryResponse, MutationResponse, PreviewResponse, ResultsResponse, TriggerResponse,
};
