use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::domain::{
    AssignedBy, GroupMember, GroupSizePolicy, MatchingAuditEntry, MatchingGroup, MatchingRun,
    PreviewSnapshot, ProposedGroup,
};

/// A committed group as shown to the admin, active members only
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupView {
    pub id: Uuid,
    pub run_id: Uuid,
    pub group_number: u32,
    pub min_size: usize,
    pub max_size: usize,
    pub origin: AssignedBy,
    pub version: i64,
    pub member_ids: Vec<String>,
    pub members: Vec<GroupMember>,
    pub updated_at: DateTime<Utc>,
}

impl From<&MatchingGroup> for GroupView {
    fn from(group: &MatchingGroup) -> Self {
        let members: Vec<GroupMember> = group.active_members().cloned().collect();
        Self {
            id: group.id,
            run_id: group.run_id,
            group_number: group.group_number,
            min_size: group.min_size,
            max_size: group.max_size,
            origin: group.origin,
            version: group.version,
            member_ids: members.iter().map(|m| m.user_id.clone()).collect(),
            members,
            updated_at: group.updated_at,
        }
    }
}

/// Response for the preview endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResponse {
    pub preview_id: Uuid,
    pub event_id: String,
    pub run: MatchingRun,
    pub policy: GroupSizePolicy,
    pub eligible_count: usize,
    pub groups: Vec<ProposedGroup>,
    pub unassignable: Vec<String>,
}

impl From<PreviewSnapshot> for PreviewResponse {
    fn from(snapshot: PreviewSnapshot) -> Self {
        Self {
            preview_id: snapshot.run.id,
            event_id: snapshot.run.event_id.clone(),
            run: snapshot.run,
            policy: snapshot.policy,
            eligible_count: snapshot.eligible_count,
            groups: snapshot.allocation.groups,
            unassignable: snapshot.allocation.unassignable,
        }
    }
}

/// Response for the trigger endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub run: MatchingRun,
    /// False when the trigger was a no-op against an up-to-date run
    pub created: bool,
    pub groups: Vec<GroupView>,
    pub new_group_ids: Vec<Uuid>,
    pub unassignable: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsResponse {
    pub run: MatchingRun,
    pub groups: Vec<GroupView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub event_id: String,
    pub runs: Vec<MatchingRun>,
    pub audit_entries: Vec<MatchingAuditEntry>,
}

/// Groups touched by a manual override, after the change
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResponse {
    pub groups: Vec<GroupView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkAssignItemResult {
    pub index: usize,
    pub user_id: String,
    pub group_id: Uuid,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkAssignResponse {
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<BulkAssignItemResult>,
}

impl BulkAssignResponse {
    pub fn from_results(results: Vec<BulkAssignItemResult>) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        Self {
            succeeded,
            failed: results.len() - succeeded,
            results,
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status_code: u16,
}
