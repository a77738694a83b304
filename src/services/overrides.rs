use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::MatchingError;
use crate::models::{
    AssignUserRequest, AssignedBy, AuditAction, BulkAssignItemResult, BulkAssignRequest,
    BulkAssignResponse, CreateGroupRequest, GroupMember, GroupView, MatchingAuditEntry,
    MatchingGroup, MatchingRun, MoveUserRequest, RemoveUserRequest,
};
use crate::services::coordinator::EngineContext;
use crate::services::repository::{GroupMutation, MemberRemoval};

/// Manual edits to a committed run
///
/// Each edit checks the versions of the groups it touches, lands as one
/// repository mutation together with its audit entry, and then schedules a
/// chat sync for those groups. Edits to unrelated groups never block each other.
pub struct ManualOverrideService {
    ctx: EngineContext,
}

fn group_state(group: &MatchingGroup) -> Value {
    json!({
        "groupId": group.id,
        "groupNumber": group.group_number,
        "version": group.version,
        "minSize": group.min_size,
        "maxSize": group.max_size,
        "memberIds": group.active_member_ids(),
    })
}

fn find_group(groups: &[MatchingGroup], group_id: Uuid) -> Result<&MatchingGroup, MatchingError> {
    groups
        .iter()
        .find(|g| g.id == group_id)
        .ok_or(MatchingError::GroupNotFound(group_id))
}

fn check_version(group: &MatchingGroup, expected: Option<i64>) -> Result<i64, MatchingError> {
    match expected {
        Some(expected) if expected != group.version => Err(MatchingError::ConcurrentModification {
            group_id: group.id,
            expected,
            actual: group.version,
        }),
        _ => Ok(group.version),
    }
}

fn ensure_unseated(groups: &[MatchingGroup], user_id: &str) -> Result<(), MatchingError> {
    match groups.iter().find(|g| g.has_active_member(user_id)) {
        Some(group) => Err(MatchingError::ParticipantAlreadyAssigned {
            user_id: user_id.to_string(),
            group_id: group.id,
        }),
        None => Ok(()),
    }
}

fn manual_member(group_id: Uuid, user_id: &str, at: DateTime<Utc>) -> GroupMember {
    GroupMember {
        group_id,
        user_id: user_id.to_string(),
        assigned_by: AssignedBy::Manual,
        assigned_at: at,
        removed_at: None,
    }
}

/// Predicted state of `group` after the edit, for the audit trail
fn edited(group: &MatchingGroup, remove: Option<&str>, add: Option<&str>, at: DateTime<Utc>) -> MatchingGroup {
    let mut after = group.clone();
    if let Some(user_id) = remove {
        for member in after.members.iter_mut() {
            if member.user_id == user_id && member.is_active() {
                member.removed_at = Some(at);
            }
        }
    }
    if let Some(user_id) = add {
        after.members.push(manual_member(group.id, user_id, at));
    }
    after.version += 1;
    after
}

impl ManualOverrideService {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    fn audit(run: &MatchingRun, actor_id: &str, action: AuditAction, before: Value, after: Value, at: DateTime<Utc>) -> MatchingAuditEntry {
        MatchingAuditEntry {
            id: Uuid::new_v4(),
            run_id: run.id,
            actor_id: actor_id.to_string(),
            action,
            before_state: before,
            after_state: after,
            timestamp: at,
        }
    }

    async fn apply(
        &self,
        event_id: &str,
        action: AuditAction,
        mutation: GroupMutation,
    ) -> Result<Vec<MatchingGroup>, MatchingError> {
        let groups = self.ctx.repository.apply_mutation(mutation).await?;
        self.ctx.provisioning.dispatch(event_id, &groups);

        let ids: Vec<Uuid> = groups.iter().map(|g| g.id).collect();
        tracing::info!(
            event_id = %event_id,
            action = action.as_str(),
            groups = ?ids,
            "Manual override applied"
        );

        Ok(groups)
    }

    fn rejected<T>(event_id: &str, action: AuditAction, result: Result<T, MatchingError>) -> Result<T, MatchingError> {
        if let Err(e) = &result {
            tracing::warn!(
                event_id = %event_id,
                action = action.as_str(),
                "Manual override rejected: {}",
                e
            );
        }
        result
    }

    pub async fn assign_user_to_group(
        &self,
        event_id: &str,
        actor_id: &str,
        request: &AssignUserRequest,
    ) -> Result<Vec<MatchingGroup>, MatchingError> {
        let result = self
            .ctx
            .with_timeout("assign", async {
                let (run, groups) = self.ctx.committed(event_id).await?;
                let target = find_group(&groups, request.group_id)?;
                let version = check_version(target, request.expected_version)?;

                self.ctx.resolver.ensure_paid(event_id, &request.user_id).await?;
                ensure_unseated(&groups, &request.user_id)?;
                if target.is_full() {
                    return Err(MatchingError::GroupCapacityExceeded {
                        group_id: target.id,
                        max_size: target.max_size,
                    });
                }

                let now = Utc::now();
                let after = edited(target, None, Some(&request.user_id), now);
                let mutation = GroupMutation {
                    run_id: run.id,
                    expected_versions: vec![(target.id, version)],
                    removals: Vec::new(),
                    additions: vec![manual_member(target.id, &request.user_id, now)],
                    new_groups: Vec::new(),
                    audit: Self::audit(
                        &run,
                        actor_id,
                        AuditAction::AssignUser,
                        json!({ "userId": request.user_id, "group": group_state(target) }),
                        json!({ "userId": request.user_id, "group": group_state(&after) }),
                        now,
                    ),
                    applied_at: now,
                };

                self.apply(event_id, AuditAction::AssignUser, mutation).await
            })
            .await;

        Self::rejected(event_id, AuditAction::AssignUser, result)
    }

    /// Remove from one group and seat in another, all or nothing
    pub async fn move_user_between_groups(
        &self,
        event_id: &str,
        actor_id: &str,
        request: &MoveUserRequest,
    ) -> Result<Vec<MatchingGroup>, MatchingError> {
        let result = self
            .ctx
            .with_timeout("move", async {
                let (run, groups) = self.ctx.committed(event_id).await?;
                let from = find_group(&groups, request.from_group_id)?;
                let to = find_group(&groups, request.to_group_id)?;

                if from.id == to.id {
                    return Err(MatchingError::ParticipantAlreadyAssigned {
                        user_id: request.user_id.clone(),
                        group_id: to.id,
                    });
                }

                let from_version = check_version(from, request.expected_from_version)?;
                let to_version = check_version(to, request.expected_to_version)?;

                if !from.has_active_member(&request.user_id) {
                    return Err(MatchingError::ParticipantNotInGroup {
                        user_id: request.user_id.clone(),
                        group_id: from.id,
                    });
                }
                if to.is_full() {
                    return Err(MatchingError::GroupCapacityExceeded {
                        group_id: to.id,
                        max_size: to.max_size,
                    });
                }
                if from.active_count() <= from.min_size {
                    return Err(MatchingError::InvalidGroupSize(format!(
                        "moving {} would leave group {} below its minimum of {}",
                        request.user_id, from.id, from.min_size
                    )));
                }

                let now = Utc::now();
                let from_after = edited(from, Some(&request.user_id), None, now);
                let to_after = edited(to, None, Some(&request.user_id), now);
                let mutation = GroupMutation {
                    run_id: run.id,
                    expected_versions: vec![(from.id, from_version), (to.id, to_version)],
                    removals: vec![MemberRemoval {
                        group_id: from.id,
                        user_id: request.user_id.clone(),
                    }],
                    additions: vec![manual_member(to.id, &request.user_id, now)],
                    new_groups: Vec::new(),
                    audit: Self::audit(
                        &run,
                        actor_id,
                        AuditAction::MoveUser,
                        json!({
                            "userId": request.user_id,
                            "from": group_state(from),
                            "to": group_state(to),
                        }),
                        json!({
                            "userId": request.user_id,
                            "from": group_state(&from_after),
                            "to": group_state(&to_after),
                        }),
                        now,
                    ),
                    applied_at: now,
                };

                self.apply(event_id, AuditAction::MoveUser, mutation).await
            })
            .await;

        Self::rejected(event_id, AuditAction::MoveUser, result)
    }

    /// Mark a membership removed; the row itself is kept
    pub async fn remove_user_from_group(
        &self,
        event_id: &str,
        actor_id: &str,
        request: &RemoveUserRequest,
    ) -> Result<Vec<MatchingGroup>, MatchingError> {
        let result = self
            .ctx
            .with_timeout("remove", async {
                let (run, groups) = self.ctx.committed(event_id).await?;
                let group = find_group(&groups, request.group_id)?;
                let version = check_version(group, request.expected_version)?;

                if !group.has_active_member(&request.user_id) {
                    return Err(MatchingError::ParticipantNotInGroup {
                        user_id: request.user_id.clone(),
                        group_id: group.id,
                    });
                }
                if group.active_count() <= group.min_size {
                    return Err(MatchingError::InvalidGroupSize(format!(
                        "removing {} would leave group {} below its minimum of {}",
                        request.user_id, group.id, group.min_size
                    )));
                }

                let now = Utc::now();
                let after = edited(group, Some(&request.user_id), None, now);
                let mutation = GroupMutation {
                    run_id: run.id,
                    expected_versions: vec![(group.id, version)],
                    removals: vec![MemberRemoval {
                        group_id: group.id,
                        user_id: request.user_id.clone(),
                    }],
                    additions: Vec::new(),
                    new_groups: Vec::new(),
                    audit: Self::audit(
                        &run,
                        actor_id,
                        AuditAction::RemoveUser,
                        json!({ "userId": request.user_id, "group": group_state(group) }),
                        json!({ "userId": request.user_id, "group": group_state(&after) }),
                        now,
                    ),
                    applied_at: now,
                };

                self.apply(event_id, AuditAction::RemoveUser, mutation).await
            })
            .await;

        Self::rejected(event_id, AuditAction::RemoveUser, result)
    }

    /// Seat a hand-picked set of paid attendees at a new group
    ///
    /// Bounds default to the configured policy; explicit bounds may go below it.
    pub async fn create_manual_group(
        &self,
        event_id: &str,
        actor_id: &str,
        request: &CreateGroupRequest,
    ) -> Result<Vec<MatchingGroup>, MatchingError> {
        let result = self
            .ctx
            .with_timeout("create_group", async {
                let min_size = request.min_size.unwrap_or(self.ctx.policy.min_size);
                let max_size = request.max_size.unwrap_or(self.ctx.policy.max_size);
                if min_size == 0 || min_size > max_size {
                    return Err(MatchingError::InvalidGroupSize(format!(
                        "expected 1 <= min <= max, got {} / {}",
                        min_size, max_size
                    )));
                }
                let count = request.member_ids.len();
                if count < min_size || count > max_size {
                    return Err(MatchingError::InvalidGroupSize(format!(
                        "{} members outside [{}, {}]",
                        count, min_size, max_size
                    )));
                }

                let mut seen = HashSet::new();
                for user_id in &request.member_ids {
                    if !seen.insert(user_id) {
                        return Err(MatchingError::DuplicateMember(user_id.clone()));
                    }
                }

                let (run, groups) = self.ctx.committed(event_id).await?;
                self.ctx.resolver.ensure_all_paid(event_id, &request.member_ids).await?;
                for user_id in &request.member_ids {
                    ensure_unseated(&groups, user_id)?;
                }

                let now = Utc::now();
                let id = Uuid::new_v4();
                let group = MatchingGroup {
                    id,
                    run_id: run.id,
                    // assigned by the repository
                    group_number: 0,
                    min_size,
                    max_size,
                    origin: AssignedBy::Manual,
                    version: 1,
                    created_at: now,
                    updated_at: now,
                    members: request
                        .member_ids
                        .iter()
                        .map(|user_id| manual_member(id, user_id, now))
                        .collect(),
                };

                let mutation = GroupMutation {
                    run_id: run.id,
                    expected_versions: Vec::new(),
                    removals: Vec::new(),
                    additions: Vec::new(),
                    audit: Self::audit(
                        &run,
                        actor_id,
                        AuditAction::CreateManualGroup,
                        json!({ "group": Value::Null }),
                        json!({ "group": group_state(&group) }),
                        now,
                    ),
                    new_groups: vec![group],
                    applied_at: now,
                };

                self.apply(event_id, AuditAction::CreateManualGroup, mutation).await
            })
            .await;

        Self::rejected(event_id, AuditAction::CreateManualGroup, result)
    }

    /// Apply each assignment on its own; one failure never aborts the batch
    pub async fn bulk_assign_users(
        &self,
        event_id: &str,
        actor_id: &str,
        request: &BulkAssignRequest,
    ) -> BulkAssignResponse {
        let mut results = Vec::with_capacity(request.assignments.len());

        for (index, assignment) in request.assignments.iter().enumerate() {
            let outcome = self.assign_user_to_group(event_id, actor_id, assignment).await;
            let item = match outcome {
                Ok(groups) => BulkAssignItemResult {
                    index,
                    user_id: assignment.user_id.clone(),
                    group_id: assignment.group_id,
                    success: true,
                    group: groups.iter().find(|g| g.id == assignment.group_id).map(GroupView::from),
                    error: None,
                },
                Err(e) => BulkAssignItemResult {
                    index,
                    user_id: assignment.user_id.clone(),
                    group_id: assignment.group_id,
                    success: false,
                    group: None,
                    error: Some(e.to_response()),
                },
            };
            results.push(item);
        }

        let response = BulkAssignResponse::from_results(results);
        tracing::info!(
            event_id = %event_id,
            succeeded = response.succeeded,
            failed = response.failed,
            "Bulk assignment finished"
        );
        response
    }
}
