use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::core::{CompatibilityScorer, GroupAllocator};
use crate::error::MatchingError;
use crate::models::{
    AssignedBy, AuditAction, GroupMember, GroupSizePolicy, MatchingAuditEntry, MatchingGroup,
    MatchingRun, PreviewSnapshot, ProposedGroup, RunState,
};
use crate::services::cache::{CacheKey, CacheManager};
use crate::services::eligibility::EligibilityResolver;
use crate::services::locks::EventLocks;
use crate::services::provisioner::ProvisioningDispatcher;
use crate::services::repository::{CommitBatch, MatchingRepository};

/// Collaborators shared by the coordinator and the override service
#[derive(Clone)]
pub struct EngineContext {
    pub repository: Arc<dyn MatchingRepository>,
    pub resolver: EligibilityResolver,
    pub policy: GroupSizePolicy,
    pub provisioning: ProvisioningDispatcher,
    pub operation_timeout: Duration,
}

impl EngineContext {
    /// Run `operation` under the configured deadline
    ///
    /// Every operation persists through a single repository call, so a
    /// deadline that fires mid-flight leaves no partial state behind.
    pub async fn with_timeout<T, F>(&self, operation: &str, fut: F) -> Result<T, MatchingError>
    where
        F: Future<Output = Result<T, MatchingError>>,
    {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    "{} exceeded {}ms",
                    operation,
                    self.operation_timeout.as_millis()
                );
                Err(MatchingError::Timeout(operation.to_string()))
            }
        }
    }

    /// Committed run of the event together with its groups
    pub async fn committed(&self, event_id: &str) -> Result<(MatchingRun, Vec<MatchingGroup>), MatchingError> {
        self.resolver.ensure_event(event_id).await?;

        let run = self
            .repository
            .committed_run(event_id)
            .await?
            .ok_or_else(|| MatchingError::RunNotFound(event_id.to_string()))?;
        let groups = self.repository.groups(run.id).await?;

        Ok((run, groups))
    }
}

/// Result of a trigger
#[derive(Debug, Clone)]
pub struct TriggerOutcome {
    pub run: MatchingRun,
    /// False when nothing new was committed
    pub created: bool,
    /// Every group of the run after the trigger
    pub groups: Vec<MatchingGroup>,
    pub new_group_ids: Vec<Uuid>,
    pub unassignable: Vec<String>,
}

/// Owns the run lifecycle: preview, commit, invalidation
pub struct MatchingCoordinator {
    ctx: EngineContext,
    scorer: CompatibilityScorer,
    allocator: GroupAllocator,
    locks: EventLocks,
    previews: Arc<CacheManager>,
}

impl MatchingCoordinator {
    pub fn new(ctx: EngineContext, scorer: CompatibilityScorer, previews: Arc<CacheManager>) -> Self {
        let allocator = GroupAllocator::new(ctx.policy);
        Self {
            ctx,
            scorer,
            allocator,
            locks: EventLocks::new(),
            previews,
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Allocate the current pool without persisting anything
    ///
    /// The snapshot is kept in the preview cache for later inspection only;
    /// commit always re-resolves eligibility.
    pub async fn preview_matching(&self, event_id: &str, actor_id: &str) -> Result<PreviewSnapshot, MatchingError> {
        let snapshot = self
            .ctx
            .with_timeout("preview", async {
                let pool = self.ctx.resolver.resolve(event_id).await?;
                let allocation = self.allocator.allocate(&pool, &self.scorer)?;

                let now = Utc::now();
                let ttl = ChronoDuration::seconds(self.previews.ttl_secs() as i64);
                Ok(PreviewSnapshot {
                    run: MatchingRun {
                        id: Uuid::new_v4(),
                        event_id: event_id.to_string(),
                        state: RunState::Preview {
                            expires_at: now + ttl,
                        },
                        created_at: now,
                        created_by: actor_id.to_string(),
                    },
                    policy: self.ctx.policy,
                    eligible_count: pool.len(),
                    allocation,
                })
            })
            .await?;

        let key = CacheKey::preview(event_id, snapshot.run.id);
        if let Err(e) = self.previews.set(&key, &snapshot).await {
            tracing::warn!("Failed to store preview {}: {}", snapshot.run.id, e);
        }

        tracing::info!(
            event_id = %event_id,
            preview_id = %snapshot.run.id,
            groups = snapshot.allocation.groups.len(),
            unassignable = snapshot.allocation.unassignable.len(),
            "Generated matching preview"
        );

        Ok(snapshot)
    }

    pub async fn get_preview(&self, event_id: &str, preview_id: Uuid) -> Result<PreviewSnapshot, MatchingError> {
        self.previews
            .get(&CacheKey::preview(event_id, preview_id))
            .await
            .map_err(|e| {
                tracing::debug!("Preview lookup failed: {}", e);
                MatchingError::PreviewNotFound(preview_id)
            })
    }

    /// Commit groups for every eligible, not yet seated participant
    ///
    /// Fails fast with `MatchingAlreadyInProgress` while another trigger for
    /// the same event is running. Existing groups are never touched.
    pub async fn trigger_matching(&self, event_id: &str, actor_id: &str) -> Result<TriggerOutcome, MatchingError> {
        let _guard = self.locks.try_acquire(event_id).map_err(|e| {
            tracing::warn!("Rejected trigger for event {}: {}", event_id, e);
            e
        })?;

        let outcome = self
            .ctx
            .with_timeout("trigger", self.trigger_locked(event_id, actor_id))
            .await?;

        if outcome.created {
            let new_groups: Vec<MatchingGroup> = outcome
                .groups
                .iter()
                .filter(|g| outcome.new_group_ids.contains(&g.id))
                .cloned()
                .collect();
            self.ctx.provisioning.dispatch(event_id, &new_groups);
        }

        tracing::info!(
            event_id = %event_id,
            run_id = %outcome.run.id,
            created = outcome.created,
            new_groups = ?outcome.new_group_ids,
            unassignable = outcome.unassignable.len(),
            "Matching trigger finished"
        );

        Ok(outcome)
    }

    async fn trigger_locked(&self, event_id: &str, actor_id: &str) -> Result<TriggerOutcome, MatchingError> {
        let pool = self.ctx.resolver.resolve(event_id).await?;
        let existing = self.ctx.repository.committed_run(event_id).await?;

        if pool.is_empty() {
            return match existing {
                Some(run) => self.unchanged(run, Vec::new()).await,
                None => Err(MatchingError::NoEligibleParticipants(event_id.to_string())),
            };
        }

        let allocation = self.allocator.allocate(&pool, &self.scorer)?;

        if allocation.groups.is_empty() {
            if let Some(run) = existing {
                return self.unchanged(run, allocation.unassignable).await;
            }
        }

        let now = Utc::now();
        let (run, create_run, seated) = match existing {
            Some(run) => {
                let seated = self.ctx.repository.groups(run.id).await?;
                (run, false, seated)
            }
            None => (
                MatchingRun {
                    id: Uuid::new_v4(),
                    event_id: event_id.to_string(),
                    state: RunState::Committed { committed_at: now },
                    created_at: now,
                    created_by: actor_id.to_string(),
                },
                true,
                Vec::new(),
            ),
        };

        let groups: Vec<MatchingGroup> = allocation
            .groups
            .iter()
            .map(|proposal| self.materialize(run.id, proposal))
            .collect();

        let stored = self
            .ctx
            .repository
            .commit_groups(CommitBatch {
                run: run.clone(),
                create_run,
                groups,
            })
            .await?;

        // Nothing is read back after the commit
        let new_group_ids = stored.iter().map(|g| g.id).collect();
        let mut groups = seated;
        groups.extend(stored);

        Ok(TriggerOutcome {
            groups,
            new_group_ids,
            run,
            created: true,
            unassignable: allocation.unassignable,
        })
    }

    async fn unchanged(&self, run: MatchingRun, unassignable: Vec<String>) -> Result<TriggerOutcome, MatchingError> {
        let groups = self.ctx.repository.groups(run.id).await?;
        Ok(TriggerOutcome {
            run,
            created: false,
            groups,
            new_group_ids: Vec::new(),
            unassignable,
        })
    }

    fn materialize(&self, run_id: Uuid, proposal: &ProposedGroup) -> MatchingGroup {
        let now = Utc::now();
        let id = Uuid::new_v4();
        MatchingGroup {
            id,
            run_id,
            group_number: proposal.group_number,
            min_size: self.ctx.policy.min_size,
            max_size: self.ctx.policy.max_size,
            origin: AssignedBy::Auto,
            version: 1,
            created_at: now,
            updated_at: now,
            members: proposal
                .member_ids
                .iter()
                .map(|user_id| GroupMember {
                    group_id: id,
                    user_id: user_id.clone(),
                    assigned_by: AssignedBy::Auto,
                    assigned_at: now,
                    removed_at: None,
                })
                .collect(),
        }
    }

    pub async fn results(&self, event_id: &str) -> Result<(MatchingRun, Vec<MatchingGroup>), MatchingError> {
        self.ctx
            .with_timeout("results", self.ctx.committed(event_id))
            .await
    }

    pub async fn history(
        &self,
        event_id: &str,
    ) -> Result<(Vec<MatchingRun>, Vec<MatchingAuditEntry>), MatchingError> {
        self.ctx
            .with_timeout("history", async {
                self.ctx.resolver.ensure_event(event_id).await?;
                let runs = self.ctx.repository.runs(event_id).await?;
                let audit = self.ctx.repository.audit_entries(event_id).await?;
                Ok((runs, audit))
            })
            .await
    }

    /// Retire the committed run; the next trigger starts from the full pool
    pub async fn invalidate_run(&self, event_id: &str, actor_id: &str) -> Result<MatchingRun, MatchingError> {
        let _guard = self.locks.try_acquire(event_id)?;

        let run = self
            .ctx
            .with_timeout("invalidate", async {
                let (run, groups) = self.ctx.committed(event_id).await?;
                let now = Utc::now();
                let seated: Vec<serde_json::Value> = groups
                    .iter()
                    .map(|g| {
                        json!({
                            "groupId": g.id,
                            "groupNumber": g.group_number,
                            "memberIds": g.active_member_ids(),
                        })
                    })
                    .collect();

                let audit = MatchingAuditEntry {
                    id: Uuid::new_v4(),
                    run_id: run.id,
                    actor_id: actor_id.to_string(),
                    action: AuditAction::InvalidateRun,
                    before_state: json!({
                        "status": run.state.label(),
                        "groups": seated,
                    }),
                    after_state: json!({ "status": "SUPERSEDED" }),
                    timestamp: now,
                };

                self.ctx.repository.supersede_run(run.id, now, audit).await
            })
            .await?;

        tracing::info!(event_id = %event_id, run_id = %run.id, actor = %actor_id, "Matching run superseded");

        Ok(run)
    }
}
