use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::MatchingError;
use crate::models::{
    GroupMember, MatchingAuditEntry, MatchingGroup, MatchingRun, PaidAttendee, PersonalityProfile,
};

/// New groups to persist under a committed run, in one transaction
#[derive(Debug, Clone)]
pub struct CommitBatch {
    pub run: MatchingRun,
    /// Insert `run` first; otherwise it must already be the event's committed run
    pub create_run: bool,
    /// `group_number` is relative (1..); the repository renumbers after the run's highest
    pub groups: Vec<MatchingGroup>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRemoval {
    pub group_id: Uuid,
    pub user_id: String,
}

/// A manual change to a committed run, applied atomically
///
/// Every group in `expected_versions` must still be at that version, otherwise
/// nothing is written and `ConcurrentModification` is returned. Touched groups
/// get their version bumped.
#[derive(Debug, Clone)]
pub struct GroupMutation {
    pub run_id: Uuid,
    pub expected_versions: Vec<(Uuid, i64)>,
    pub removals: Vec<MemberRemoval>,
    pub additions: Vec<GroupMember>,
    /// Numbered by the repository, continuing after the run's highest
    pub new_groups: Vec<MatchingGroup>,
    pub audit: MatchingAuditEntry,
    pub applied_at: DateTime<Utc>,
}

/// Persistence port for runs, groups, memberships and the audit log
#[async_trait]
pub trait MatchingRepository: Send + Sync {
    /// The event's current COMMITTED run, if any
    async fn committed_run(&self, event_id: &str) -> Result<Option<MatchingRun>, MatchingError>;

    /// All runs of an event, oldest first
    async fn runs(&self, event_id: &str) -> Result<Vec<MatchingRun>, MatchingError>;

    /// Groups of a run ordered by group number, including removed membership rows
    async fn groups(&self, run_id: Uuid) -> Result<Vec<MatchingGroup>, MatchingError>;

    /// Persist a run's new groups; returns them as stored
    async fn commit_groups(&self, batch: CommitBatch) -> Result<Vec<MatchingGroup>, MatchingError>;

    /// Apply a manual mutation; returns the touched and created groups as stored
    async fn apply_mutation(&self, mutation: GroupMutation) -> Result<Vec<MatchingGroup>, MatchingError>;

    /// Move a committed run to SUPERSEDED and record why
    async fn supersede_run(
        &self,
        run_id: Uuid,
        superseded_at: DateTime<Utc>,
        audit: MatchingAuditEntry,
    ) -> Result<MatchingRun, MatchingError>;

    /// Audit entries of every run of an event, oldest first
    async fn audit_entries(&self, event_id: &str) -> Result<Vec<MatchingAuditEntry>, MatchingError>;

    async fn health_check(&self) -> Result<bool, MatchingError>;
}

/// Read-only view of the payment and personality subsystems
#[async_trait]
pub trait ParticipantDirectory: Send + Sync {
    async fn event_exists(&self, event_id: &str) -> Result<bool, MatchingError>;

    /// Attendees with a PAID transaction for the event, cancelled ones flagged
    async fn paid_attendees(&self, event_id: &str) -> Result<Vec<PaidAttendee>, MatchingError>;

    async fn profiles(&self, user_ids: &[String]) -> Result<Vec<PersonalityProfile>, MatchingError>;
}
