use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::MatchingError;

/// Self-reported gender, as supplied by the profile subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Gender {
    Female,
    Male,
    NonBinary,
}

/// How comfortable a participant is sitting at a mixed-gender table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenderMixPreference {
    #[default]
    NoPreference,
    PreferSameGender,
    Depends,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipIntent {
    Friendship,
    Romance,
    Networking,
    Open,
}

/// How `GenderMixPreference::Depends` is interpreted for a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependsRule {
    /// Mixed pairs are excluded unless they share a relationship intent
    #[default]
    SharedIntent,
    /// Treated like `PreferSameGender`
    Strict,
    /// Never excludes
    Lenient,
}

/// Personality trait scores with a fixed dimensionality
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraitVector(Vec<f64>);

impl TraitVector {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Reject vectors that cannot be scored instead of coercing them
    pub fn validate(&self, user_id: &str, dimensions: usize) -> Result<(), MatchingError> {
        let invalid = |reason: String| MatchingError::InvalidTraitVector {
            user_id: user_id.to_string(),
            reason,
        };

        if self.0.len() != dimensions {
            return Err(invalid(format!(
                "expected {} dimensions, got {}",
                dimensions,
                self.0.len()
            )));
        }
        if let Some(pos) = self.0.iter().position(|v| !v.is_finite() || *v < 0.0) {
            return Err(invalid(format!(
                "component {} must be a finite non-negative number",
                pos
            )));
        }
        if self.0.iter().all(|v| *v == 0.0) {
            return Err(invalid("all components are zero".to_string()));
        }
        Ok(())
    }
}

/// A paid attendee enriched with their personality profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub event_id: String,
    pub transaction_id: String,
    pub paid_at: DateTime<Utc>,
    pub trait_vector: TraitVector,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub gender_mix_preference: GenderMixPreference,
    #[serde(default)]
    pub relationship_intent: Vec<RelationshipIntent>,
}

/// Payment subsystem view of one attendee
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaidAttendee {
    pub user_id: String,
    pub transaction_id: String,
    pub paid_at: DateTime<Utc>,
    #[serde(default)]
    pub cancelled: bool,
}

/// Personality subsystem view of one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonalityProfile {
    pub user_id: String,
    pub trait_vector: TraitVector,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub gender_mix_preference: GenderMixPreference,
    #[serde(default)]
    pub intent: Vec<RelationshipIntent>,
}

/// Lifecycle of a matching run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Preview {
        #[serde(rename = "expiresAt")]
        expires_at: DateTime<Utc>,
    },
    Committed {
        #[serde(rename = "committedAt")]
        committed_at: DateTime<Utc>,
    },
    Superseded {
        #[serde(rename = "supersededAt")]
        superseded_at: DateTime<Utc>,
    },
}

impl RunState {
    pub fn label(&self) -> &'static str {
        match self {
            RunState::Preview { .. } => "PREVIEW",
            RunState::Committed { .. } => "COMMITTED",
            RunState::Superseded { .. } => "SUPERSEDED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchingRun {
    pub id: Uuid,
    pub event_id: String,
    #[serde(flatten)]
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

impl MatchingRun {
    pub fn is_committed(&self) -> bool {
        matches!(self.state, RunState::Committed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignedBy {
    Auto,
    Manual,
}

impl AssignedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignedBy::Auto => "AUTO",
            AssignedBy::Manual => "MANUAL",
        }
    }
}

impl FromStr for AssignedBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AUTO" => Ok(AssignedBy::Auto),
            "MANUAL" => Ok(AssignedBy::Manual),
            other => Err(format!("unknown assignment origin: {}", other)),
        }
    }
}

/// One membership row; removal sets `removed_at` and keeps the row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMember {
    pub group_id: Uuid,
    pub user_id: String,
    pub assigned_by: AssignedBy,
    pub assigned_at: DateTime<Utc>,
    #[serde(default)]
    pub removed_at: Option<DateTime<Utc>>,
}

impl GroupMember {
    pub fn is_active(&self) -> bool {
        self.removed_at.is_none()
    }
}

/// A seated table within a committed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchingGroup {
    pub id: Uuid,
    pub run_id: Uuid,
    pub group_number: u32,
    pub min_size: usize,
    pub max_size: usize,
    pub origin: AssignedBy,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub members: Vec<GroupMember>,
}

impl MatchingGroup {
    pub fn active_members(&self) -> impl Iterator<Item = &GroupMember> {
        self.members.iter().filter(|m| m.is_active())
    }

    pub fn active_member_ids(&self) -> Vec<String> {
        self.active_members().map(|m| m.user_id.clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.active_members().count()
    }

    pub fn has_active_member(&self, user_id: &str) -> bool {
        self.active_members().any(|m| m.user_id == user_id)
    }

    pub fn is_full(&self) -> bool {
        self.active_count() >= self.max_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    AssignUser,
    MoveUser,
    RemoveUser,
    CreateManualGroup,
    InvalidateRun,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::AssignUser => "ASSIGN_USER",
            AuditAction::MoveUser => "MOVE_USER",
            AuditAction::RemoveUser => "REMOVE_USER",
            AuditAction::CreateManualGroup => "CREATE_MANUAL_GROUP",
            AuditAction::InvalidateRun => "INVALIDATE_RUN",
        }
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ASSIGN_USER" => Ok(AuditAction::AssignUser),
            "MOVE_USER" => Ok(AuditAction::MoveUser),
            "REMOVE_USER" => Ok(AuditAction::RemoveUser),
            "CREATE_MANUAL_GROUP" => Ok(AuditAction::CreateManualGroup),
            "INVALIDATE_RUN" => Ok(AuditAction::InvalidateRun),
            other => Err(format!("unknown audit action: {}", other)),
        }
    }
}

/// Append-only record of a manual mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchingAuditEntry {
    pub id: Uuid,
    pub run_id: Uuid,
    pub actor_id: String,
    pub action: AuditAction,
    pub before_state: serde_json::Value,
    pub after_state: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Size bounds applied to automatically formed groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSizePolicy {
    pub min_size: usize,
    pub target_size: usize,
    pub max_size: usize,
}

impl GroupSizePolicy {
    pub fn new(min_size: usize, target_size: usize, max_size: usize) -> Result<Self, MatchingError> {
        let policy = Self {
            min_size,
            target_size,
            max_size,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), MatchingError> {
        if self.min_size < 2 {
            return Err(MatchingError::InvalidGroupSize(format!(
                "minimum group size must be at least 2, got {}",
                self.min_size
            )));
        }
        if self.min_size > self.target_size || self.target_size > self.max_size {
            return Err(MatchingError::InvalidGroupSize(format!(
                "expected min <= target <= max, got {} / {} / {}",
                self.min_size, self.target_size, self.max_size
            )));
        }
        Ok(())
    }
}

impl Default for GroupSizePolicy {
    fn default() -> Self {
        Self {
            min_size: 4,
            target_size: 5,
            max_size: 6,
        }
    }
}

/// Weights for the compatibility score
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringWeights {
    pub traits: f64,
    pub intent: f64,
    /// Per-dimension weights; its length fixes the trait vector dimensionality
    pub dimensions: Vec<f64>,
    pub depends_rule: DependsRule,
}

pub const DEFAULT_TRAIT_DIMENSIONS: usize = 5;

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            traits: 0.85,
            intent: 0.15,
            dimensions: vec![1.0; DEFAULT_TRAIT_DIMENSIONS],
            depends_rule: DependsRule::default(),
        }
    }
}

/// A group proposed by the allocator, before it is persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedGroup {
    pub group_number: u32,
    pub member_ids: Vec<String>,
    pub aggregate_score: f64,
}

/// Allocator output: every input participant appears exactly once across both fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub groups: Vec<ProposedGroup>,
    pub unassignable: Vec<String>,
}

impl Allocation {
    pub fn assigned_count(&self) -> usize {
        self.groups.iter().map(|g| g.member_ids.len()).sum()
    }
}

/// A preview run kept for inspection until its TTL lapses; never committed as-is
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewSnapshot {
    pub run: MatchingRun,
    pub policy: GroupSizePolicy,
    pub eligible_count: usize,
    pub allocation: Allocation,
}
