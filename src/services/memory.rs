use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::MatchingError;
use crate::models::{
    MatchingAuditEntry, MatchingGroup, MatchingRun, PaidAttendee, PersonalityProfile, RunState,
};
use crate::services::repository::{
    CommitBatch, GroupMutation, MatchingRepository, ParticipantDirectory,
};

#[derive(Debug, Default)]
struct StoreState {
    runs: Vec<MatchingRun>,
    groups: HashMap<Uuid, MatchingGroup>,
    audit: Vec<MatchingAuditEntry>,
}

impl StoreState {
    fn run(&self, run_id: Uuid) -> Option<&MatchingRun> {
        self.runs.iter().find(|r| r.id == run_id)
    }

    fn require_committed(&self, run_id: Uuid) -> Result<&MatchingRun, MatchingError> {
        match self.run(run_id) {
            Some(run) if run.is_committed() => Ok(run),
            Some(run) => Err(MatchingError::RunNotFound(run.event_id.clone())),
            None => Err(MatchingError::RunNotFound(run_id.to_string())),
        }
    }

    fn run_groups(&self, run_id: Uuid) -> Vec<MatchingGroup> {
        let mut groups: Vec<MatchingGroup> = self
            .groups
            .values()
            .filter(|g| g.run_id == run_id)
            .cloned()
            .collect();
        groups.sort_by_key(|g| g.group_number);
        groups
    }

    fn next_group_number(&self, run_id: Uuid) -> u32 {
        self.groups
            .values()
            .filter(|g| g.run_id == run_id)
            .map(|g| g.group_number)
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Group holding an active membership for `user_id` in the run
    fn active_group_of(groups: &HashMap<Uuid, MatchingGroup>, run_id: Uuid, user_id: &str) -> Option<Uuid> {
        groups
            .values()
            .find(|g| g.run_id == run_id && g.has_active_member(user_id))
            .map(|g| g.id)
    }
}

/// In-process matching store
///
/// Each call holds the write lock for its whole duration and validates before
/// writing, so every call is atomic. Used for tests and the `memory` backend.
#[derive(Debug, Default)]
pub struct InMemoryMatchingStore {
    state: RwLock<StoreState>,
}

impl InMemoryMatchingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total membership rows ever written, removed ones included
    pub async fn member_row_count(&self) -> usize {
        let state = self.state.read().await;
        state.groups.values().map(|g| g.members.len()).sum()
    }
}

#[async_trait]
impl MatchingRepository for InMemoryMatchingStore {
    async fn committed_run(&self, event_id: &str) -> Result<Option<MatchingRun>, MatchingError> {
        let state = self.state.read().await;
        Ok(state
            .runs
            .iter()
            .find(|r| r.event_id == event_id && r.is_committed())
            .cloned())
    }

    async fn runs(&self, event_id: &str) -> Result<Vec<MatchingRun>, MatchingError> {
        let state = self.state.read().await;
        Ok(state
            .runs
            .iter()
            .filter(|r| r.event_id == event_id)
            .cloned()
            .collect())
    }

    async fn groups(&self, run_id: Uuid) -> Result<Vec<MatchingGroup>, MatchingError> {
        let state = self.state.read().await;
        Ok(state.run_groups(run_id))
    }

    async fn commit_groups(&self, batch: CommitBatch) -> Result<Vec<MatchingGroup>, MatchingError> {
        let mut state = self.state.write().await;

        if batch.create_run {
            if state
                .runs
                .iter()
                .any(|r| r.event_id == batch.run.event_id && r.is_committed())
            {
                return Err(MatchingError::MatchingAlreadyInProgress(batch.run.event_id.clone()));
            }
        } else {
            state.require_committed(batch.run.id)?;
        }

        for group in &batch.groups {
            for member in group.active_members() {
                if let Some(existing) = StoreState::active_group_of(&state.groups, batch.run.id, &member.user_id) {
                    return Err(MatchingError::ParticipantAlreadyAssigned {
                        user_id: member.user_id.clone(),
                        group_id: existing,
                    });
                }
            }
        }

        if batch.create_run {
            state.runs.push(batch.run.clone());
        }

        let offset = state.next_group_number(batch.run.id) - 1;
        let mut stored = Vec::with_capacity(batch.groups.len());
        for mut group in batch.groups {
            group.group_number += offset;
            state.groups.insert(group.id, group.clone());
            stored.push(group);
        }

        Ok(stored)
    }

    async fn apply_mutation(&self, mutation: GroupMutation) -> Result<Vec<MatchingGroup>, MatchingError> {
        let mut state = self.state.write().await;
        state.require_committed(mutation.run_id)?;

        // Work on copies of the touched groups; nothing is written until all checks pass
        let mut working: HashMap<Uuid, MatchingGroup> = HashMap::new();
        for (group_id, expected) in &mutation.expected_versions {
            let group = state
                .groups
                .get(group_id)
                .filter(|g| g.run_id == mutation.run_id)
                .ok_or(MatchingError::GroupNotFound(*group_id))?;
            if group.version != *expected {
                return Err(MatchingError::ConcurrentModification {
                    group_id: *group_id,
                    expected: *expected,
                    actual: group.version,
                });
            }
            working.insert(*group_id, group.clone());
        }

        for removal in &mutation.removals {
            let group = working
                .get_mut(&removal.group_id)
                .ok_or(MatchingError::GroupNotFound(removal.group_id))?;
            let member = group
                .members
                .iter_mut()
                .find(|m| m.user_id == removal.user_id && m.is_active())
                .ok_or_else(|| MatchingError::ParticipantNotInGroup {
                    user_id: removal.user_id.clone(),
                    group_id: removal.group_id,
                })?;
            member.removed_at = Some(mutation.applied_at);
        }

        // Membership uniqueness is checked against the run as it will look after this mutation
        let mut after: HashMap<Uuid, MatchingGroup> = state
            .groups
            .iter()
            .filter(|(id, g)| g.run_id == mutation.run_id && !working.contains_key(id))
            .map(|(id, g)| (*id, g.clone()))
            .collect();
        after.extend(working.iter().map(|(id, g)| (*id, g.clone())));

        let mut added: HashSet<String> = HashSet::new();
        let incoming = mutation
            .additions
            .iter()
            .map(|m| (&m.user_id, m.group_id))
            .chain(
                mutation
                    .new_groups
                    .iter()
                    .flat_map(|g| g.active_members().map(move |m| (&m.user_id, g.id))),
            );
        for (user_id, _) in incoming {
            if let Some(existing) = StoreState::active_group_of(&after, mutation.run_id, user_id) {
                return Err(MatchingError::ParticipantAlreadyAssigned {
                    user_id: user_id.clone(),
                    group_id: existing,
                });
            }
            if !added.insert(user_id.clone()) {
                return Err(MatchingError::DuplicateMember(user_id.clone()));
            }
        }

        for addition in &mutation.additions {
            let group = working
                .get_mut(&addition.group_id)
                .ok_or(MatchingError::GroupNotFound(addition.group_id))?;
            group.members.push(addition.clone());
        }

        let mut touched: Vec<MatchingGroup> = Vec::new();
        for (_, mut group) in working {
            group.version += 1;
            group.updated_at = mutation.applied_at;
            touched.push(group);
        }

        let mut next_number = state.next_group_number(mutation.run_id);
        for mut group in mutation.new_groups {
            group.group_number = next_number;
            next_number += 1;
            touched.push(group);
        }

        for group in &touched {
            state.groups.insert(group.id, group.clone());
        }
        state.audit.push(mutation.audit);

        touched.sort_by_key(|g| g.group_number);
        Ok(touched)
    }

    async fn supersede_run(
        &self,
        run_id: Uuid,
        superseded_at: DateTime<Utc>,
        audit: MatchingAuditEntry,
    ) -> Result<MatchingRun, MatchingError> {
        let mut state = self.state.write().await;
        state.require_committed(run_id)?;

        let run = state
            .runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or_else(|| MatchingError::RunNotFound(run_id.to_string()))?;
        run.state = RunState::Superseded { superseded_at };
        let run = run.clone();

        state.audit.push(audit);
        Ok(run)
    }

    async fn audit_entries(&self, event_id: &str) -> Result<Vec<MatchingAuditEntry>, MatchingError> {
        let state = self.state.read().await;
        let run_ids: HashSet<Uuid> = state
            .runs
            .iter()
            .filter(|r| r.event_id == event_id)
            .map(|r| r.id)
            .collect();
        Ok(state
            .audit
            .iter()
            .filter(|e| run_ids.contains(&e.run_id))
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> Result<bool, MatchingError> {
        Ok(true)
    }
}

/// Seed data for the in-memory directory
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectorySeed {
    #[serde(default)]
    pub events: Vec<EventSeed>,
    #[serde(default)]
    pub profiles: Vec<PersonalityProfile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSeed {
    pub event_id: String,
    #[serde(default)]
    pub attendees: Vec<PaidAttendee>,
}

#[derive(Debug, Default)]
struct DirectoryState {
    events: HashMap<String, Vec<PaidAttendee>>,
    profiles: HashMap<String, PersonalityProfile>,
}

/// In-process stand-in for the payment and personality subsystems
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    state: RwLock<DirectoryState>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: DirectorySeed) -> Self {
        let state = DirectoryState {
            events: seed
                .events
                .into_iter()
                .map(|e| (e.event_id, e.attendees))
                .collect(),
            profiles: seed
                .profiles
                .into_iter()
                .map(|p| (p.user_id.clone(), p))
                .collect(),
        };
        Self {
            state: RwLock::new(state),
        }
    }

    /// Load a JSON seed file (`{ "events": [...], "profiles": [...] }`)
    pub fn from_seed_file<P: AsRef<Path>>(path: P) -> Result<Self, MatchingError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| MatchingError::Storage(format!("cannot read seed file: {}", e)))?;
        let seed: DirectorySeed = serde_json::from_str(&raw)
            .map_err(|e| MatchingError::Storage(format!("invalid seed file: {}", e)))?;
        Ok(Self::from_seed(seed))
    }

    pub async fn add_event(&self, event_id: &str) {
        let mut state = self.state.write().await;
        state.events.entry(event_id.to_string()).or_default();
    }

    /// Record a paid attendee together with their personality profile
    pub async fn add_participant(&self, event_id: &str, attendee: PaidAttendee, profile: PersonalityProfile) {
        let mut state = self.state.write().await;
        state.profiles.insert(profile.user_id.clone(), profile);
        state
            .events
            .entry(event_id.to_string())
            .or_default()
            .push(attendee);
    }

    pub async fn cancel(&self, event_id: &str, user_id: &str) {
        let mut state = self.state.write().await;
        if let Some(attendees) = state.events.get_mut(event_id) {
            for attendee in attendees.iter_mut().filter(|a| a.user_id == user_id) {
                attendee.cancelled = true;
            }
        }
    }
}

#[async_trait]
impl ParticipantDirectory for InMemoryDirectory {
    async fn event_exists(&self, event_id: &str) -> Result<bool, MatchingError> {
        Ok(self.state.read().await.events.contains_key(event_id))
    }

    async fn paid_attendees(&self, event_id: &str) -> Result<Vec<PaidAttendee>, MatchingError> {
        let state = self.state.read().await;
        state
            .events
            .get(event_id)
            .cloned()
            .ok_or_else(|| MatchingError::EventNotFound(event_id.to_string()))
    }

    async fn profiles(&self, user_ids: &[String]) -> Result<Vec<PersonalityProfile>, MatchingError> {
        let state = self.state.read().await;
        Ok(user_ids
            .iter()
            .filter_map(|id| state.profiles.get(id).cloned())
            .collect())
    }
}
