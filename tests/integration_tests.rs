// Integration tests for the matching engine over the in-memory store

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use table_match::core::CompatibilityScorer;
use table_match::models::{
    AssignUserRequest, AssignedBy, AuditAction, BulkAssignRequest, CreateGroupRequest,
    GroupSizePolicy, MatchingAuditEntry, MatchingGroup, MatchingRun, MoveUserRequest, PaidAttendee, PersonalityProfile,
    RelationshipIntent, RemoveUserRequest, RunState, TraitVector,
};
use table_match::services::{
    CacheManager, ChatProvisioner, CommitBatch, EligibilityResolver, EngineContext, InMemoryDirectory,
    GroupMutation, InMemoryMatchingStore, ManualOverrideService, MatchingCoordinator, MatchingRepository,
    ParticipantDirectory, ProvisionRequest, ProvisioningDispatcher, ProvisioningError, RetryPolicy,
};
use table_match::MatchingError;

const EVENT: &str = "evt-1";
const ADMIN: &str = "admin-1";

fn paid_at(i: usize) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 19, 0, 0).unwrap() + Duration::minutes(i as i64)
}

fn attendee(i: usize) -> PaidAttendee {
    PaidAttendee {
        user_id: format!("user-{:02}", i),
        transaction_id: format!("tx-{:02}", i),
        paid_at: paid_at(i),
        cancelled: false,
    }
}

fn profile(i: usize) -> PersonalityProfile {
    PersonalityProfile {
        user_id: format!("user-{:02}", i),
        trait_vector: TraitVector::new(
            (0..5)
                .map(|d| 0.1 + ((i * 3 + d * 7) % 10) as f64 / 10.0)
                .collect(),
        ),
        gender: None,
        gender_mix_preference: Default::default(),
        intent: vec![if i % 2 == 0 {
            RelationshipIntent::Friendship
        } else {
            RelationshipIntent::Networking
        }],
    }
}

async fn add_participants(directory: &InMemoryDirectory, range: std::ops::Range<usize>) {
    for i in range {
        directory.add_participant(EVENT, attendee(i), profile(i)).await;
    }
}

/// Records every sync request it receives
#[derive(Default)]
struct RecordingProvisioner {
    requests: Mutex<Vec<ProvisionRequest>>,
}

#[async_trait]
impl ChatProvisioner for RecordingProvisioner {
    async fn sync_group(&self, request: &ProvisionRequest) -> Result<(), ProvisioningError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(())
    }
}

/// Directory whose attendee query takes a while, to hold the event lock
struct SlowDirectory {
    inner: Arc<InMemoryDirectory>,
    delay: std::time::Duration,
}

#[async_trait]
impl ParticipantDirectory for SlowDirectory {
    async fn event_exists(&self, event_id: &str) -> Result<bool, MatchingError> {
        self.inner.event_exists(event_id).await
    }

    async fn paid_attendees(&self, event_id: &str) -> Result<Vec<PaidAttendee>, MatchingError> {
        tokio::time::sleep(self.delay).await;
        self.inner.paid_attendees(event_id).await
    }

    async fn profiles(&self, user_ids: &[String]) -> Result<Vec<PersonalityProfile>, MatchingError> {
        self.inner.profiles(user_ids).await
    }
}

/// Directory that counts attendee queries
struct CountingDirectory {
    inner: Arc<InMemoryDirectory>,
    attendee_queries: AtomicUsize,
}

#[async_trait]
impl ParticipantDirectory for CountingDirectory {
    async fn event_exists(&self, event_id: &str) -> Result<bool, MatchingError> {
        self.inner.event_exists(event_id).await
    }

    async fn paid_attendees(&self, event_id: &str) -> Result<Vec<PaidAttendee>, MatchingError> {
        self.attendee_queries.fetch_add(1, Ordering::SeqCst);
        self.inner.paid_attendees(event_id).await
    }

    async fn profiles(&self, user_ids: &[String]) -> Result<Vec<PersonalityProfile>, MatchingError> {
        self.inner.profiles(user_ids).await
    }
}

struct Harness {
    directory: Arc<InMemoryDirectory>,
    store: Arc<InMemoryMatchingStore>,
    provisioner: Arc<RecordingProvisioner>,
    coordinator: MatchingCoordinator,
    overrides: ManualOverrideService,
}

/// Store whose group reads stall once anything has been committed
struct SlowAfterCommit {
    inner: Arc<InMemoryMatchingStore>,
    committed: AtomicBool,
    delay: std::time::Duration,
}

#[async_trait]
impl MatchingRepository for SlowAfterCommit {
    async fn committed_run(&self, event_id: &str) -> Result<Option<MatchingRun>, MatchingError> {
        self.inner.committed_run(event_id).await
    }

    async fn runs(&self, event_id: &str) -> Result<Vec<MatchingRun>, MatchingError> {
        self.inner.runs(event_id).await
    }

    async fn groups(&self, run_id: uuid::Uuid) -> Result<Vec<MatchingGroup>, MatchingError> {
        if self.committed.load(Ordering::SeqCst) {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.groups(run_id).await
    }

    async fn commit_groups(&self, batch: CommitBatch) -> Result<Vec<MatchingGroup>, MatchingError> {
        let stored = self.inner.commit_groups(batch).await?;
        self.committed.store(true, Ordering::SeqCst);
        Ok(stored)
    }

    async fn apply_mutation(&self, mutation: GroupMutation) -> Result<Vec<MatchingGroup>, MatchingError> {
        self.inner.apply_mutation(mutation).await
    }

    async fn supersede_run(
        &self,
        run_id: uuid::Uuid,
        superseded_at: DateTime<Utc>,
        audit: MatchingAuditEntry,
    ) -> Result<MatchingRun, MatchingError> {
        self.inner.supersede_run(run_id, superseded_at, audit).await
    }

    async fn audit_entries(&self, event_id: &str) -> Result<Vec<MatchingAuditEntry>, MatchingError> {
        self.inner.audit_entries(event_id).await
    }

    async fn health_check(&self) -> Result<bool, MatchingError> {
        self.inner.health_check().await
    }
}

fn build(
    directory: Arc<InMemoryDirectory>,
    view: Arc<dyn ParticipantDirectory>,
    policy: GroupSizePolicy,
    timeout: std::time::Duration,
) -> Harness {
    let store = Arc::new(InMemoryMatchingStore::new());
    let repository: Arc<dyn MatchingRepository> = store.clone();
    assemble(directory, view, store, repository, policy, timeout)
}

fn assemble(
    directory: Arc<InMemoryDirectory>,
    view: Arc<dyn ParticipantDirectory>,
    store: Arc<InMemoryMatchingStore>,
    repository: Arc<dyn MatchingRepository>,
    policy: GroupSizePolicy,
    timeout: std::time::Duration,
) -> Harness {
    let provisioner = Arc::new(RecordingProvisioner::default());
    let scorer = CompatibilityScorer::with_default_weights();

    let ctx = EngineContext {
        repository: Arc::clone(&repository),
        resolver: EligibilityResolver::new(view, repository, scorer.dimensions()),
        policy,
        provisioning: ProvisioningDispatcher::new(provisioner.clone(), RetryPolicy::new(1, 1, 1)),
        operation_timeout: timeout,
    };

    Harness {
        directory,
        store,
        provisioner,
        coordinator: MatchingCoordinator::new(ctx.clone(), scorer, Arc::new(CacheManager::in_memory(100, 60))),
        overrides: ManualOverrideService::new(ctx),
    }
}

async fn wait_for_requests(provisioner: &RecordingProvisioner, count: usize) {
    for _ in 0..100 {
        if provisioner.requests.lock().unwrap().len() >= count {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

async fn harness(participants: usize) -> Harness {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.add_event(EVENT).await;
    add_participants(&directory, 0..participants).await;
    build(
        directory.clone(),
        directory,
        GroupSizePolicy::default(),
        std::time::Duration::from_secs(5),
    )
}

fn active_ids(groups: &[MatchingGroup]) -> Vec<String> {
    let mut ids: Vec<String> = groups.iter().flat_map(|g| g.active_member_ids()).collect();
    ids.sort();
    ids
}

async fn committed_groups(h: &Harness) -> Vec<MatchingGroup> {
    h.coordinator.results(EVENT).await.unwrap().1
}

fn assert_invariants(groups: &[MatchingGroup]) {
    let mut seen = HashMap::new();
    for group in groups {
        let count = group.active_count();
        assert!(
            count >= group.min_size && count <= group.max_size,
            "group {} has {} active members outside [{}, {}]",
            group.group_number,
            count,
            group.min_size,
            group.max_size
        );
        for user_id in group.active_member_ids() {
            if let Some(other) = seen.insert(user_id.clone(), group.id) {
                panic!("{} is active in {} and {}", user_id, other, group.id);
            }
        }
    }
}

#[tokio::test]
async fn test_preview_covers_every_participant_once() {
    for n in [0usize, 1, 3, 4, 7, 10, 13, 19, 26] {
        let h = harness(n).await;
        let snapshot = h.coordinator.preview_matching(EVENT, ADMIN).await.unwrap();

        let mut covered: Vec<String> = snapshot
            .allocation
            .groups
            .iter()
            .flat_map(|g| g.member_ids.clone())
            .chain(snapshot.allocation.unassignable.clone())
            .collect();
        covered.sort();

        let expected: Vec<String> = (0..n).map(|i| format!("user-{:02}", i)).collect();
        assert_eq!(covered, expected, "pool of {}", n);
        assert_eq!(snapshot.eligible_count, n);
    }
}

#[tokio::test]
async fn test_preview_is_deterministic() {
    let h = harness(17).await;

    let first = h.coordinator.preview_matching(EVENT, ADMIN).await.unwrap();
    let second = h.coordinator.preview_matching(EVENT, ADMIN).await.unwrap();

    assert_ne!(first.run.id, second.run.id);
    assert_eq!(first.allocation, second.allocation);
    assert!(matches!(first.run.state, RunState::Preview { .. }));
}

#[tokio::test]
async fn test_preview_has_no_side_effects() {
    let h = harness(10).await;

    let snapshot = h.coordinator.preview_matching(EVENT, ADMIN).await.unwrap();
    assert_eq!(snapshot.allocation.groups.len(), 2);

    assert_eq!(h.store.member_row_count().await, 0);
    assert!(h.store.committed_run(EVENT).await.unwrap().is_none());
    assert!(h.store.runs(EVENT).await.unwrap().is_empty());

    // Still retrievable for inspection
    let fetched = h.coordinator.get_preview(EVENT, snapshot.run.id).await.unwrap();
    assert_eq!(fetched, snapshot);
}

#[tokio::test]
async fn test_scenario_a_ten_participants_form_two_groups_of_five() {
    let h = harness(10).await;

    let outcome = h.coordinator.trigger_matching(EVENT, ADMIN).await.unwrap();

    assert!(outcome.created);
    assert!(outcome.run.is_committed());
    assert_eq!(outcome.groups.len(), 2);
    assert!(outcome.groups.iter().all(|g| g.active_count() == 5));
    assert!(outcome.unassignable.is_empty());
    assert_eq!(
        outcome.groups.iter().map(|g| g.group_number).collect::<Vec<_>>(),
        vec![1, 2]
    );
    assert!(outcome
        .groups
        .iter()
        .flat_map(|g| g.members.iter())
        .all(|m| m.assigned_by == AssignedBy::Auto));
}

#[tokio::test]
async fn test_scenario_b_seven_participants_leave_one_unassignable() {
    let h = harness(7).await;

    let outcome = h.coordinator.trigger_matching(EVENT, ADMIN).await.unwrap();

    assert_eq!(outcome.groups.len(), 1);
    assert_eq!(outcome.groups[0].active_count(), 6);
    assert_eq!(outcome.unassignable.len(), 1);

    let mut all = active_ids(&outcome.groups);
    all.extend(outcome.unassignable.clone());
    all.sort();
    assert_eq!(all.len(), 7);
    all.dedup();
    assert_eq!(all.len(), 7);
}

#[tokio::test]
async fn test_trigger_is_idempotent() {
    let h = harness(10).await;

    let first = h.coordinator.trigger_matching(EVENT, ADMIN).await.unwrap();
    let second = h.coordinator.trigger_matching(EVENT, ADMIN).await.unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.run.id, second.run.id);
    assert_eq!(first.groups, second.groups);
    assert!(second.new_group_ids.is_empty());
    assert_eq!(h.store.runs(EVENT).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_trigger_only_adds_groups_for_new_participants() {
    let h = harness(10).await;
    let first = h.coordinator.trigger_matching(EVENT, ADMIN).await.unwrap();

    add_participants(&h.directory, 10..15).await;
    let second = h.coordinator.trigger_matching(EVENT, ADMIN).await.unwrap();

    assert!(second.created);
    assert_eq!(second.run.id, first.run.id);
    assert_eq!(second.new_group_ids.len(), 1);
    assert_eq!(second.groups.len(), 3);

    // Earlier groups are untouched
    for old in &first.groups {
        let now = second.groups.iter().find(|g| g.id == old.id).unwrap();
        assert_eq!(now, old);
    }

    let added = second
        .groups
        .iter()
        .find(|g| g.id == second.new_group_ids[0])
        .unwrap();
    assert_eq!(added.group_number, 3);
    let mut ids = added.active_member_ids();
    ids.sort();
    assert_eq!(ids, (10..15).map(|i| format!("user-{:02}", i)).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_trigger_errors() {
    let h = harness(0).await;

    let err = h.coordinator.trigger_matching(EVENT, ADMIN).await.unwrap_err();
    assert!(matches!(err, MatchingError::NoEligibleParticipants(ref e) if e == EVENT));

    let err = h.coordinator.trigger_matching("nope", ADMIN).await.unwrap_err();
    assert!(matches!(err, MatchingError::EventNotFound(_)));
}

#[tokio::test]
async fn test_invalid_trait_vector_fails_fast() {
    let h = harness(4).await;
    h.directory
        .add_participant(
            EVENT,
            attendee(4),
            PersonalityProfile {
                trait_vector: TraitVector::new(vec![0.5, f64::NAN, 0.5, 0.5, 0.5]),
                ..profile(4)
            },
        )
        .await;

    let err = h.coordinator.preview_matching(EVENT, ADMIN).await.unwrap_err();
    assert!(matches!(err, MatchingError::InvalidTraitVector { ref user_id, .. } if user_id == "user-04"));
}

#[tokio::test]
async fn test_cancelled_attendees_are_not_eligible() {
    let h = harness(10).await;
    h.directory.cancel(EVENT, "user-03").await;

    let snapshot = h.coordinator.preview_matching(EVENT, ADMIN).await.unwrap();

    assert_eq!(snapshot.eligible_count, 9);
    assert!(snapshot
        .allocation
        .groups
        .iter()
        .all(|g| !g.member_ids.contains(&"user-03".to_string())));
}

#[tokio::test]
async fn test_scenario_c_move_into_full_group_keeps_user() {
    let h = harness(10).await;
    let outcome = h.coordinator.trigger_matching(EVENT, ADMIN).await.unwrap();
    let (a, b) = (outcome.groups[0].clone(), outcome.groups[1].clone());

    // Shift one member so that A sits at min (4) and B at max (6)
    let first_mover = a.active_member_ids()[0].clone();
    h.overrides
        .move_user_between_groups(
            EVENT,
            ADMIN,
            &MoveUserRequest {
                user_id: first_mover,
                from_group_id: a.id,
                to_group_id: b.id,
                expected_from_version: Some(a.version),
                expected_to_version: Some(b.version),
            },
        )
        .await
        .unwrap();

    let groups = committed_groups(&h).await;
    let a_now = groups.iter().find(|g| g.id == a.id).unwrap().clone();
    let b_now = groups.iter().find(|g| g.id == b.id).unwrap().clone();
    assert_eq!(a_now.active_count(), 4);
    assert_eq!(b_now.active_count(), 6);

    let stuck = a_now.active_member_ids()[0].clone();
    let err = h
        .overrides
        .move_user_between_groups(
            EVENT,
            ADMIN,
            &MoveUserRequest {
                user_id: stuck.clone(),
                from_group_id: a.id,
                to_group_id: b.id,
                expected_from_version: None,
                expected_to_version: None,
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, MatchingError::GroupCapacityExceeded { group_id, max_size: 6 } if group_id == b.id));

    let after = committed_groups(&h).await;
    let a_after = after.iter().find(|g| g.id == a.id).unwrap();
    assert!(a_after.has_active_member(&stuck));
    assert_eq!(a_after, &a_now);
    assert_eq!(after.iter().find(|g| g.id == b.id).unwrap(), &b_now);
}

#[tokio::test]
async fn test_assign_into_full_group_fails_and_leaves_it_unchanged() {
    let h = harness(12).await;
    let outcome = h.coordinator.trigger_matching(EVENT, ADMIN).await.unwrap();
    let full = outcome.groups[0].clone();
    assert_eq!(full.active_count(), 6);

    add_participants(&h.directory, 12..13).await;
    let err = h
        .overrides
        .assign_user_to_group(
            EVENT,
            ADMIN,
            &AssignUserRequest {
                user_id: "user-12".to_string(),
                group_id: full.id,
                expected_version: None,
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, MatchingError::GroupCapacityExceeded { .. }));
    let groups = committed_groups(&h).await;
    assert_eq!(groups.iter().find(|g| g.id == full.id).unwrap(), &full);
}

#[tokio::test]
async fn test_assign_rules() {
    let h = harness(10).await;
    let outcome = h.coordinator.trigger_matching(EVENT, ADMIN).await.unwrap();
    let (a, b) = (outcome.groups[0].clone(), outcome.groups[1].clone());
    add_participants(&h.directory, 10..11).await;

    // Already seated elsewhere
    let seated = b.active_member_ids()[0].clone();
    let err = h
        .overrides
        .assign_user_to_group(
            EVENT,
            ADMIN,
            &AssignUserRequest {
                user_id: seated.clone(),
                group_id: a.id,
                expected_version: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MatchingError::ParticipantAlreadyAssigned { ref user_id, group_id } if *user_id == seated && group_id == b.id
    ));

    // Not a paid attendee
    let err = h
        .overrides
        .assign_user_to_group(
            EVENT,
            ADMIN,
            &AssignUserRequest {
                user_id: "stranger".to_string(),
                group_id: a.id,
                expected_version: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MatchingError::ParticipantNotFound(_)));

    // Stale version
    let err = h
        .overrides
        .assign_user_to_group(
            EVENT,
            ADMIN,
            &AssignUserRequest {
                user_id: "user-10".to_string(),
                group_id: a.id,
                expected_version: Some(a.version + 7),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MatchingError::ConcurrentModification { .. }));

    // Happy path bumps the version and marks the seat MANUAL
    let touched = h
        .overrides
        .assign_user_to_group(
            EVENT,
            ADMIN,
            &AssignUserRequest {
                user_id: "user-10".to_string(),
                group_id: a.id,
                expected_version: Some(a.version),
            },
        )
        .await
        .unwrap();
    assert_eq!(touched.len(), 1);
    assert_eq!(touched[0].version, a.version + 1);
    assert_eq!(touched[0].active_count(), 6);
    let seat = touched[0]
        .active_members()
        .find(|m| m.user_id == "user-10")
        .unwrap();
    assert_eq!(seat.assigned_by, AssignedBy::Manual);

    // The old version is now stale
    let err = h
        .overrides
        .remove_user_from_group(
            EVENT,
            ADMIN,
            &RemoveUserRequest {
                user_id: "user-10".to_string(),
                group_id: a.id,
                expected_version: Some(a.version),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MatchingError::ConcurrentModification { expected, actual, .. } if actual == expected + 1));
}

#[tokio::test]
async fn test_remove_marks_row_and_respects_minimum() {
    let h = harness(10).await;
    let outcome = h.coordinator.trigger_matching(EVENT, ADMIN).await.unwrap();
    let a = outcome.groups[0].clone();
    let rows_before = h.store.member_row_count().await;

    let leaving = a.active_member_ids()[0].clone();
    let touched = h
        .overrides
        .remove_user_from_group(
            EVENT,
            ADMIN,
            &RemoveUserRequest {
                user_id: leaving.clone(),
                group_id: a.id,
                expected_version: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(touched[0].active_count(), 4);
    assert_eq!(h.store.member_row_count().await, rows_before);
    let row = touched[0].members.iter().find(|m| m.user_id == leaving).unwrap();
    assert!(row.removed_at.is_some());

    // The removed participant is eligible again
    let snapshot = h.coordinator.preview_matching(EVENT, ADMIN).await.unwrap();
    assert_eq!(snapshot.eligible_count, 1);
    assert_eq!(snapshot.allocation.unassignable, vec![leaving]);

    // A group at its minimum cannot shrink further
    let next = touched[0].active_member_ids()[0].clone();
    let err = h
        .overrides
        .remove_user_from_group(
            EVENT,
            ADMIN,
            &RemoveUserRequest {
                user_id: next,
                group_id: a.id,
                expected_version: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MatchingError::InvalidGroupSize(_)));
}

#[tokio::test]
async fn test_create_manual_group() {
    let h = harness(10).await;
    let outcome = h.coordinator.trigger_matching(EVENT, ADMIN).await.unwrap();
    add_participants(&h.directory, 10..13).await;

    let err = h
        .overrides
        .create_manual_group(
            EVENT,
            ADMIN,
            &CreateGroupRequest {
                member_ids: vec!["user-10".to_string(), "user-10".to_string()],
                min_size: Some(2),
                max_size: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MatchingError::DuplicateMember(ref u) if u == "user-10"));

    let seated = outcome.groups[0].active_member_ids()[0].clone();
    let err = h
        .overrides
        .create_manual_group(
            EVENT,
            ADMIN,
            &CreateGroupRequest {
                member_ids: vec!["user-10".to_string(), seated],
                min_size: Some(2),
                max_size: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MatchingError::ParticipantAlreadyAssigned { .. }));

    // Three members are below the default minimum of four
    let err = h
        .overrides
        .create_manual_group(
            EVENT,
            ADMIN,
            &CreateGroupRequest {
                member_ids: vec!["user-10".to_string(), "user-11".to_string(), "user-12".to_string()],
                min_size: None,
                max_size: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MatchingError::InvalidGroupSize(_)));

    let created = h
        .overrides
        .create_manual_group(
            EVENT,
            ADMIN,
            &CreateGroupRequest {
                member_ids: vec!["user-10".to_string(), "user-11".to_string(), "user-12".to_string()],
                min_size: Some(3),
                max_size: Some(5),
            },
        )
        .await
        .unwrap();

    assert_eq!(created.len(), 1);
    let group = &created[0];
    assert_eq!(group.group_number, 3);
    assert_eq!(group.origin, AssignedBy::Manual);
    assert_eq!((group.min_size, group.max_size), (3, 5));
    assert_eq!(group.active_count(), 3);

    assert_invariants(&committed_groups(&h).await);
}

#[tokio::test]
async fn test_bulk_assign_reports_each_item() {
    let h = harness(10).await;
    let outcome = h.coordinator.trigger_matching(EVENT, ADMIN).await.unwrap();
    let (a, b) = (outcome.groups[0].clone(), outcome.groups[1].clone());
    add_participants(&h.directory, 10..13).await;

    let assign = |user: &str, group: &MatchingGroup| AssignUserRequest {
        user_id: user.to_string(),
        group_id: group.id,
        expected_version: None,
    };
    let response = h
        .overrides
        .bulk_assign_users(
            EVENT,
            ADMIN,
            &BulkAssignRequest {
                assignments: vec![
                    assign("user-10", &a),
                    assign("user-11", &a),
                    assign("user-12", &b),
                    assign("ghost", &b),
                ],
            },
        )
        .await;

    assert_eq!(response.succeeded, 2);
    assert_eq!(response.failed, 2);
    let outcomes: Vec<(usize, bool)> = response.results.iter().map(|r| (r.index, r.success)).collect();
    assert_eq!(outcomes, vec![(0, true), (1, false), (2, true), (3, false)]);

    let full = response.results[1].error.as_ref().unwrap();
    assert_eq!(full.error, "GroupCapacityExceeded");
    assert_eq!(full.status_code, 409);
    assert_eq!(response.results[3].error.as_ref().unwrap().error, "ParticipantNotFound");
    assert_eq!(response.results[2].group.as_ref().unwrap().member_ids.len(), 6);

    assert_invariants(&committed_groups(&h).await);
}

#[tokio::test]
async fn test_overrides_preserve_invariants_and_write_audit_trail() {
    let h = harness(15).await;
    let outcome = h.coordinator.trigger_matching(EVENT, ADMIN).await.unwrap();
    assert_eq!(outcome.groups.len(), 3);
    let (a, b, c) = (
        outcome.groups[0].clone(),
        outcome.groups[1].clone(),
        outcome.groups[2].clone(),
    );

    h.overrides
        .move_user_between_groups(
            EVENT,
            "admin-2",
            &MoveUserRequest {
                user_id: a.active_member_ids()[0].clone(),
                from_group_id: a.id,
                to_group_id: c.id,
                expected_from_version: None,
                expected_to_version: None,
            },
        )
        .await
        .unwrap();
    h.overrides
        .remove_user_from_group(
            EVENT,
            "admin-2",
            &RemoveUserRequest {
                user_id: b.active_member_ids()[0].clone(),
                group_id: b.id,
                expected_version: None,
            },
        )
        .await
        .unwrap();
    // Rejected edits leave no audit entry
    let _ = h
        .overrides
        .move_user_between_groups(
            EVENT,
            "admin-2",
            &MoveUserRequest {
                user_id: b.active_member_ids()[1].clone(),
                from_group_id: b.id,
                to_group_id: c.id,
                expected_from_version: None,
                expected_to_version: None,
            },
        )
        .await
        .unwrap_err();

    assert_invariants(&committed_groups(&h).await);

    let (runs, audit) = h.coordinator.history(EVENT).await.unwrap();
    assert_eq!(runs.len(), 1);
    let actions: Vec<AuditAction> = audit.iter().map(|e| e.action).collect();
    assert_eq!(actions, vec![AuditAction::MoveUser, AuditAction::RemoveUser]);
    assert!(audit.iter().all(|e| e.actor_id == "admin-2" && e.run_id == outcome.run.id));

    let moved = &audit[0];
    assert_eq!(moved.before_state["from"]["memberIds"].as_array().unwrap().len(), 5);
    assert_eq!(moved.after_state["from"]["memberIds"].as_array().unwrap().len(), 4);
    assert_eq!(moved.after_state["to"]["memberIds"].as_array().unwrap().len(), 6);
}

#[tokio::test]
async fn test_scenario_d_concurrent_triggers() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.add_event(EVENT).await;
    add_participants(&directory, 0..10).await;
    let slow = Arc::new(SlowDirectory {
        inner: directory.clone(),
        delay: std::time::Duration::from_millis(200),
    });
    let h = build(directory, slow, GroupSizePolicy::default(), std::time::Duration::from_secs(5));

    let (first, second) = tokio::join!(
        h.coordinator.trigger_matching(EVENT, "admin-a"),
        h.coordinator.trigger_matching(EVENT, "admin-b"),
    );

    let results = [first, second];
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let busy = results
        .iter()
        .filter(|r| matches!(r, Err(MatchingError::MatchingAlreadyInProgress(e)) if e == EVENT))
        .count();
    assert_eq!((ok, busy), (1, 1));

    // The lock is released afterwards
    let again = h.coordinator.trigger_matching(EVENT, ADMIN).await.unwrap();
    assert!(!again.created);
}

#[tokio::test]
async fn test_slow_operation_times_out_without_partial_state() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.add_event(EVENT).await;
    add_participants(&directory, 0..10).await;
    let slow = Arc::new(SlowDirectory {
        inner: directory.clone(),
        delay: std::time::Duration::from_millis(300),
    });
    let h = build(directory, slow, GroupSizePolicy::default(), std::time::Duration::from_millis(50));

    let err = h.coordinator.trigger_matching(EVENT, ADMIN).await.unwrap_err();

    assert!(matches!(err, MatchingError::Timeout(_)));
    assert!(h.store.committed_run(EVENT).await.unwrap().is_none());
    assert_eq!(h.store.member_row_count().await, 0);
}

#[tokio::test]
async fn test_invalidate_then_retrigger_starts_fresh() {
    let h = harness(10).await;
    let first = h.coordinator.trigger_matching(EVENT, ADMIN).await.unwrap();

    let retired = h.coordinator.invalidate_run(EVENT, ADMIN).await.unwrap();
    assert_eq!(retired.id, first.run.id);
    assert!(matches!(retired.state, RunState::Superseded { .. }));

    let err = h.coordinator.results(EVENT).await.unwrap_err();
    assert!(matches!(err, MatchingError::RunNotFound(_)));

    let second = h.coordinator.trigger_matching(EVENT, ADMIN).await.unwrap();
    assert_ne!(second.run.id, first.run.id);
    assert_eq!(active_ids(&second.groups).len(), 10);

    let (runs, audit) = h.coordinator.history(EVENT).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, AuditAction::InvalidateRun);
}

#[tokio::test]
async fn test_commit_and_overrides_schedule_provisioning() {
    let h = harness(10).await;
    let outcome = h.coordinator.trigger_matching(EVENT, ADMIN).await.unwrap();

    wait_for_requests(&h.provisioner, 2).await;
    {
        let requests = h.provisioner.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.event_id == EVENT && r.member_user_ids.len() == 5));
    }

    let (a, b) = (&outcome.groups[0], &outcome.groups[1]);
    h.overrides
        .move_user_between_groups(
            EVENT,
            ADMIN,
            &MoveUserRequest {
                user_id: a.active_member_ids()[0].clone(),
                from_group_id: a.id,
                to_group_id: b.id,
                expected_from_version: None,
                expected_to_version: None,
            },
        )
        .await
        .unwrap();

    wait_for_requests(&h.provisioner, 4).await;
    let requests = h.provisioner.requests.lock().unwrap();
    let mut sizes: Vec<usize> = requests[2..].iter().map(|r| r.member_user_ids.len()).collect();
    sizes.sort();
    assert_eq!(sizes, vec![4, 6]);
}

#[tokio::test]
async fn test_trigger_result_does_not_depend_on_reads_after_commit() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.add_event(EVENT).await;
    add_participants(&directory, 0..10).await;

    let store = Arc::new(InMemoryMatchingStore::new());
    let repository: Arc<dyn MatchingRepository> = Arc::new(SlowAfterCommit {
        inner: store.clone(),
        committed: AtomicBool::new(false),
        delay: std::time::Duration::from_millis(300),
    });
    let h = assemble(
        directory.clone(),
        directory,
        store,
        repository,
        GroupSizePolicy::default(),
        std::time::Duration::from_millis(100),
    );

    let outcome = h.coordinator.trigger_matching(EVENT, ADMIN).await.unwrap();
    assert!(outcome.created);
    assert_eq!(outcome.groups.len(), 2);
    assert_eq!(outcome.new_group_ids.len(), 2);
    assert_invariants(&outcome.groups);
    assert_eq!(active_ids(&outcome.groups).len(), 10);

    wait_for_requests(&h.provisioner, 2).await;
    let requests = h.provisioner.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    let mut provisioned: Vec<uuid::Uuid> = requests.iter().map(|r| r.group_id).collect();
    let mut created = outcome.new_group_ids.clone();
    provisioned.sort();
    created.sort();
    assert_eq!(provisioned, created);
}

#[tokio::test]
async fn test_racing_assigns_to_one_group_version_admit_one() {
    let h = harness(10).await;
    let outcome = h.coordinator.trigger_matching(EVENT, ADMIN).await.unwrap();
    let target = outcome.groups[0].clone();
    add_participants(&h.directory, 10..12).await;

    let request = |i: usize| AssignUserRequest {
        user_id: attendee(i).user_id,
        group_id: target.id,
        expected_version: Some(target.version),
    };
    let (first, second) = (request(10), request(11));

    let (a, b) = tokio::join!(
        h.overrides.assign_user_to_group(EVENT, ADMIN, &first),
        h.overrides.assign_user_to_group(EVENT, "admin-2", &second),
    );

    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let err = results.into_iter().find_map(|r| r.err()).unwrap();
    assert!(
        matches!(err, MatchingError::ConcurrentModification { group_id, .. } if group_id == target.id),
        "unexpected error: {:?}",
        err
    );

    let groups = committed_groups(&h).await;
    let stored = groups.iter().find(|g| g.id == target.id).unwrap();
    assert_eq!(stored.active_count(), target.active_count() + 1);
    assert_eq!(stored.version, target.version + 1);
    assert_invariants(&groups);
    assert_eq!(active_ids(&groups).len(), 11);
}

#[tokio::test]
async fn test_manual_group_checks_roster_with_one_attendee_query() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.add_event(EVENT).await;
    add_participants(&directory, 0..10).await;
    let counting = Arc::new(CountingDirectory {
        inner: directory.clone(),
        attendee_queries: AtomicUsize::new(0),
    });
    let h = build(directory, counting.clone(), GroupSizePolicy::default(), std::time::Duration::from_secs(5));
    h.coordinator.trigger_matching(EVENT, ADMIN).await.unwrap();
    add_participants(&h.directory, 10..15).await;

    let before = counting.attendee_queries.load(Ordering::SeqCst);

    let members: Vec<String> = (10..15).map(|i| attendee(i).user_id).collect();
    let groups = h
        .overrides
        .create_manual_group(
            EVENT,
            ADMIN,
            &CreateGroupRequest {
                member_ids: members.clone(),
                min_size: None,
                max_size: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(counting.attendee_queries.load(Ordering::SeqCst) - before, 1);
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].active_member_ids(), members);

    let err = h
        .overrides
        .create_manual_group(
            EVENT,
            ADMIN,
            &CreateGroupRequest {
                member_ids: vec!["user-00".to_string(), "stranger".to_string(), "user-01".to_string(), "user-02".to_string()],
                min_size: None,
                max_size: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MatchingError::ParticipantNotFound(ref u) if u == "stranger"));
}
