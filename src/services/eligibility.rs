use std::collections::HashSet;
use std::sync::Arc;

use crate::core::build_pool;
use crate::error::MatchingError;
use crate::models::{PaidAttendee, Participant};
use crate::services::repository::{MatchingRepository, ParticipantDirectory};

/// Resolves who may still be seated for an event
#[derive(Clone)]
pub struct EligibilityResolver {
    directory: Arc<dyn ParticipantDirectory>,
    repository: Arc<dyn MatchingRepository>,
    dimensions: usize,
}

impl EligibilityResolver {
    pub fn new(
        directory: Arc<dyn ParticipantDirectory>,
        repository: Arc<dyn MatchingRepository>,
        dimensions: usize,
    ) -> Self {
        Self {
            directory,
            repository,
            dimensions,
        }
    }

    pub async fn ensure_event(&self, event_id: &str) -> Result<(), MatchingError> {
        if self.directory.event_exists(event_id).await? {
            Ok(())
        } else {
            Err(MatchingError::EventNotFound(event_id.to_string()))
        }
    }

    /// Paid, non-cancelled attendees without an active seat in the committed run,
    /// in paid order
    pub async fn resolve(&self, event_id: &str) -> Result<Vec<Participant>, MatchingError> {
        self.ensure_event(event_id).await?;

        let mut seated = HashSet::new();
        if let Some(run) = self.repository.committed_run(event_id).await? {
            for group in self.repository.groups(run.id).await? {
                seated.extend(group.active_member_ids());
            }
        }

        let attendees = self.directory.paid_attendees(event_id).await?;
        let candidate_ids: Vec<String> = attendees
            .iter()
            .filter(|a| !a.cancelled && !seated.contains(&a.user_id))
            .map(|a| a.user_id.clone())
            .collect();
        let profiles = if candidate_ids.is_empty() {
            Vec::new()
        } else {
            self.directory.profiles(&candidate_ids).await?
        };

        let pool = build_pool(event_id, attendees, profiles, &seated, self.dimensions)?;

        tracing::debug!(
            "Resolved {} eligible participants for event {} ({} already seated)",
            pool.len(),
            event_id,
            seated.len()
        );

        Ok(pool)
    }

    /// The attendee record of a paid, non-cancelled user
    pub async fn ensure_paid(&self, event_id: &str, user_id: &str) -> Result<PaidAttendee, MatchingError> {
        self.directory
            .paid_attendees(event_id)
            .await?
            .into_iter()
            .find(|a| a.user_id == user_id && !a.cancelled)
            .ok_or_else(|| MatchingError::ParticipantNotFound(user_id.to_string()))
    }

    /// Check a whole roster against one attendee fetch; the first unpaid user fails it
    pub async fn ensure_all_paid(&self, event_id: &str, user_ids: &[String]) -> Result<(), MatchingError> {
        let paid: HashSet<String> = self
            .directory
            .paid_attendees(event_id)
            .await?
            .into_iter()
            .filter(|a| !a.cancelled)
            .map(|a| a.user_id)
            .collect();

        match user_ids.iter().find(|id| !paid.contains(*id)) {
            Some(missing) => Err(MatchingError::ParticipantNotFound(missing.clone())),
            None => Ok(()),
        }
    }
}
