use std::collections::{HashMap, HashSet};

use crate::error::MatchingError;
use crate::models::{PaidAttendee, Participant, PersonalityProfile};

/// Build the ordered candidate pool for an event
///
/// Keeps paid, non-cancelled attendees that are not in `already_grouped`,
/// joins them with their personality profile and orders them by payment time
/// (user id breaks ties). A missing profile or a malformed trait vector fails
/// the whole resolution instead of silently dropping the attendee.
pub fn build_pool(
    event_id: &str,
    attendees: Vec<PaidAttendee>,
    profiles: Vec<PersonalityProfile>,
    already_grouped: &HashSet<String>,
    dimensions: usize,
) -> Result<Vec<Participant>, MatchingError> {
    let mut profiles: HashMap<String, PersonalityProfile> = profiles
        .into_iter()
        .map(|p| (p.user_id.clone(), p))
        .collect();

    let mut attendees: Vec<PaidAttendee> = attendees
        .into_iter()
        .filter(|a| !a.cancelled && !already_grouped.contains(&a.user_id))
        .collect();
    attendees.sort_by(|a, b| {
        a.paid_at
            .cmp(&b.paid_at)
            .then_with(|| a.user_id.cmp(&b.user_id))
            .then_with(|| a.transaction_id.cmp(&b.transaction_id))
    });
    // One seat per user even if the payment feed repeats them; the earliest payment wins
    let mut seen = HashSet::new();
    attendees.retain(|a| seen.insert(a.user_id.clone()));

    let mut pool = Vec::with_capacity(attendees.len());
    for attendee in attendees {
        let profile = profiles.remove(&attendee.user_id).ok_or_else(|| {
            MatchingError::InvalidTraitVector {
                user_id: attendee.user_id.clone(),
                reason: "no personality profile".to_string(),
            }
        })?;
        profile.trait_vector.validate(&attendee.user_id, dimensions)?;

        pool.push(Participant {
            user_id: attendee.user_id,
            event_id: event_id.to_string(),
            transaction_id: attendee.transaction_id,
            paid_at: attendee.paid_at,
            trait_vector: profile.trait_vector,
            gender: profile.gender,
            gender_mix_preference: profile.gender_mix_preference,
            relationship_intent: profile.intent,
        });
    }

    Ok(pool)
}
