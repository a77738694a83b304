use crate::models::{DependsRule, GenderMixPreference, Participant, RelationshipIntent};

/// Check whether two participants must never share a table
///
/// This is the hard-constraint stage of scoring: an excluded pair scores 0
/// and the allocator never places it in the same group. Unknown genders
/// never exclude.
#[inline]
pub fn is_excluded_pair(a: &Participant, b: &Participant, depends_rule: DependsRule) -> bool {
    let genders_differ = match (a.gender, b.gender) {
        (Some(ga), Some(gb)) => ga != gb,
        _ => false,
    };
    if !genders_differ {
        return false;
    }

    rejects_mixed_pair(a, b, depends_rule) || rejects_mixed_pair(b, a, depends_rule)
}

/// Does `who` refuse a mixed-gender pairing with `other`
#[inline]
fn rejects_mixed_pair(who: &Participant, other: &Participant, depends_rule: DependsRule) -> bool {
    match who.gender_mix_preference {
        GenderMixPreference::NoPreference => false,
        GenderMixPreference::PreferSameGender => true,
        GenderMixPreference::Depends => match depends_rule {
            DependsRule::Strict => true,
            DependsRule::Lenient => false,
            DependsRule::SharedIntent => shared_intents(who, other).is_empty(),
        },
    }
}

/// Relationship intents both participants declared
pub fn shared_intents(a: &Participant, b: &Participant) -> Vec<RelationshipIntent> {
    let mut shared: Vec<RelationshipIntent> = a
        .relationship_intent
        .iter()
        .filter(|intent| b.relationship_intent.contains(intent))
        .copied()
        .collect();
    shared.sort_unstable();
    shared.dedup();
    shared
}

/// Jaccard overlap of the two intent sets (0-1)
///
/// Two participants who both left intent empty are treated as fully aligned.
pub fn intent_overlap(a: &Participant, b: &Participant) -> f64 {
    let mut union: Vec<RelationshipIntent> = a
        .relationship_intent
        .iter()
        .chain(b.relationship_intent.iter())
        .copied()
        .collect();
    union.sort_unstable();
    union.dedup();

    if union.is_empty() {
        return 1.0;
    }

    shared_intents(a, b).len() as f64 / union.len() as f64
}
