//! Table Match - group matching engine for in-person social events
//!
//! Seats paid, personality-profiled attendees at small tables that maximize
//! compatibility within size bounds, and lets admins override the result
//! without breaking the one-seat-per-participant invariant.

pub mod config;
pub mod core;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;

// Re-export commonly used types
pub use crate::core::{CompatibilityScorer, GroupAllocator};
pub use error::MatchingError;
pub use models::{Allocation, GroupSizePolicy, Participant, ScoringWeights};
pub use services::{ManualOverrideService, MatchingCoordinator};
