// Core algorithm exports
pub mod allocator;
pub mod eligibility;
pub mod filters;
pub mod scoring;

pub use allocator::{plan_group_sizes, CompatibilityMatrix, GroupAllocator};
pub use eligibility::build_pool;
pub use filters::{intent_overlap, is_excluded_pair, shared_intents};
pub use scoring::CompatibilityScorer;
