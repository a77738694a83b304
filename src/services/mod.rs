// Service exports
pub mod cache;
pub mod coordinator;
pub mod eligibility;
pub mod locks;
pub mod memory;
pub mod overrides;
pub mod postgres;
pub mod provisioner;
pub mod repository;

pub use cache::{CacheError, CacheKey, CacheManager};
pub use coordinator::{EngineContext, MatchingCoordinator, TriggerOutcome};
pub use eligibility::EligibilityResolver;
pub use locks::{EventLockGuard, EventLocks};
pub use memory::{DirectorySeed, EventSeed, InMemoryDirectory, InMemoryMatchingStore};
pub use overrides::ManualOverrideService;
pub use postgres::{PostgresClient, PostgresError};
pub use provisioner::{
    ChatProvisioner, HttpChatProvisioner, LoggingProvisioner, ProvisionRequest,
    ProvisioningDispatcher, ProvisioningError, RetryPolicy,
};
pub use repository::{CommitBatch, GroupMutation, MatchingRepository, MemberRemoval, ParticipantDirectory};
