//! Rate limiting logic and state management.

mod backend;
mod identifier;
mod limiter;
mod policy;
mod reporter;
mod store;
mod sweeper;
mod tiered;

pub use backend::{BackendFactory, BackendKind, BackendRegistry};
pub use identifier::{ClientIdentifier, RequestDescriptor, DEFAULT_AGENT_PREFIX_LEN, UNKNOWN};
pub use limiter::{now_millis, Decision, RateLimiter};
pub use policy::{default_policies, KeyFn, Policy, PolicyConfig, TimeUnit};
pub use reporter::{TracingSink, ViolationRecord, ViolationReporter, ViolationSink};
pub use store::{CounterEntry, CounterStore, MemoryCounterStore};
pub use sweeper::{Sweeper, SweeperHandle, DEFAULT_SWEEP_INTERVAL};
pub use tiered::{default_tiers, Tier, TieredRateLimiter};
