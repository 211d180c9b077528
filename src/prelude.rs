//! Convenient re-exports for common ipblocker types.
pub use crate::{
    engine::{BlockResponse, BlockStatus, IpBlocker},
    error::{BlockError, ThrottleError},
    events::{BlockEvent, EventRecorder, SubscriptionId},
    loadable::Loadable,
    middleware::IpBlockLayer,
    rule::{BlockRule, RuleError},
    store::{BlockStore, CounterStore, MemoryCounterStore, StoreAdapter},
};
