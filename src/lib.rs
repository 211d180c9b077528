#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # ipblocker
//!
//! Per-address request throttling for async Rust services.
//!
//! ## Features
//!
//! - **Sliding-window counters** per IP address, backed by a pluggable expiring store
//! - **Block threshold** with an optional graduated delay before it
//! - **CIDR whitelist** (IPv4 and IPv6) exempting trusted networks from counting
//! - **Transition notifications** when an address becomes blocked or its counter expires
//! - **Tower middleware** that rejects blocked callers and delays the ones getting close
//!
//! ## Quick Start
//!
//! ```rust
//! use ipblocker::{BlockRule, IpBlocker};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let rule = BlockRule::builder()
//!         .count(5)
//!         .duration(Duration::from_secs(10))
//!         .delay(2, Duration::from_millis(100))
//!         .allow("10.0.0.0/8")
//!         .build()
//!         .unwrap();
//!
//!     let blocker = IpBlocker::in_memory(rule);
//!     blocker.subscribe(|ip, blocked| async move {
//!         println!("{ip} blocked={blocked}");
//!         Ok(())
//!     });
//!
//!     let decision = blocker.check_address("203.0.113.9").await.unwrap();
//!     assert!(!decision.blocked);
//! }
//! ```

pub mod address;
pub mod delay;
pub mod engine;
pub mod error;
pub mod events;
pub mod loadable;
pub mod middleware;
pub mod prelude;
pub mod rule;
pub mod store;
mod whitelist;

// Re-exports
pub use address::{is_ip_address, parse_address, parse_network, NetworkSpec};
pub use delay::{RecordingSleeper, Sleeper, TokioSleeper};
pub use engine::{BlockResponse, BlockStatus, IpBlocker};
pub use error::{
    AddressError, BlockError, BoxError, LoadError, PolicyError, StoreError, ThrottleError,
};
pub use events::{BlockEvent, EventRecorder, FanOut, SubscriberRegistry, SubscriptionId};
pub use loadable::{LazyValue, Loadable};
pub use middleware::{AddressExtractor, IpBlockLayer, IpBlockService};
pub use rule::{BlockRule, BlockRuleBuilder, DelaySchedule, RuleError};
pub use store::{BlockStore, CounterStore, MemoryCounterStore, StoreAdapter};
pub use whitelist::WhitelistState;
