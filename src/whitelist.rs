//! Lazily parsed whitelist cache.
//!
//! The cache starts [`WhitelistState::Unresolved`] and moves exactly once to either
//! [`WhitelistState::Disabled`] (rule has no whitelist) or [`WhitelistState::Networks`]. After
//! that the rule is never consulted again for whitelist purposes. Reads are lock-free through
//! `ArcSwap`.

use crate::error::AddressError;
use crate::rule::BlockRule;
use arc_swap::ArcSwap;
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::Arc;

/// Tri-state cache value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhitelistState {
    /// Not computed yet.
    Unresolved,
    /// Computed: the rule has no whitelist.
    Disabled,
    /// Computed: parsed networks, in rule order.
    Networks(Vec<IpNet>),
}

impl WhitelistState {
    /// OR across networks; first match wins.
    pub fn contains(&self, address: &IpAddr) -> bool {
        match self {
            WhitelistState::Networks(networks) => networks.iter().any(|net| net.contains(address)),
            WhitelistState::Unresolved | WhitelistState::Disabled => false,
        }
    }
}

#[derive(Debug)]
pub(crate) struct WhitelistCache {
    state: ArcSwap<WhitelistState>,
}

impl WhitelistCache {
    pub(crate) fn new() -> Self {
        Self { state: ArcSwap::from_pointee(WhitelistState::Unresolved) }
    }

    /// Current state, resolving from `rule` on first use.
    ///
    /// A malformed entry fails the call and leaves the cache unresolved.
    pub(crate) fn resolve(&self, rule: &BlockRule) -> Result<Arc<WhitelistState>, AddressError> {
        let current = self.state.load_full();
        if *current != WhitelistState::Unresolved {
            return Ok(current);
        }
        let resolved = match rule.white_list() {
            None => WhitelistState::Disabled,
            Some(specs) => WhitelistState::Networks(
                specs.iter().map(|spec| spec.to_net()).collect::<Result<Vec<_>, _>>()?,
            ),
        };
        let resolved = Arc::new(resolved);
        self.state.store(resolved.clone());
        Ok(resolved)
    }

    pub(crate) fn contains(&self, rule: &BlockRule, address: &IpAddr) -> Result<bool, AddressError> {
        Ok(self.resolve(rule)?.contains(address))
    }

    pub(crate) fn snapshot(&self) -> Arc<WhitelistState> {
        self.state.load_full()
    }
}
