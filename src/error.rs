//! Error types for the blocker engine and its middleware
use std::fmt;
use std::net::IpAddr;

/// Boxed error used at the store and subscriber seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The supplied text is not a valid IP address or network.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// Not an IPv4 or IPv6 address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),
    /// Not a CIDR network (or bare address) usable in a whitelist.
    #[error("invalid IP network: {0}")]
    InvalidNetwork(String),
}

/// An administrative action was refused by the rule.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// Whitelisted addresses can never be blocked.
    #[error("address {0} is whitelisted and cannot be blocked")]
    Whitelisted(IpAddr),
}

/// Failure reported by the backing counter store.
#[derive(thiserror::Error, Debug)]
#[error("counter store error: {0}")]
pub struct StoreError(#[source] pub BoxError);

impl StoreError {
    /// Wrap any store-specific error.
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Box::new(err))
    }
}

/// Failure while resolving a lazily supplied rule or store.
#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    /// The pending computation failed.
    #[error("deferred value failed to load: {0}")]
    Failed(#[source] BoxError),
    /// A previous attempt consumed the source and failed; nothing is left to resolve.
    #[error("deferred value was consumed by an earlier failed load")]
    Consumed,
}

/// Unified error for every [`IpBlocker`](crate::IpBlocker) operation.
#[derive(thiserror::Error, Debug)]
pub enum BlockError {
    /// Malformed address or whitelist entry.
    #[error(transparent)]
    Address(#[from] AddressError),
    /// Operation refused by the rule.
    #[error(transparent)]
    Policy(#[from] PolicyError),
    /// The counter store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The rule or store could not be resolved.
    #[error(transparent)]
    Load(#[from] LoadError),
}

impl BlockError {
    /// Check if this error is due to address syntax
    pub fn is_address(&self) -> bool {
        matches!(self, Self::Address(_))
    }
    /// Check if this error is a policy refusal
    pub fn is_policy(&self) -> bool {
        matches!(self, Self::Policy(_))
    }
    /// Check if this error came from the store
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

/// Errors produced by [`IpBlockService`](crate::middleware::IpBlockService).
#[derive(Debug)]
pub enum ThrottleError<E> {
    /// The caller's address is currently blocked.
    Blocked { address: IpAddr, count: u64 },
    /// The request carried no client address.
    MissingAddress,
    /// The blocker itself failed (bad address, store failure).
    Check(BlockError),
    /// The wrapped service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ThrottleError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocked { address, count } => {
                write!(f, "address {} is blocked ({} requests in window)", address, count)
            }
            Self::MissingAddress => write!(f, "request has no client address"),
            Self::Check(e) => write!(f, "address check failed: {}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ThrottleError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Check(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> ThrottleError<E> {
    /// Check if the caller was rejected as blocked
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
    /// Check if the request carried no address
    pub fn is_missing_address(&self) -> bool {
        matches!(self, Self::MissingAddress)
    }
    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }
    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Borrow the engine error if present.
    pub fn as_check(&self) -> Option<&BlockError> {
        match self {
            Self::Check(e) => Some(e),
            _ => None,
        }
    }
    /// Access the blocked address and its count.
    pub fn blocked_details(&self) -> Option<(IpAddr, u64)> {
        match self {
            Self::Blocked { address, count } => Some((*address, *count)),
            _ => None,
        }
    }
}
