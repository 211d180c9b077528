//! Tower middleware that throttles requests by client address.
//!
//! ```rust,no_run
//! use ipblocker::middleware::IpBlockLayer;
//! use ipblocker::{BlockRule, IpBlocker};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tower::{service_fn, ServiceBuilder};
//!
//! struct Request {
//!     peer: String,
//! }
//!
//! let blocker = Arc::new(IpBlocker::in_memory(BlockRule::new(100, Duration::from_secs(60)).unwrap()));
//! let svc = ServiceBuilder::new()
//!     .layer(IpBlockLayer::new(blocker, |req: &Request| Some(req.peer.clone())))
//!     .service(service_fn(|_req: Request| async { Ok::<_, std::convert::Infallible>("ok") }));
//! ```

use crate::address::parse_address;
use crate::delay::{Sleeper, TokioSleeper};
use crate::engine::IpBlocker;
use crate::error::ThrottleError;
use crate::store::BlockStore;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Pulls the client address out of a request.
pub trait AddressExtractor<Req>: Send + Sync + 'static {
    fn extract(&self, request: &Req) -> Option<String>;
}

impl<Req, F> AddressExtractor<Req> for F
where
    F: Fn(&Req) -> Option<String> + Send + Sync + 'static,
{
    fn extract(&self, request: &Req) -> Option<String> {
        self(request)
    }
}

/// Layer that checks every request's address against an [`IpBlocker`].
pub struct IpBlockLayer<D, X> {
    blocker: Arc<IpBlocker<D>>,
    extractor: Arc<X>,
    sleeper: Arc<dyn Sleeper>,
}

impl<D, X> IpBlockLayer<D, X> {
    /// Sleep through delays on the Tokio timer.
    pub fn new(blocker: Arc<IpBlocker<D>>, extractor: X) -> Self {
        Self { blocker, extractor: Arc::new(extractor), sleeper: Arc::new(TokioSleeper) }
    }

    /// Replace how delays are waited out.
    pub fn with_sleeper<T: Sleeper + 'static>(mut self, sleeper: T) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }
}

impl<D, X> Clone for IpBlockLayer<D, X> {
    fn clone(&self) -> Self {
        Self {
            blocker: self.blocker.clone(),
            extractor: self.extractor.clone(),
            sleeper: self.sleeper.clone(),
        }
    }
}

impl<D, X> std::fmt::Debug for IpBlockLayer<D, X> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpBlockLayer").field("sleeper", &self.sleeper).finish()
    }
}

impl<S, D, X> Layer<S> for IpBlockLayer<D, X> {
    type Service = IpBlockService<S, D, X>;

    fn layer(&self, service: S) -> Self::Service {
        IpBlockService {
            inner: service,
            blocker: self.blocker.clone(),
            extractor: self.extractor.clone(),
            sleeper: self.sleeper.clone(),
        }
    }
}

/// Rejects blocked callers, delays the ones approaching the threshold, forwards the rest.
pub struct IpBlockService<S, D, X> {
    inner: S,
    blocker: Arc<IpBlocker<D>>,
    extractor: Arc<X>,
    sleeper: Arc<dyn Sleeper>,
}

impl<S: Clone, D, X> Clone for IpBlockService<S, D, X> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            blocker: self.blocker.clone(),
            extractor: self.extractor.clone(),
            sleeper: self.sleeper.clone(),
        }
    }
}

impl<S: std::fmt::Debug, D, X> std::fmt::Debug for IpBlockService<S, D, X> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpBlockService").field("inner", &self.inner).finish()
    }
}

impl<S, D, X, Req> Service<Req> for IpBlockService<S, D, X>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    D: BlockStore,
    X: AddressExtractor<Req>,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = ThrottleError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ThrottleError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let raw = self.extractor.extract(&req);
        let blocker = self.blocker.clone();
        let sleeper = self.sleeper.clone();
        // Keep the instance that was polled ready.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let raw = raw.ok_or(ThrottleError::MissingAddress)?;
            let address = parse_address(&raw).map_err(|e| ThrottleError::Check(e.into()))?;
            let decision = blocker.check_ip(address).await.map_err(ThrottleError::Check)?;
            if decision.blocked {
                return Err(ThrottleError::Blocked { address, count: decision.count });
            }
            if !decision.delay.is_zero() {
                sleeper.sleep(decision.delay).await;
            }
            inner.call(req).await.map_err(ThrottleError::Inner)
        })
    }
}
