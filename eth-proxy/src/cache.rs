//! Response cache wrapped around a router.

use core::time::Duration;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use moka::future::Cache;
use tracing::debug;
use types::jsonrpc::{Request, Response};

use crate::{
    routing::{RouteError, RouteOpts, Router},
    statistics::{CACHE_HITS, CACHE_MISSES},
};

/// Caches responses under a `method + params` fingerprint with a hard
/// TTL and bounded capacity. Population is single-flight: concurrent
/// callers sharing a key wait on one downstream dispatch.
///
/// Keys assume params were already canonicalized by the request
/// transforms; rewriting `"latest"` to the concrete head number before
/// keying is what keeps keys identical across callers.
pub struct CachingRouter {
    inner: Arc<dyn Router>,
    cache: Cache<String, Response>,
}

impl CachingRouter {
    #[must_use]
    pub fn new(inner: Arc<dyn Router>, ttl: Duration, capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();
        Self { inner, cache }
    }
}

/// `method + "_" + normalized(params)`. Params are re-marshalled so
/// that formatting differences cannot fragment the cache.
fn cache_key(req: &Request) -> Result<String, RouteError> {
    let params = req
        .params_array()
        .map_err(|error| RouteError::Internal(error.to_string()))?;
    let params = serde_json::to_string(&params)
        .map_err(|error| RouteError::Internal(error.to_string()))?;
    Ok(format!("{}_{}", req.method, params))
}

#[async_trait]
impl Router for CachingRouter {
    async fn route(&self, req: Request, opts: RouteOpts) -> Result<Response, RouteError> {
        if !opts.cache {
            return self.inner.route(req, opts).await;
        }

        let key = match cache_key(&req) {
            Ok(key) => key,
            Err(error) => {
                // never fail a request because of caching
                debug!(%error, "failed to derive cache key, dispatching directly");
                return self.inner.route(req, opts).await;
            }
        };

        let dispatched = Arc::new(AtomicBool::new(false));
        let entry = self
            .cache
            .try_get_with(key, {
                let inner = self.inner.clone();
                let dispatched = dispatched.clone();
                async move {
                    dispatched.store(true, Ordering::Relaxed);
                    inner.route(req, opts).await
                }
            })
            .await;
        if dispatched.load(Ordering::Relaxed) {
            CACHE_MISSES.inc();
        } else {
            CACHE_HITS.inc();
        }

        entry.map_err(|error: Arc<RouteError>| (*error).clone())
    }
}
