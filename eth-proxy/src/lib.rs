#![doc = include_str!("../Readme.md")]
#![warn(clippy::all, clippy::pedantic, clippy::cargo, clippy::nursery)]

mod cache;
mod methods;
mod routing;
mod server;
mod statistics;
mod tracking;
mod transforms;
mod utils;

use core::time::Duration;
use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context as _, Result as AnyResult};
use futures::StreamExt;
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use types::{
    jsonrpc::{Error as JsonError, Request, Response, VERSION},
    nats::{Nats, Operation, TypedKv},
    ClientProfile, StateManager,
};

use crate::{
    cache::CachingRouter,
    methods::MethodRegistry,
    routing::{LatestBlockRouter, ProfileView, RouteError, RouteOpts},
    statistics::DISPATCH_LATENCY,
    tracking::CanonicalChain,
    utils::spawn_or_abort,
};

#[derive(Debug, StructOpt)]
pub struct Options {
    #[structopt(flatten)]
    nats: types::nats::Options,

    /// Address to bind the websocket server to.
    #[structopt(long, env = "PROXY_SERVER_ADDRESS", default_value = "0.0.0.0:8080")]
    server_address: SocketAddr,

    /// Ethereum network id.
    #[structopt(long, env = "ETH_NETWORK_ID", default_value = "1")]
    network_id: u64,

    /// Ethereum chain id.
    #[structopt(long, env = "ETH_CHAIN_ID", default_value = "1")]
    chain_id: u64,

    /// Blocks retained behind the head by the chain tracker.
    #[structopt(long, env = "PROXY_MAX_CHAIN_DISTANCE", default_value = "12")]
    max_chain_distance: u64,

    /// Blocks behind the head a client may announce and stay eligible.
    #[structopt(long, env = "PROXY_MAX_DISTANCE_FROM_HEAD", default_value = "3")]
    max_distance_from_head: u64,

    /// Quiescence interval for routing set updates, in milliseconds.
    #[structopt(long, env = "PROXY_ROUTE_DEBOUNCE_MS", default_value = "100")]
    route_debounce_ms: u64,

    /// Response cache time-to-live, in seconds.
    #[structopt(long, env = "PROXY_CACHE_TTL_SECS", default_value = "3600")]
    cache_ttl_secs: u64,

    /// Response cache capacity, in entries.
    #[structopt(long, env = "PROXY_CACHE_CAPACITY", default_value = "10240")]
    cache_capacity: u64,

    /// Downstream request deadline, in seconds.
    #[structopt(long, env = "PROXY_REQUEST_TIMEOUT_SECS", default_value = "10")]
    request_timeout_secs: u64,
}

/// Owns everything a request handler needs: the method table and the
/// per-request deadline. Constructed once and shared.
pub struct App {
    methods:         MethodRegistry,
    request_timeout: Duration,
}

impl App {
    #[must_use]
    pub const fn new(methods: MethodRegistry, request_timeout: Duration) -> Self {
        Self {
            methods,
            request_timeout,
        }
    }

    /// Run one request through the pipeline, bounded by the request
    /// deadline. Always produces a response carrying the request id.
    pub async fn handle(&self, req: Request) -> Response {
        let _timer = DISPATCH_LATENCY.start_timer(); // Observes on drop
        let id = req.id.clone();
        match tokio::time::timeout(self.request_timeout, self.dispatch(req)).await {
            Ok(response) => response,
            Err(_elapsed) => Response::error(id, JsonError::internal_error()),
        }
    }

    async fn dispatch(&self, req: Request) -> Response {
        let method = match self.methods.get(req.method.as_str()) {
            Some(method) => method,
            None => return Response::error(req.id, JsonError::method_not_found()),
        };

        let id = req.id.clone();
        let downstream = match method.apply_before_request(req) {
            Ok(req) => req,
            Err(error) => {
                warn!(%error, "failed to apply request transform");
                return Response::error(
                    id,
                    JsonError::request_failed(format!(
                        "failed to apply request transform: {}",
                        error
                    )),
                );
            }
        };

        let opts = RouteOpts {
            cache:    method.cache(),
            deadline: self.request_timeout,
        };
        match method.router().route(downstream, opts).await {
            Ok(mut response) => {
                // the caller correlates by its own id
                response.id = id;
                response.jsonrpc = VERSION.to_owned();
                response
            }
            Err(RouteError::NoClientsAvailable) => {
                Response::error(id, JsonError::no_client_available())
            }
            Err(error) => {
                error!(%error, "request dispatch failed");
                Response::error(id, JsonError::internal_error())
            }
        }
    }
}

/// Run the proxy until `cancel` fires; every subsystem is bound to a
/// child of that token.
#[allow(clippy::missing_errors_doc)]
pub async fn main(options: Options, cancel: CancellationToken) -> AnyResult<()> {
    let nats = Nats::connect(&options.nats).await?;
    let state = StateManager::new(&nats, options.network_id, options.chain_id).await?;

    // canonical chain tracker fed by the status bucket watch
    let mut chain = CanonicalChain::new(
        options.network_id,
        options.chain_id,
        options.max_chain_distance,
    );
    let head = chain.head_handle();
    let chain_updates = chain.add_listener();
    let status_updates = state
        .statuses
        .watch_all_with_history()
        .await
        .context("failed to create client status watcher")?;
    let tracker = chain.start(status_updates, cancel.child_token());

    // a watch failure is fatal for routing correctness
    spawn_or_abort(async move { tracker.await.context("chain tracker task panicked")? });

    // keep the fleet's connection types fresh for routing preference
    let profiles = ProfileView::default();
    spawn_or_abort(watch_profiles(
        state.profiles.clone(),
        profiles.clone(),
        cancel.child_token(),
    ));

    // routing pipeline: round robin over eligible clients, fronted by
    // the response cache
    let latest = LatestBlockRouter::new(
        Arc::new(nats.rpc_client()),
        options.network_id,
        options.chain_id,
        options.max_distance_from_head,
        Duration::from_millis(options.route_debounce_ms),
        profiles,
        chain_updates,
        cancel.child_token(),
    );
    let caching = Arc::new(CachingRouter::new(
        latest,
        Duration::from_secs(options.cache_ttl_secs),
        options.cache_capacity,
    ));
    let registry = methods::build(options.network_id, &head, caching)?;

    let app = Arc::new(App::new(
        registry,
        Duration::from_secs(options.request_timeout_secs),
    ));

    let mut server = tokio::spawn(server::serve(app, options.server_address, cancel.clone()));

    info!("proxy started, waiting for shutdown signal");
    tokio::select! {
        _ = cancel.cancelled() => {
            // the server drains its connections before returning
            server.await.context("server task panicked")??;
        }
        result = &mut server => {
            cancel.cancel();
            result.context("server task panicked")??;
        }
    }

    Ok(())
}

/// Maintain the client id to connection type view from the profile
/// bucket.
async fn watch_profiles(
    profiles: TypedKv<ClientProfile>,
    view: ProfileView,
    cancel: CancellationToken,
) -> AnyResult<()> {
    let updates = profiles
        .watch_all_with_history()
        .await
        .context("failed to create client profile watcher")?;
    tokio::pin!(updates);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            update = updates.next() => {
                let entry = match update {
                    None => return Ok(()),
                    Some(Err(error)) => return Err(error.context("client profile watch failed")),
                    Some(Ok(entry)) => entry,
                };
                match entry.operation() {
                    Operation::Put => match entry.value() {
                        Ok(profile) => view.insert(entry.key().to_owned(), profile.connection_type),
                        Err(error) => {
                            warn!(%error, key = entry.key(), "failed to decode client profile");
                        }
                    },
                    Operation::Delete | Operation::Purge => view.remove(entry.key()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeSet,
        sync::{Mutex, PoisonError},
    };

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use web3::types::{H256, U256, U64};

    use super::*;
    use crate::{
        routing::Router,
        tracking::{Block, HeadHandle},
    };

    #[derive(Default)]
    struct RecordingRouter {
        last: Mutex<Option<Request>>,
    }

    #[async_trait]
    impl Router for RecordingRouter {
        async fn route(&self, req: Request, _opts: RouteOpts) -> Result<Response, RouteError> {
            *self
                .last
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(req.clone());
            let result = serde_json::value::to_raw_value(&json!("0x99"))
                .map_err(|error| RouteError::Internal(error.to_string()))?;
            // answer under an internal id; the dispatcher must overlay
            // the caller's
            Ok(Response::result(Some(json!(9999)), result))
        }
    }

    fn app_with_head(number: Option<u64>) -> (Arc<RecordingRouter>, App) {
        let head = HeadHandle::default();
        if let Some(number) = number {
            head.store(Some(Arc::new(Block {
                number:           U64::from(number),
                hash:             H256::repeat_byte(1),
                parent_hash:      H256::repeat_byte(0),
                difficulty:       U256::from(1),
                total_difficulty: U256::from(0x100),
                client_ids:       BTreeSet::new(),
            })));
        }
        let router = Arc::new(RecordingRouter::default());
        let registry = methods::build(1, &head, router.clone()).unwrap();
        let app = App::new(registry, Duration::from_secs(1));
        (router, app)
    }

    fn get_balance_request() -> Request {
        serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"method":"eth_getBalance","params":["0xabc","latest"]}"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn dispatch_rewrites_latest_and_preserves_the_request_id() {
        let (router, app) = app_with_head(Some(0x10));

        let response = app.handle(get_balance_request()).await;
        assert_eq!(response.id, Some(json!(1)));
        assert!(response.error.is_none());

        let downstream = router
            .last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap();
        assert_eq!(downstream.params.unwrap().get(), r#"["0xabc","0x10"]"#);
    }

    #[tokio::test]
    async fn missing_head_fails_the_rewrite_with_the_wrapper_code() {
        let (_router, app) = app_with_head(None);

        let response = app.handle(get_balance_request()).await;
        assert_eq!(response.id, Some(json!(1)));
        assert_eq!(response.error.unwrap().code, types::jsonrpc::REQUEST_FAILED);
    }

    #[tokio::test]
    async fn unknown_methods_are_rejected() {
        let (_router, app) = app_with_head(Some(0x10));
        let request = Request::new(Some(json!(6)), "eth_madeUpMethod", None);

        let response = app.handle(request).await;
        assert_eq!(response.id, Some(json!(6)));
        assert_eq!(
            response.error.unwrap().code,
            types::jsonrpc::METHOD_NOT_FOUND
        );
    }
}
