//! Request routers: round-robin over the clients near the canonical
//! head, plus a static router for constant-answer methods.

use core::time::Duration;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use anyhow::{Error as AnyError, Result as AnyResult};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use types::{
    jsonrpc::{Request, Response},
    nats::RpcClient,
    rpc_subject_prefix, subject_name, ClientId, ConnectionType,
};

use crate::{statistics::ELIGIBLE_CLIENTS, tracking::ChainSnapshot};

/// Options applied per dispatch.
#[derive(Clone, Copy, Debug)]
pub struct RouteOpts {
    /// Cache the response under the request fingerprint.
    pub cache:    bool,
    /// Deadline for the downstream request.
    pub deadline: Duration,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("no clients available")]
    NoClientsAvailable,
    #[error("{0}")]
    Internal(String),
}

impl From<AnyError> for RouteError {
    fn from(error: AnyError) -> Self {
        Self::Internal(format!("{:#}", error))
    }
}

#[async_trait]
pub trait Router: Send + Sync {
    async fn route(&self, req: Request, opts: RouteOpts) -> Result<Response, RouteError>;
}

/// Issues a request to a subject and awaits the correlated reply.
/// Abstracted from [`RpcClient`] so routers can be exercised without a
/// bus connection.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(
        &self,
        subject: String,
        req: &Request,
        deadline: Duration,
    ) -> AnyResult<Response>;
}

#[async_trait]
impl Invoker for RpcClient {
    async fn invoke(
        &self,
        subject: String,
        req: &Request,
        deadline: Duration,
    ) -> AnyResult<Response> {
        Self::invoke(self, subject, req, deadline).await
    }
}

/// Live view of the fleet's connection types, maintained from the
/// profile bucket watch.
#[derive(Clone, Debug, Default)]
pub struct ProfileView(Arc<RwLock<HashMap<ClientId, ConnectionType>>>);

impl ProfileView {
    pub fn insert(&self, client_id: ClientId, connection_type: ConnectionType) {
        self.0
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(client_id, connection_type);
    }

    pub fn remove(&self, client_id: &str) {
        self.0
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(client_id);
    }

    /// Unknown clients count as [`ConnectionType::Direct`].
    #[must_use]
    pub fn connection_type(&self, client_id: &str) -> ConnectionType {
        self.0
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(client_id)
            .copied()
            .unwrap_or_default()
    }
}

/// Routes requests to the clients that announced one of the most
/// recent canonical blocks.
///
/// Chain updates arrive through a watch channel and are applied on a
/// quiescence timer so that bursts of head announcements do not storm
/// the routing set. The eligible set itself is swapped atomically and
/// never mutated in place.
pub struct LatestBlockRouter {
    invoker:        Arc<dyn Invoker>,
    subject_prefix: String,
    client_idx:     AtomicU64,
    client_ids:     ArcSwap<Vec<ClientId>>,
    profiles:       ProfileView,
}

impl LatestBlockRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        invoker: Arc<dyn Invoker>,
        network_id: u64,
        chain_id: u64,
        max_distance_from_head: u64,
        debounce: Duration,
        profiles: ProfileView,
        updates: watch::Receiver<ChainSnapshot>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let router = Arc::new(Self {
            invoker,
            subject_prefix: rpc_subject_prefix(network_id, chain_id),
            client_idx: AtomicU64::new(0),
            client_ids: ArcSwap::from_pointee(Vec::new()),
            profiles,
        });
        tokio::spawn(Self::listen_for_updates(
            router.clone(),
            updates,
            debounce,
            max_distance_from_head,
            cancel,
        ));
        router
    }

    /// Debounce chain updates: apply the latest received snapshot once
    /// no new update has arrived for `debounce`.
    async fn listen_for_updates(
        self: Arc<Self>,
        mut updates: watch::Receiver<ChainSnapshot>,
        debounce: Duration,
        max_distance_from_head: u64,
        cancel: CancellationToken,
    ) {
        let timer = tokio::time::sleep(debounce);
        tokio::pin!(timer);
        let mut pending = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = updates.changed() => {
                    if changed.is_err() {
                        debug!("chain update channel has been closed, no more updates will be processed");
                        return;
                    }
                    pending = true;
                    timer.as_mut().reset(tokio::time::Instant::now() + debounce);
                }
                () = &mut timer, if pending => {
                    let snapshot = updates.borrow_and_update().clone();
                    self.on_update(&snapshot, max_distance_from_head);
                    pending = false;
                }
            }
        }
    }

    fn on_update(&self, snapshot: &ChainSnapshot, max_distance_from_head: u64) {
        let candidates = snapshot.clients_near_head(max_distance_from_head);
        let eligible = preferred_clients(candidates, &self.profiles);
        #[allow(clippy::cast_possible_wrap)]
        ELIGIBLE_CLIENTS.set(eligible.len() as i64);
        debug!(clients = eligible.len(), "processed chain update");
        self.client_ids.store(Arc::new(eligible));
    }

    fn next_subject(&self) -> Result<String, RouteError> {
        let client_ids = self.client_ids.load();
        if client_ids.is_empty() {
            return Err(RouteError::NoClientsAvailable);
        }
        let next_idx = self.client_idx.fetch_add(1, Ordering::Relaxed) % client_ids.len() as u64;
        #[allow(clippy::cast_possible_truncation)]
        let client_id = &client_ids[next_idx as usize];
        Ok(subject_name(&[
            self.subject_prefix.as_str(),
            client_id.as_str(),
        ]))
    }
}

#[async_trait]
impl Router for LatestBlockRouter {
    async fn route(&self, req: Request, opts: RouteOpts) -> Result<Response, RouteError> {
        let subject = self.next_subject()?;
        let response = self.invoker.invoke(subject, &req, opts.deadline).await?;
        Ok(response)
    }
}

/// Group candidates by connection type and keep the most preferred
/// group (variant order on [`ConnectionType`]).
fn preferred_clients(candidates: BTreeSet<ClientId>, profiles: &ProfileView) -> Vec<ClientId> {
    let mut groups: BTreeMap<ConnectionType, Vec<ClientId>> = BTreeMap::new();
    for client_id in candidates {
        let connection_type = profiles.connection_type(&client_id);
        groups.entry(connection_type).or_default().push(client_id);
    }
    groups
        .into_iter()
        .next()
        .map(|(_, clients)| clients)
        .unwrap_or_default()
}

/// Immediately answers with a preconstructed result, overlaying the
/// request id.
pub struct StaticRouter {
    result: Value,
}

impl StaticRouter {
    #[must_use]
    pub const fn new(result: Value) -> Self {
        Self { result }
    }
}

#[async_trait]
impl Router for StaticRouter {
    async fn route(&self, req: Request, _opts: RouteOpts) -> Result<Response, RouteError> {
        let result = serde_json::value::to_raw_value(&self.result)
            .map_err(|error| RouteError::Internal(error.to_string()))?;
        Ok(Response::result(req.id, result))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::time::sleep;

    use super::*;

    pub(crate) struct RecordingInvoker {
        pub subjects: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Invoker for RecordingInvoker {
        async fn invoke(
            &self,
            subject: String,
            req: &Request,
            _deadline: Duration,
        ) -> AnyResult<Response> {
            self.subjects
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(subject);
            let result = serde_json::value::to_raw_value(&json!("0x0"))?;
            Ok(Response::result(req.id.clone(), result))
        }
    }

    fn request() -> Request {
        Request::new(Some(json!(1)), "eth_blockNumber", None)
    }

    const OPTS: RouteOpts = RouteOpts {
        cache:    false,
        deadline: Duration::from_secs(1),
    };

    fn router_with_clients(clients: Vec<&str>) -> (Arc<LatestBlockRouter>, Arc<RecordingInvoker>) {
        let invoker = Arc::new(RecordingInvoker {
            subjects: Mutex::new(vec![]),
        });
        let (_tx, rx) = watch::channel(ChainSnapshot::default());
        let router = LatestBlockRouter::new(
            invoker.clone(),
            1,
            1,
            0,
            Duration::from_millis(10),
            ProfileView::default(),
            rx,
            CancellationToken::new(),
        );
        router
            .client_ids
            .store(Arc::new(clients.into_iter().map(str::to_owned).collect()));
        (router, invoker)
    }

    #[tokio::test]
    async fn empty_set_yields_no_clients_available() {
        let (router, _invoker) = router_with_clients(vec![]);
        let result = router.route(request(), OPTS).await;
        assert_eq!(result.unwrap_err(), RouteError::NoClientsAvailable);
    }

    #[tokio::test]
    async fn round_robin_covers_each_client_evenly() {
        let (router, invoker) = router_with_clients(vec!["a", "b", "c"]);
        for _ in 0..9 {
            router.route(request(), OPTS).await.unwrap();
        }
        let subjects = invoker
            .subjects
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        for client in &["a", "b", "c"] {
            let expected = format!("eth.rpc.1.1.{}", client);
            assert_eq!(subjects.iter().filter(|s| **s == expected).count(), 3);
        }
    }

    fn status_entry(client: &str, number: u64, td: u64) -> types::nats::Entry<types::ClientStatus> {
        use web3::types::{H256, U256, U64};
        let status = types::ClientStatus {
            id:          client.to_owned(),
            head:        Some(types::Head {
                block_number:     U64::from(number),
                #[allow(clippy::cast_possible_truncation)]
                block_hash:       H256::repeat_byte(number as u8),
                #[allow(clippy::cast_possible_truncation)]
                parent_hash:      H256::repeat_byte(number as u8 - 1),
                difficulty:       U256::from(1),
                total_difficulty: U256::from(td),
            }),
            sync_status: None,
        };
        types::nats::Entry::new(
            "eth_1_1_client_statuses".to_owned(),
            client.to_owned(),
            bytes::Bytes::from(serde_json::to_vec(&status).unwrap()),
            1,
            0,
            time::OffsetDateTime::UNIX_EPOCH,
            types::nats::Operation::Put,
        )
    }

    #[tokio::test]
    async fn chain_updates_flow_into_the_routing_set_after_quiescence() {
        use tokio_stream::wrappers::ReceiverStream;

        let mut chain = crate::tracking::CanonicalChain::new(1, 1, 12);
        let listener = chain.add_listener();
        let invoker = Arc::new(RecordingInvoker {
            subjects: Mutex::new(vec![]),
        });
        let router = LatestBlockRouter::new(
            invoker,
            1,
            1,
            0,
            Duration::from_millis(10),
            ProfileView::default(),
            listener,
            CancellationToken::new(),
        );
        assert!(router.client_ids.load().is_empty());

        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let cancel = CancellationToken::new();
        let tracker = chain.start(ReceiverStream::new(rx), cancel.clone());

        tx.send(Ok(status_entry("c1", 0x10, 0x100))).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(
            router.client_ids.load().as_ref(),
            &vec!["c1".to_owned()]
        );

        cancel.cancel();
        tracker.await.unwrap().unwrap();
    }

    #[test]
    fn preference_keeps_only_the_most_preferred_group() {
        let profiles = ProfileView::default();
        profiles.insert("managed".to_owned(), ConnectionType::Managed);
        profiles.insert("direct".to_owned(), ConnectionType::Direct);

        let candidates: BTreeSet<ClientId> = vec![
            "managed".to_owned(),
            "direct".to_owned(),
            "unknown".to_owned(),
        ]
        .into_iter()
        .collect();
        let eligible = preferred_clients(candidates, &profiles);
        assert_eq!(eligible, vec!["direct".to_owned(), "unknown".to_owned()]);
    }

    #[test]
    fn preference_falls_back_to_managed_when_alone() {
        let profiles = ProfileView::default();
        profiles.insert("managed".to_owned(), ConnectionType::Managed);

        let candidates: BTreeSet<ClientId> = vec!["managed".to_owned()].into_iter().collect();
        let eligible = preferred_clients(candidates, &profiles);
        assert_eq!(eligible, vec!["managed".to_owned()]);
    }

    #[tokio::test]
    async fn static_router_overlays_the_request_id() {
        let router = StaticRouter::new(json!(true));
        let response = router.route(request(), OPTS).await.unwrap();
        assert_eq!(response.id, Some(json!(1)));
        assert_eq!(response.result.unwrap().get(), "true");
    }
}
