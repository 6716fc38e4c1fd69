//! One session against one upstream Ethereum node: profile and status
//! publication, newHeads fan-out and the per-client RPC responder.

use core::time::Duration;

use anyhow::{anyhow, bail, Context as _, Result as AnyResult};
use futures::StreamExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use types::{
    jsonrpc::{Error as JsonError, Request, Response},
    nats::{Nats, Publisher, StreamConfig},
    new_heads_stream_name, new_heads_stream_subjects, new_heads_subject, rpc_subject,
    ClientProfile, ClientStatus, ClientVersion, ConnectionType, Head, NodeInfo, StateManager,
    SyncStatus,
};
use web3::{
    transports::WebSocket,
    types::{Block, BlockHeader, BlockId, BlockNumber, SyncState, H256},
    Transport as _, Web3,
};

use crate::{
    statistics::{
        BLOCK_FETCH_LATENCY, CONNECTION_ATTEMPTS, HEADS_PUBLISHED, RPC_FAILURES, RPC_REQUESTS,
    },
    Options,
};

/// Timeout on individual upstream interrogation calls.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-subject retention on the newHeads stream.
const NEW_HEADS_RETENTION: i64 = 128;

pub struct Session {
    web3:        Web3<WebSocket>,
    nats:        Nats,
    state:       StateManager,
    profile:     ClientProfile,
    status:      ClientStatus,
    publisher:   Publisher<BlockHeader>,
    rpc_subject: String,
}

impl Session {
    /// Connect upstream, interrogate the node, and publish its profile
    /// and initial status.
    pub async fn connect(nats: &Nats, options: &Options) -> AnyResult<Self> {
        CONNECTION_ATTEMPTS.inc();
        let transport = WebSocket::new(options.web3_url.as_str())
            .await
            .with_context(|| format!("Connecting to Ethereum at {:?}", options.web3_url))?;
        let web3 = Web3::new(transport);

        let profile = build_profile(&web3, options).await?;
        info!(
            id = %profile.id,
            client_version = %profile.client_version,
            network_id = profile.network_id,
            chain_id = profile.chain_id,
            "connected to upstream node"
        );

        let state = StateManager::new(nats, profile.network_id, profile.chain_id).await?;
        state
            .profiles
            .put(&profile.id, &profile)
            .await
            .context("failed to put client profile")?;

        let status = build_initial_status(&web3, &profile).await?;
        state
            .statuses
            .put(&status.id, &status)
            .await
            .context("failed to put initial client status")?;

        let publisher = new_heads_publisher(nats, &profile).await?;
        let rpc_subject = rpc_subject(profile.network_id, profile.chain_id, &profile.id);

        Ok(Self {
            web3,
            nats: nats.clone(),
            state,
            profile,
            status,
            publisher,
            rpc_subject,
        })
    }

    /// Serve RPC requests and publish head updates until the upstream
    /// subscription ends or `cancel` fires. The status entry is deleted
    /// on the way out; its deletion is the proxy's liveness signal.
    pub async fn run(mut self, cancel: CancellationToken) -> AnyResult<()> {
        let mut heads = self
            .web3
            .eth_subscribe()
            .subscribe_new_heads()
            .await
            .context("failed to subscribe to new heads")?;
        let mut requests = self
            .nats
            .client()
            .subscribe(self.rpc_subject.clone())
            .await
            .map_err(|error| anyhow!("failed to subscribe to {}: {}", self.rpc_subject, error))?;

        info!(subject = %self.rpc_subject, "serving rpc requests");

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                head = heads.next() => {
                    match head {
                        None => break Err(anyhow!("newHeads subscription closed")),
                        Some(Err(error)) => {
                            break Err(anyhow!("newHeads subscription failed: {}", error));
                        }
                        Some(Ok(header)) => {
                            if let Err(error) = self.on_new_head(&header).await {
                                error!(?error, "failed to process new head");
                            }
                        }
                    }
                }
                request = requests.next() => {
                    match request {
                        None => break Err(anyhow!("rpc subscription closed")),
                        Some(message) => self.on_rpc_request(message).await,
                    }
                }
            }
        };

        debug!("stopping client session");
        if let Err(error) = self.state.statuses.delete(&self.profile.id).await {
            warn!(?error, "failed to remove client status from kv store");
        }
        let _ = requests.unsubscribe().await;

        result
    }

    async fn on_new_head(&mut self, header: &BlockHeader) -> AnyResult<()> {
        let hash = header.hash.ok_or_else(|| anyhow!("header hash missing"))?;
        let number = header.number.ok_or_else(|| anyhow!("header number missing"))?;
        debug!(%number, ?hash, "received header");

        // fan the raw notification out to stream consumers, deduplicated
        // across restarts by a stable message id
        let message_id = head_message_id(&self.profile.client_version, &hash);
        self.publisher.publish_with_id(header, message_id).await?;
        HEADS_PUBLISHED.inc();

        // the notification itself has no total difficulty; fetch the
        // block, which does
        let block = fetch_block(&self.web3, hash).await?;
        let head = block_to_head(&block)?;

        let update = ClientStatus {
            id:          self.profile.id.clone(),
            head:        Some(head),
            sync_status: None,
        };
        let merged = self.status.merge(&update);
        self.state
            .statuses
            .put(&merged.id, &merged)
            .await
            .context("failed to put client status")?;
        self.status = merged;
        Ok(())
    }

    async fn on_rpc_request(&self, message: async_nats::Message) {
        RPC_REQUESTS.inc();
        let reply = match message.reply {
            Some(reply) => reply,
            None => {
                debug!("dropping rpc request without reply subject");
                return;
            }
        };
        let response = self.execute(&message.payload).await;
        let bytes = match serde_json::to_vec(&response) {
            Ok(bytes) => bytes,
            Err(error) => {
                error!(?error, "failed to encode rpc response");
                return;
            }
        };
        if let Err(error) = self.nats.client().publish(reply, bytes.into()).await {
            RPC_FAILURES.inc();
            error!(?error, "failed to publish rpc reply");
        }
    }

    /// Translate one JSON-RPC payload to the upstream node and return
    /// its reply, echoing the caller's request id.
    async fn execute(&self, payload: &[u8]) -> Response {
        let request: Request = match serde_json::from_slice(payload) {
            Err(_) => return Response::error(None, JsonError::parse_error()),
            Ok(request) => request,
        };
        let id = request.id.clone();
        let params = match request.params_array() {
            Err(_) => return Response::error(id, JsonError::invalid_params()),
            Ok(params) => params,
        };
        match self.web3.transport().execute(&request.method, params).await {
            Ok(result) => match serde_json::value::to_raw_value(&result) {
                Ok(raw) => Response::result(id, raw),
                Err(error) => {
                    error!(?error, "failed to encode upstream result");
                    Response::error(id, JsonError::internal_error())
                }
            },
            Err(web3::Error::Rpc(upstream)) => Response::error(
                id,
                JsonError {
                    code:    upstream.code.code(),
                    message: upstream.message,
                    data:    upstream.data,
                },
            ),
            Err(error) => {
                debug!(?error, method = %request.method, "upstream call failed");
                Response::error(id, JsonError::internal_error())
            }
        }
    }
}

async fn build_profile(web3: &Web3<WebSocket>, options: &Options) -> AnyResult<ClientProfile> {
    let version = timeout(UPSTREAM_TIMEOUT, web3.web3().client_version())
        .await
        .context("timed out retrieving client version")?
        .context("failed to retrieve client version")?;
    let client_version = ClientVersion::parse(&version)?;

    let network_id = timeout(UPSTREAM_TIMEOUT, web3.net().version())
        .await
        .context("timed out retrieving network version")?
        .context("failed to retrieve network version")?
        .parse::<u64>()
        .context("failed to parse network version")?;

    let chain_id = timeout(UPSTREAM_TIMEOUT, web3.eth().chain_id())
        .await
        .context("timed out retrieving chain id")?
        .context("failed to retrieve chain id")?
        .as_u64();

    // managed nodes do not expose the admin namespace
    let node_info = match options.connection_type {
        ConnectionType::Managed => None,
        ConnectionType::Direct => match fetch_node_info(web3).await {
            Ok(info) => Some(info),
            Err(error) => {
                warn!(?error, "admin_nodeInfo unavailable");
                None
            }
        },
    };

    let id = match (&options.client_id, &node_info) {
        (Some(id), _) => id.clone(),
        (None, Some(info)) => info.id.clone(),
        (None, None) => bail!("could not determine a client id, configure one explicitly"),
    };

    Ok(ClientProfile {
        id,
        connection_type: options.connection_type,
        network_id,
        chain_id,
        client_version,
        node_info,
    })
}

async fn fetch_node_info(web3: &Web3<WebSocket>) -> AnyResult<NodeInfo> {
    let value = timeout(
        UPSTREAM_TIMEOUT,
        web3.transport().execute("admin_nodeInfo", vec![]),
    )
    .await
    .context("timed out retrieving node info")?
    .context("failed to retrieve node info")?;
    let node_info = serde_json::from_value(value).context("failed to decode node info")?;
    Ok(node_info)
}

async fn build_initial_status(
    web3: &Web3<WebSocket>,
    profile: &ClientProfile,
) -> AnyResult<ClientStatus> {
    let sync_state = timeout(UPSTREAM_TIMEOUT, web3.eth().syncing())
        .await
        .context("timed out retrieving sync status")?
        .context("failed to retrieve sync status")?;
    let sync_status = SyncStatus {
        syncing: !matches!(sync_state, SyncState::NotSyncing),
    };

    let latest = fetch_latest_block(web3).await?;
    let head = block_to_head(&latest)?;

    Ok(ClientStatus {
        id:          profile.id.clone(),
        head:        Some(head),
        sync_status: Some(sync_status),
    })
}

async fn fetch_latest_block(web3: &Web3<WebSocket>) -> AnyResult<Block<H256>> {
    let _timer = BLOCK_FETCH_LATENCY.start_timer(); // Observes on drop
    let request = web3.eth().block(BlockId::Number(BlockNumber::Latest));
    timeout(UPSTREAM_TIMEOUT, request)
        .await
        .context("timed out fetching latest block")?
        .context("failed to fetch latest block")?
        .ok_or_else(|| anyhow!("no latest block"))
}

async fn fetch_block(web3: &Web3<WebSocket>, hash: H256) -> AnyResult<Block<H256>> {
    let _timer = BLOCK_FETCH_LATENCY.start_timer(); // Observes on drop
    let request = web3.eth().block(BlockId::Hash(hash));
    timeout(UPSTREAM_TIMEOUT, request)
        .await
        .context("timed out fetching block")?
        .context("failed to fetch block")?
        .ok_or_else(|| anyhow!("block {:?} not found", hash))
}

fn block_to_head(block: &Block<H256>) -> AnyResult<Head> {
    Ok(Head {
        block_number:     block.number.ok_or_else(|| anyhow!("block number missing"))?,
        block_hash:       block.hash.ok_or_else(|| anyhow!("block hash missing"))?,
        parent_hash:      block.parent_hash,
        difficulty:       block.difficulty,
        total_difficulty: block
            .total_difficulty
            .ok_or_else(|| anyhow!("block total difficulty missing"))?,
    })
}

/// `<name>:<version>:<hash[2..10]>`, stable across sessions so the
/// stream deduplicates replays of the same head.
fn head_message_id(client_version: &ClientVersion, hash: &H256) -> String {
    let hex = format!("{:x}", hash);
    format!(
        "{}:{}:{}",
        client_version.name,
        client_version.version,
        &hex[..8]
    )
}

async fn new_heads_publisher(
    nats: &Nats,
    profile: &ClientProfile,
) -> AnyResult<Publisher<BlockHeader>> {
    let subject = new_heads_subject(
        profile.network_id,
        profile.chain_id,
        &profile.client_version.name,
        &profile.client_version.version,
        &profile.id,
    );
    let config = StreamConfig {
        name: new_heads_stream_name(profile.network_id, profile.chain_id),
        description: Some(format!(
            "ETH newHeads for networkId {} and chainId {}",
            profile.network_id, profile.chain_id
        )),
        subjects: new_heads_stream_subjects(profile.network_id, profile.chain_id),
        max_messages_per_subject: NEW_HEADS_RETENTION,
        ..StreamConfig::default()
    };
    Publisher::new(nats.jetstream(), subject, config).await
}
