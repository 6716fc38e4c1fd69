//! Shared state buckets: what a sidecar publishes and the proxy reads.

use anyhow::Result as AnyResult;

use crate::{
    client::{ClientProfile, ClientStatus},
    nats::{Nats, TypedKv},
};

/// Enough history to survey recent head announcements per client.
const STATUS_BUCKET_HISTORY: i64 = 12;

#[must_use]
pub fn status_bucket(network_id: u64, chain_id: u64) -> String {
    format!("eth_{}_{}_client_statuses", network_id, chain_id)
}

#[must_use]
pub fn profile_bucket(network_id: u64, chain_id: u64) -> String {
    format!("eth_{}_{}_client_profiles", network_id, chain_id)
}

/// The per-fleet state stores, scoped to one network and chain.
#[derive(Clone, Debug)]
pub struct StateManager {
    pub statuses: TypedKv<ClientStatus>,
    pub profiles: TypedKv<ClientProfile>,
}

impl StateManager {
    pub async fn new(nats: &Nats, network_id: u64, chain_id: u64) -> AnyResult<Self> {
        let statuses = nats
            .create_key_value(&status_bucket(network_id, chain_id), STATUS_BUCKET_HISTORY)
            .await?;
        let profiles = nats
            .create_key_value(&profile_bucket(network_id, chain_id), 1)
            .await?;
        Ok(Self { statuses, profiles })
    }
}
