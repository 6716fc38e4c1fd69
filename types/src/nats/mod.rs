//! Thin typed layer over NATS: connection handling, typed key/value
//! buckets with watches, request/reply and JetStream publication.

mod kv;
mod publisher;
mod rpc;

use anyhow::{Context as _, Result as AnyResult};
use async_nats::jetstream::{self, kv::Config as KvConfig};
use serde::{de::DeserializeOwned, Serialize};
use structopt::StructOpt;
use tracing::info;
use url::Url;

pub use self::{
    kv::{DecodeError, Entry, TypedKv},
    publisher::Publisher,
    rpc::RpcClient,
};
pub use async_nats::jetstream::kv::Operation;
pub use async_nats::jetstream::stream::Config as StreamConfig;

#[derive(Clone, Debug, StructOpt, PartialEq)]
pub struct Options {
    /// NATS server url.
    #[structopt(long, env = "NATS_URL", default_value = "ns://127.0.0.1:4222")]
    pub nats_url: Url,
}

#[derive(Clone)]
pub struct Nats {
    client:    async_nats::Client,
    jetstream: jetstream::Context,
}

impl Nats {
    pub async fn connect(options: &Options) -> AnyResult<Self> {
        let url = normalize_url(&options.nats_url);
        info!("Connecting to NATS at {}", url);

        let client = async_nats::connect(url.as_str())
            .await
            .with_context(|| format!("Error connecting to NATS {}", url))?;
        let jetstream = jetstream::new(client.clone());

        Ok(Self { client, jetstream })
    }

    #[must_use]
    pub fn client(&self) -> async_nats::Client {
        self.client.clone()
    }

    #[must_use]
    pub fn jetstream(&self) -> jetstream::Context {
        self.jetstream.clone()
    }

    #[must_use]
    pub fn rpc_client(&self) -> RpcClient {
        RpcClient::new(self.client.clone())
    }

    /// Create (or reuse) a KV bucket and return a typed store over it.
    pub async fn create_key_value<T>(&self, bucket: &str, history: i64) -> AnyResult<TypedKv<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
    {
        let store = self
            .jetstream
            .create_key_value(KvConfig {
                bucket: bucket.to_owned(),
                history,
                ..KvConfig::default()
            })
            .await
            .with_context(|| format!("Error creating kv store with bucket = {}", bucket))?;
        Ok(TypedKv::new(store))
    }
}

/// `ns://` urls are accepted for compatibility with existing deployment
/// configs; async-nats only speaks `nats://`.
fn normalize_url(url: &Url) -> String {
    url.as_str().replacen("ns://", "nats://", 1)
}
