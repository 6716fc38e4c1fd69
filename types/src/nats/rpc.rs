use core::time::Duration;

use anyhow::{Context as _, Result as AnyResult};
use tokio::time::timeout;

use crate::jsonrpc::{Request, Response};

/// Request/reply client for per-client RPC subjects. Replies are
/// correlated to requests by the transport.
#[derive(Clone)]
pub struct RpcClient {
    client: async_nats::Client,
}

impl RpcClient {
    #[must_use]
    pub const fn new(client: async_nats::Client) -> Self {
        Self { client }
    }

    /// Send `req` to `subject` and await the correlated reply, bounded
    /// by `deadline`.
    pub async fn invoke(
        &self,
        subject: String,
        req: &Request,
        deadline: Duration,
    ) -> AnyResult<Response> {
        let payload = serde_json::to_vec(req).context("failed to encode request to json")?;
        let message = timeout(deadline, self.client.request(subject, payload.into()))
            .await
            .context("rpc request timed out")?
            .context("rpc request failed")?;
        let response = serde_json::from_slice(&message.payload)
            .context("failed to decode response from json")?;
        Ok(response)
    }
}
