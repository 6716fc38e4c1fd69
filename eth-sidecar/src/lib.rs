#![doc = include_str!("../Readme.md")]
#![warn(clippy::all, clippy::pedantic, clippy::cargo, clippy::nursery)]

mod session;
mod statistics;

use core::time::Duration;

use anyhow::{bail, Result as AnyResult};
use structopt::StructOpt;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use types::{nats::Nats, ConnectionType};
use url::Url;

use crate::session::Session;

/// Delay before the first reconnect attempt.
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on the reconnect backoff.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, StructOpt)]
pub struct Options {
    #[structopt(flatten)]
    nats: types::nats::Options,

    /// Websocket url for connecting to an eth client.
    #[structopt(long, env = "WEB3_URL", default_value = "ws://127.0.0.1:8546")]
    web3_url: Url,

    /// How the upstream node is reached.
    #[structopt(
        long,
        env = "WEB3_CONNECTION_TYPE",
        default_value = "Direct",
        possible_values = &["Direct", "Managed"]
    )]
    connection_type: ConnectionType,

    /// Stable client id. Required for managed connections, where
    /// admin_nodeInfo is unavailable.
    #[structopt(long, env = "WEB3_CLIENT_ID")]
    client_id: Option<String>,
}

impl Options {
    fn validate(&self) -> AnyResult<()> {
        if !matches!(self.web3_url.scheme(), "ws" | "wss") {
            bail!(
                "Unsupported ethereum transport {}. Use ws or wss.",
                self.web3_url.scheme()
            );
        }
        if self.connection_type == ConnectionType::Managed && self.client_id.is_none() {
            bail!("a client id is required for managed connections");
        }
        Ok(())
    }
}

const fn next_delay(delay: Duration) -> Duration {
    let doubled = delay.saturating_mul(2);
    if doubled.as_secs() > MAX_RETRY_DELAY.as_secs() {
        MAX_RETRY_DELAY
    } else {
        doubled
    }
}

/// Keep a client session alive until `cancel` fires, reconnecting with
/// exponential backoff.
#[allow(clippy::missing_errors_doc)]
pub async fn main(options: Options, cancel: CancellationToken) -> AnyResult<()> {
    options.validate()?;

    let nats = Nats::connect(&options.nats).await?;

    let mut retry_delay = INITIAL_RETRY_DELAY;
    while !cancel.is_cancelled() {
        match Session::connect(&nats, &options).await {
            Ok(session) => {
                retry_delay = INITIAL_RETRY_DELAY;
                if let Err(error) = session.run(cancel.child_token()).await {
                    error!(?error, "client session failed");
                }
            }
            Err(error) => error!(?error, "client session connect failed"),
        }
        if cancel.is_cancelled() {
            break;
        }

        info!(delay = ?retry_delay, "reconnecting to upstream");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(retry_delay) => {}
        }
        retry_delay = next_delay(retry_delay);
    }

    Ok(())
}
