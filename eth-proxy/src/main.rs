#![warn(clippy::all, clippy::pedantic, clippy::cargo, clippy::nursery)]

mod logging;
mod metrics;

use anyhow::{Context as _, Result as AnyResult};
use dotenv::dotenv;
use structopt::StructOpt;
use tokio::{runtime, spawn};
use tracing::info;
use types::shutdown_token;

use self::logging::LogOptions;

#[derive(StructOpt)]
struct Options {
    #[structopt(flatten)]
    log:     LogOptions,
    #[structopt(flatten)]
    metrics: metrics::Options,
    #[structopt(flatten)]
    app:     eth_proxy::Options,
}

fn main() -> AnyResult<()> {
    dotenv().ok();
    let options = Options::from_args();

    // Start log system
    options.log.init()?;

    // Launch Tokio runtime
    runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Error creating Tokio runtime")?
        .block_on(async {
            spawn(metrics::main(options.metrics));

            // one token; a termination signal drains everything
            eth_proxy::main(options.app, shutdown_token()).await
        })?;

    // Terminate successfully
    info!("program terminating normally");
    Ok(())
}
