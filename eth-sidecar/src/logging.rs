use anyhow::{anyhow, Result as AnyResult};
use structopt::StructOpt;
use tracing::Level;

#[derive(Clone, Debug, StructOpt)]
pub struct LogOptions {
    /// Configure logging level.
    #[structopt(
        long,
        env = "LOG_LEVEL",
        default_value = "info",
        possible_values = &["debug", "info", "warn", "error"]
    )]
    log_level: Level,
}

impl LogOptions {
    pub fn init(&self) -> AnyResult<()> {
        tracing_subscriber::fmt()
            .with_max_level(self.log_level)
            .try_init()
            .map_err(|error| anyhow!("Error initializing log system: {}", error))?;
        Ok(())
    }
}
