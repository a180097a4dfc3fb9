use anyhow::Context;
use clap::Parser;

use innalok_relay::{app, cli::Cli, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    telemetry::init(&cli.logging.to_config()).context("failed to initialize logging")?;
    app::run(cli).await?;
    Ok(())
}
