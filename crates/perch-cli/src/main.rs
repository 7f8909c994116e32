//! perch — reference bot binary
//!
//! Connects the reference bot layer to the gateway and runs until Ctrl-C
//! or an unrecoverable session fault.

mod bot;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use perch_directory::HttpDirectory;
use perch_gateway::client::GatewayClientBuilder;

use crate::bot::ReferenceBot;

/// Guild and direct-message text events plus interactions.
const DEFAULT_INTENTS: u64 = 513;

#[derive(Debug, Parser)]
#[command(name = "perch", about = "Reference bot on the perch gateway engine")]
struct Args {
    /// Bot token.
    #[arg(long, env = "PERCH_TOKEN", hide_env_values = true)]
    token: String,

    /// Application id used for command registration.
    #[arg(long, env = "PERCH_APPLICATION_ID")]
    application_id: String,

    /// Gateway event subscription mask.
    #[arg(long, default_value_t = DEFAULT_INTENTS)]
    intents: u64,

    /// Gateway endpoint override.
    #[arg(long)]
    endpoint: Option<Url>,

    /// Path of the per-guild store file.
    #[arg(long, default_value = "perch-groups.json")]
    store: PathBuf,

    /// Abandon any handler chain that runs longer than this many seconds.
    #[arg(long)]
    handler_timeout_secs: Option<u64>,

    /// Leave remotely registered commands untouched on startup.
    #[arg(long)]
    no_reconcile: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let directory = Arc::new(HttpDirectory::new(&args.application_id, &args.token));
    let mut builder = GatewayClientBuilder::new()
        .directory(directory)
        .layer(ReferenceBot::new(args.store));
    if let Some(endpoint) = args.endpoint {
        builder = builder.endpoint(endpoint);
    }
    if let Some(secs) = args.handler_timeout_secs {
        builder = builder.handler_timeout(Duration::from_secs(secs));
    }
    if args.no_reconcile {
        builder = builder.skip_reconciliation();
    }
    let client = builder.build()?;

    let stopper = client.stopper();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            stopper.cancel();
        }
    });

    client.start(&args.token, args.intents).await
}
