use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use accountant::config;
use accountant::config::DaemonArgs;
use accountant::logging;
use accountant::registry::DeviceRegistry;
use accountant::replay;
use accountant::server;
use accountant::CardStore;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let args = DaemonArgs::parse();
    info!(node = %args.node_name, "Starting card accountant");

    let cards = config::load_cards(&args.card_config)
        .with_context(|| format!("loading card config {}", args.card_config.display()))?;
    let registry = DeviceRegistry::from_config(&args, &cards);
    let store = Arc::new(CardStore::new(cards.iter().map(|c| c.uuid.clone())));

    if args.skip_replay {
        info!("Replay disabled, starting with a fresh ledger");
    } else {
        match replay::replay_live_pods(&args, &store, &registry).await {
            Ok(pods) => info!(pods = pods, "Live-pod replay complete"),
            Err(err) => {
                warn!("Live-pod replay failed, starting with a fresh ledger: {err:?}");
            }
        }
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_token.cancel();
        }
    });

    server::run(store, &args.socket_path, shutdown)
        .await
        .map_err(|err| anyhow::anyhow!("accountant server failed: {err:?}"))?;

    info!("Accountant stopped");
    Ok(())
}
