//! Card accountant emulator.
//!
//! Serves the accountant's socket API with a synthetic ledger so scheduler
//! components can be exercised without real hardware or a running kubelet.
//! Unlike the real accountant the emulator rejects a reserve outright (409)
//! when any listed card lacks the requested capacity, which makes scheduler
//! retry paths easy to provoke.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock;

use anyhow::Result;
use clap::Parser;
use poem::get;
use poem::handler;
use poem::http::StatusCode;
use poem::listener::UnixListener;
use poem::post;
use poem::web::Data;
use poem::web::Json;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use serde::Deserialize;
use tracing::info;

use accountant::logging;

#[derive(Parser)]
struct EmulatorArgs {
    #[arg(
        long,
        env = "CARDSHARE_SOCKET_PATH",
        default_value = "/var/lib/kubelet/device-plugins/card-accountant.sock",
        value_hint = clap::ValueHint::FilePath,
        help = "Unix socket path to listen on"
    )]
    socket_path: PathBuf,

    #[arg(
        long,
        env = "EMULATOR_DEVICES",
        value_delimiter = ',',
        help = "Card IDs to emulate; card i starts at 100 - 20*i percent"
    )]
    devices: Vec<String>,
}

type Ledger = Arc<RwLock<BTreeMap<String, i32>>>;

#[derive(Deserialize)]
struct EmulatedReserve {
    devices: Vec<String>,
    percent: i32,
}

#[handler]
async fn status(ledger: Data<&Ledger>) -> poem::Result<Json<BTreeMap<String, i32>>> {
    let ledger = ledger
        .read()
        .map_err(|_| poem::Error::from_status(StatusCode::INTERNAL_SERVER_ERROR))?;
    Ok(Json(ledger.clone()))
}

#[handler]
async fn reserve(ledger: Data<&Ledger>, Json(req): Json<EmulatedReserve>) -> poem::Result<StatusCode> {
    let mut ledger = ledger
        .write()
        .map_err(|_| poem::Error::from_status(StatusCode::INTERNAL_SERVER_ERROR))?;
    for device in &req.devices {
        match ledger.get(device) {
            Some(remaining) if *remaining >= req.percent => {}
            _ => {
                return Err(poem::Error::from_string(
                    "insufficient",
                    StatusCode::CONFLICT,
                ))
            }
        }
    }
    for device in &req.devices {
        if let Some(remaining) = ledger.get_mut(device) {
            *remaining = (*remaining - req.percent).max(0);
        }
    }
    Ok(StatusCode::OK)
}

#[handler]
async fn unreserve(
    ledger: Data<&Ledger>,
    Json(req): Json<EmulatedReserve>,
) -> poem::Result<StatusCode> {
    let mut ledger = ledger
        .write()
        .map_err(|_| poem::Error::from_status(StatusCode::INTERNAL_SERVER_ERROR))?;
    for device in &req.devices {
        let remaining = ledger.entry(device.clone()).or_insert(0);
        *remaining = (*remaining + req.percent).min(100);
    }
    Ok(StatusCode::OK)
}

fn seed_ledger(devices: &[String]) -> BTreeMap<String, i32> {
    let mut ledger = BTreeMap::new();
    for (i, device) in devices.iter().filter(|d| !d.is_empty()).enumerate() {
        ledger.insert(device.trim().to_string(), 100 - (i as i32) * 20);
    }
    if ledger.is_empty() {
        ledger.insert("GPU-0".to_string(), 100);
        ledger.insert("GPU-1".to_string(), 80);
    }
    ledger
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let args = EmulatorArgs::parse();

    let ledger: Ledger = Arc::new(RwLock::new(seed_ledger(&args.devices)));
    info!(path = %args.socket_path.display(), "Starting card accountant emulator");

    if args.socket_path.exists() {
        std::fs::remove_file(&args.socket_path)?;
    }
    if let Some(parent) = args.socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let app = Route::new()
        .at("/status", get(status))
        .at("/reserve", post(reserve))
        .at("/unreserve", post(unreserve))
        .data(ledger);

    Server::new(UnixListener::bind(&args.socket_path))
        .run(app)
        .await?;
    Ok(())
}
