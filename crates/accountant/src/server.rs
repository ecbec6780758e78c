//! Local socket API of the node accountant.
//!
//! Serves `/status`, `/reserve` and `/unreserve` over a filesystem stream
//! socket. The endpoints are the only way scheduler-side components touch
//! this node's ledger; host-local trust is assumed, there is no auth.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use api_types::ReserveRequest;
use api_types::StatusResponse;
use api_types::UnreserveRequest;
use error_stack::Report;
use poem::get;
use poem::handler;
use poem::http::StatusCode;
use poem::listener::UnixListener;
use poem::post;
use poem::web::Data;
use poem::web::Json;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use crate::errors::AccountantError;
use crate::store::CardStore;

fn internal_error(err: Report<AccountantError>) -> poem::Error {
    error!("Accountant store error: {err:?}");
    poem::Error::from_string("internal error", StatusCode::INTERNAL_SERVER_ERROR)
}

/// Ledger snapshot. No side effects.
#[handler]
async fn status(store: Data<&Arc<CardStore>>) -> poem::Result<Json<StatusResponse>> {
    let snapshot = store.snapshot().map_err(internal_error)?;
    Ok(Json(snapshot))
}

/// Reserve percent on the listed cards. Always 200 on a well-formed body;
/// partial grants are visible through `/status`, not the status code.
#[handler]
async fn reserve(
    store: Data<&Arc<CardStore>>,
    Json(req): Json<ReserveRequest>,
) -> poem::Result<StatusCode> {
    if req.percent == 0 || req.percent > 100 {
        return Err(poem::Error::from_string(
            format!("percent out of range: {}", req.percent),
            StatusCode::BAD_REQUEST,
        ));
    }
    store
        .reserve(&req.pod_key, &req.devices, req.percent)
        .map_err(internal_error)?;
    Ok(StatusCode::OK)
}

/// Release every pending reservation of the pod. Idempotent.
#[handler]
async fn unreserve(
    store: Data<&Arc<CardStore>>,
    Json(req): Json<UnreserveRequest>,
) -> poem::Result<StatusCode> {
    store.unreserve(&req.pod_key).map_err(internal_error)?;
    Ok(StatusCode::OK)
}

/// Build the accountant's route table.
pub fn routes(store: Arc<CardStore>) -> impl Endpoint {
    Route::new()
        .at("/status", get(status))
        .at("/reserve", post(reserve))
        .at("/unreserve", post(unreserve))
        .data(store)
}

/// Serve the local socket API until the token is cancelled.
///
/// # Errors
///
/// - [`AccountantError::ServerError`] if binding or serving fails
pub async fn run(
    store: Arc<CardStore>,
    socket_path: &Path,
    shutdown: CancellationToken,
) -> Result<(), Report<AccountantError>> {
    // Stale socket files from a previous run keep the bind from succeeding.
    if socket_path.exists() {
        std::fs::remove_file(socket_path).map_err(|e| {
            Report::new(AccountantError::ServerError {
                message: format!("failed to remove stale socket {}: {e}", socket_path.display()),
            })
        })?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            Report::new(AccountantError::ServerError {
                message: format!("failed to create {}: {e}", parent.display()),
            })
        })?;
    }

    info!(path = %socket_path.display(), "Starting accountant socket API");

    let app = routes(store);
    let listener = UnixListener::bind(socket_path);
    Server::new(listener)
        .run_with_graceful_shutdown(app, shutdown.cancelled_owned(), Some(Duration::from_secs(5)))
        .await
        .map_err(|e| {
            Report::new(AccountantError::ServerError {
                message: format!("server failed: {e}"),
            })
        })
}
