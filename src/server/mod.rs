//! HTTP surface of the admission controller.
//!
//! The four logical operations are exposed as JSON endpoints. The controller
//! sits behind one mutex, so admission decisions serialize: the effect of a
//! completed batch is fully visible to the next request. Malformed JSON
//! surfaces as an `INVALID_ARGUMENT` result, never as a transport error.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::routing::{delete, post};
use axum::Json;
use axum::Router;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::admission::{
    AdmissionController, AdmissionStatus, ClientDescriptor, QueueDescriptor,
};

/// Shared server state: the single serialized admission controller.
pub struct AppState {
    controller: Mutex<AdmissionController>,
}

impl AppState {
    pub fn new(controller: AdmissionController) -> Self {
        Self {
            controller: Mutex::new(controller),
        }
    }
}

/// Response of the AddClients operation.
#[derive(Debug, Serialize, Deserialize)]
pub struct AddClientsResponse {
    pub status: AdmissionStatus,
    pub admitted: bool,
}

/// Response of the remaining operations.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: AdmissionStatus,
}

/// Build the admission API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/clients", post(add_clients_handler))
        .route("/v1/clients/{name}", delete(del_client_handler))
        .route("/v1/queues", post(add_queue_handler))
        .route("/v1/queues/{name}", delete(del_queue_handler))
        .with_state(state)
}

/// Serve the admission API until the token is cancelled.
pub async fn serve(addr: &str, state: Arc<AppState>, cancel: CancellationToken) -> Result<()> {
    // Handle ":port" shorthand.
    let bind_addr = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("listening on {bind_addr}"))?;
    let local_addr = listener.local_addr().context("getting local address")?;
    info!(addr = %local_addr, "admission server started");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await
        .context("admission server error")
}

/// AddClients: admission-check a JSON batch of client descriptors.
async fn add_clients_handler(
    State(state): State<Arc<AppState>>,
    body: String,
) -> Json<AddClientsResponse> {
    let descriptors: Vec<ClientDescriptor> = match serde_json::from_str(&body) {
        Ok(descriptors) => descriptors,
        Err(_) => {
            return Json(AddClientsResponse {
                status: AdmissionStatus::InvalidArgument,
                admitted: false,
            });
        }
    };
    let outcome = state.controller.lock().add_clients(&descriptors);
    Json(AddClientsResponse {
        status: outcome.status,
        admitted: outcome.admitted,
    })
}

/// DelClient: remove a client by name.
async fn del_client_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Json<StatusResponse> {
    let status = state.controller.lock().del_client(&name);
    Json(StatusResponse { status })
}

/// AddQueue: register a queue from a JSON descriptor.
async fn add_queue_handler(
    State(state): State<Arc<AppState>>,
    body: String,
) -> Json<StatusResponse> {
    let descriptor: QueueDescriptor = match serde_json::from_str(&body) {
        Ok(descriptor) => descriptor,
        Err(_) => {
            return Json(StatusResponse {
                status: AdmissionStatus::InvalidArgument,
            });
        }
    };
    let status = state.controller.lock().add_queue(&descriptor);
    Json(StatusResponse { status })
}

/// DelQueue: remove a queue by name.
async fn del_queue_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Json<StatusResponse> {
    let status = state.controller.lock().del_queue(&name);
    Json(StatusResponse { status })
}
