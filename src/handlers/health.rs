//! Ambient `GET /healthz`: pings the job store and the chain RPC endpoint.
//! Ungated — used by load balancers and orchestration platforms, not clients.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::{Json, http::StatusCode};
use serde_json::json;
use tracing::instrument;

use crate::state::AppState;

#[instrument(skip_all)]
pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let chain_ok = state.chain.health_check().await.is_ok();
    let store_ok = state.job_store.get_wallet_spend("healthz-probe").await.is_ok();

    let status = if chain_ok && store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "chain": chain_ok,
            "store": store_ok,
        })),
    )
}
