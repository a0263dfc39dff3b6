//! `GET /api/credits/balance`, `POST /api/credits/topup/usdc/intent`,
//! `POST /api/credits/topup/usdc/confirm`.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::{Json, http::StatusCode};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::guards::require_auth_token;
use crate::chain::solana::parse_pubkey;
use crate::errors::ApiError;
use crate::state::AppState;

fn resolve_wallet(wallet_address: &str) -> Result<solana_pubkey::Pubkey, ApiError> {
    parse_pubkey(wallet_address).map_err(|_| ApiError::internal("bound wallet address is not a valid pubkey"))
}

#[derive(Debug, Serialize)]
struct BalanceResponseBody {
    credits: u64,
}

#[instrument(skip_all)]
pub async fn balance(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let wallet_address = match require_auth_token(&state, &headers).await {
        Ok(wallet) => wallet,
        Err(err) => return err.into_response(),
    };
    let wallet = match resolve_wallet(&wallet_address) {
        Ok(pubkey) => pubkey,
        Err(err) => return err.into_response(),
    };
    match state.credit.balance(&wallet).await {
        Ok(credits) => (StatusCode::OK, Json(BalanceResponseBody { credits })).into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct TopupIntentBody {
    credits_to_buy: u64,
}

#[instrument(skip_all)]
pub async fn topup_intent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TopupIntentBody>,
) -> impl IntoResponse {
    let wallet_address = match require_auth_token(&state, &headers).await {
        Ok(wallet) => wallet,
        Err(err) => return err.into_response(),
    };
    let wallet = match resolve_wallet(&wallet_address) {
        Ok(pubkey) => pubkey,
        Err(err) => return err.into_response(),
    };
    match state.credit.build_topup_intent(&wallet, body.credits_to_buy) {
        Ok(intent) => (StatusCode::OK, Json(intent)).into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct TopupConfirmBody {
    signature: String,
}

#[instrument(skip_all)]
pub async fn topup_confirm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TopupConfirmBody>,
) -> impl IntoResponse {
    let wallet_address = match require_auth_token(&state, &headers).await {
        Ok(wallet) => wallet,
        Err(err) => return err.into_response(),
    };
    let wallet = match resolve_wallet(&wallet_address) {
        Ok(pubkey) => pubkey,
        Err(err) => return err.into_response(),
    };
    match state.credit.confirm_topup(&wallet, &body.signature).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}
