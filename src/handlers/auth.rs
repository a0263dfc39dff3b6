//! `POST /api/auth/challenge`, `POST /api/auth/verify`.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::{Json, http::StatusCode};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::auth::AuthError;
use crate::errors::ApiError;
use crate::state::AppState;

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidWallet | AuthError::ChallengeExpired | AuthError::MalformedSignature => {
                ApiError::validation(err.to_string())
            }
            AuthError::BadSignature => ApiError::unauthorized(err.to_string()),
            AuthError::Store(_) => ApiError::internal(err.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChallengeBody {
    wallet_address: String,
}

#[instrument(skip_all)]
pub async fn challenge(State(state): State<AppState>, Json(body): Json<ChallengeBody>) -> impl IntoResponse {
    match state.auth.challenge(&body.wallet_address).await {
        Ok(issued) => (StatusCode::OK, Json(issued)).into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct VerifyBody {
    wallet_address: String,
    nonce: String,
    signature: String,
}

#[derive(Debug, Serialize)]
struct VerifyResponseBody {
    auth_token: String,
    expires_in: u64,
}

#[instrument(skip_all)]
pub async fn verify(State(state): State<AppState>, Json(body): Json<VerifyBody>) -> impl IntoResponse {
    match state.auth.verify(&body.wallet_address, &body.nonce, &body.signature).await {
        Ok(token) => (
            StatusCode::OK,
            Json(VerifyResponseBody {
                auth_token: token,
                expires_in: 86_400,
            }),
        )
            .into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}
