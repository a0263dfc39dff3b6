//! `GET .../preview`, `GET .../download`, `POST .../unlock`.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::{Json, http::StatusCode};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::guards::{header, parse_job_id, require_auth_token, require_job_token};
use crate::chain::solana::parse_pubkey;
use crate::errors::ApiError;
use crate::job_store::Idempotency;
use crate::state::AppState;

#[derive(Debug, Serialize)]
struct SignedUrlResponseBody {
    url: String,
    expires_in: u64,
}

#[instrument(skip_all)]
pub async fn preview(
    State(state): State<AppState>,
    Path((job_id, clip_file)): Path<(String, String)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_job_token(&state, &job_id, &headers).await {
        return err.into_response();
    }
    match state.artifact.preview_url(&job_id, &clip_file).await {
        Ok(url) => (StatusCode::OK, Json(SignedUrlResponseBody { url, expires_in: 600 })).into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

#[derive(Debug, Serialize)]
struct LockedResponseBody {
    error: &'static str,
}

#[instrument(skip_all)]
pub async fn download(
    State(state): State<AppState>,
    Path((job_id, clip_file)): Path<(String, String)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_job_token(&state, &job_id, &headers).await {
        return err.into_response();
    }
    match state.artifact.download_url(&job_id, &clip_file).await {
        Ok(url) => (StatusCode::OK, Json(SignedUrlResponseBody { url, expires_in: 86_400 })).into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

#[instrument(skip_all)]
pub async fn range(
    State(state): State<AppState>,
    Path((job_id, clip_file)): Path<(String, String)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_job_token(&state, &job_id, &headers).await {
        return err.into_response();
    }
    let range_header = header(&headers, "range");
    match state.artifact.range_proxy(&job_id, &clip_file, range_header.as_deref()).await {
        Ok(object) => {
            let status = if object.partial { StatusCode::PARTIAL_CONTENT } else { StatusCode::OK };
            let mut response = (status, object.body).into_response();
            let response_headers = response.headers_mut();
            response_headers.insert(
                axum::http::header::CONTENT_TYPE,
                object
                    .content_type
                    .unwrap_or_else(|| "video/mp4".to_string())
                    .parse()
                    .expect("content type is a valid header value"),
            );
            response_headers.insert(axum::http::header::ACCEPT_RANGES, "bytes".parse().unwrap());
            response_headers.insert(axum::http::header::CACHE_CONTROL, "private, max-age=3600".parse().unwrap());
            if let Some(content_range) = object.content_range {
                response_headers.insert(
                    axum::http::header::CONTENT_RANGE,
                    content_range.parse().expect("content range is a valid header value"),
                );
            }
            response
        }
        Err(err) => ApiError::from(err).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct UnlockBody {
    unlock_request_id: String,
}

#[derive(Debug, Serialize)]
struct UnlockResponseBody {
    job_id: String,
    clip_file: String,
    unlocked: bool,
    charged_credits: u8,
    idempotency: Idempotency,
}

#[instrument(skip_all)]
pub async fn unlock(
    State(state): State<AppState>,
    Path((job_id, clip_file)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<UnlockBody>,
) -> impl IntoResponse {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_job_token(&state, &job_id, &headers).await {
        return err.into_response();
    }
    let wallet_address = match require_auth_token(&state, &headers).await {
        Ok(wallet) => wallet,
        Err(err) => return err.into_response(),
    };
    if body.unlock_request_id.is_empty() || body.unlock_request_id.len() > 128 {
        return ApiError::validation("unlock_request_id must be 1..=128 characters").into_response();
    }
    let wallet = match parse_pubkey(&wallet_address) {
        Ok(pubkey) => pubkey,
        Err(_) => return ApiError::internal("bound wallet address is not a valid pubkey").into_response(),
    };

    match state
        .unlock
        .unlock(&job_id, &clip_file, &wallet, &wallet_address, &body.unlock_request_id)
        .await
    {
        Ok(result) => (
            StatusCode::OK,
            Json(UnlockResponseBody {
                job_id: result.job_id.to_string(),
                clip_file: result.clip_file,
                unlocked: result.unlocked,
                charged_credits: result.charged_credits,
                idempotency: result.idempotency,
            }),
        )
            .into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}
