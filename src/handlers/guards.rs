//! The three token gates from spec.md §4.1, applied inline at the top of
//! each handler rather than as generic extractors — gating a job-scoped
//! endpoint needs the job id from the path *and* the store, which doesn't
//! fit `FromRequestParts` without threading extra state lookups through it.

use axum::http::HeaderMap;

use crate::errors::ApiError;
use crate::ids::JobId;
use crate::job_store::JobRecord;
use crate::state::AppState;

pub fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name)?.to_str().ok().map(str::to_string)
}

pub fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse::<JobId>()
        .map_err(|_| ApiError::not_found("unknown job"))
}

/// Loads the job and checks `x-job-token` against its stored token.
pub async fn require_job_token(
    state: &AppState,
    job_id: &JobId,
    headers: &HeaderMap,
) -> Result<JobRecord, ApiError> {
    let record = state
        .job_store
        .get_job(job_id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .ok_or_else(|| ApiError::not_found("unknown job"))?;
    let supplied = header(headers, "x-job-token").ok_or_else(|| ApiError::unauthorized("missing x-job-token"))?;
    if supplied != record.job_token {
        return Err(ApiError::unauthorized("invalid job token"));
    }
    Ok(record)
}

/// Resolves `x-auth-token` to its bound wallet address.
pub async fn require_auth_token(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let token = header(headers, "x-auth-token").ok_or_else(|| ApiError::unauthorized("missing x-auth-token"))?;
    state
        .auth
        .resolve_token(&token)
        .await
        .map_err(|e| ApiError::unauthorized(e.to_string()))?
        .ok_or_else(|| ApiError::unauthorized("invalid or expired auth token"))
}

pub fn require_callback_token(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let supplied = header(headers, "x-callback-token").ok_or_else(|| ApiError::unauthorized("missing x-callback-token"))?;
    if supplied != state.config.callback_token {
        return Err(ApiError::unauthorized("invalid callback token"));
    }
    Ok(())
}
