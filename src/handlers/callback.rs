//! `POST /api/callback/nosana` — the worker's job-status callback (spec.md §4.7).

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::{Json, http::StatusCode};
use serde::Deserialize;
use tracing::instrument;

use super::guards::{parse_job_id, require_callback_token};
use crate::errors::ApiError;
use crate::job_store::{JobPatch, JobStage, JobStatus};
use crate::state::AppState;
use std::time::{SystemTime, UNIX_EPOCH};

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

#[derive(Debug, Deserialize)]
pub struct CallbackBody {
    job_id: String,
    status: Option<JobStatus>,
    stage: Option<JobStage>,
    progress: Option<u8>,
    r2_prefix: Option<String>,
    error: Option<String>,
}

#[instrument(skip_all)]
pub async fn nosana(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<CallbackBody>) -> impl IntoResponse {
    if let Err(err) = require_callback_token(&state, &headers) {
        return err.into_response();
    }
    let job_id = match parse_job_id(&body.job_id) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };

    let current = match state.job_store.get_job(&job_id).await {
        Ok(Some(record)) => record,
        Ok(None) => return ApiError::not_found("unknown job").into_response(),
        Err(err) => return ApiError::internal(err.to_string()).into_response(),
    };

    if let Some(next) = body.status {
        if !current.status.can_transition_to(next) {
            return ApiError::validation(format!("illegal status transition {:?} -> {:?}", current.status, next))
                .into_response();
        }
    }

    let progress = body.progress.map(|p| p.min(100));
    let terminal = matches!(body.status, Some(JobStatus::Succeeded) | Some(JobStatus::Failed));

    let patch = JobPatch {
        status: body.status,
        stage: body.stage.or(if terminal { Some(JobStage::Done) } else { None }),
        progress: progress.or(if terminal { Some(100) } else { None }),
        r2_prefix: body.r2_prefix,
        start_error: None,
        error: body.error,
    };

    match state.job_store.merge_job(&job_id, patch, now_millis()).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(err) => ApiError::internal(err.to_string()).into_response(),
    }
}
