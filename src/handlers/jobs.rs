//! `POST /api/jobs`, `GET /api/jobs/:jobId`, `GET /api/jobs/:jobId/results`.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::{Json, http::StatusCode};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::instrument;

use super::guards::{parse_job_id, require_job_token};
use crate::config::{CLIP_COUNT_MAX, CLIP_COUNT_MIN, CLIP_DURATION_MAX_SECS, CLIP_DURATION_MIN_SECS};
use crate::dispatcher::CreateJobRequest;
use crate::errors::ApiError;
use crate::job_store::{JobStage, JobStatus};
use crate::state::AppState;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

#[derive(Debug, Deserialize)]
pub struct CreateJobBody {
    video_url: String,
    clip_duration_seconds: u32,
    clip_count: u32,
    language: String,
}

#[derive(Debug, Serialize)]
struct CreateJobResponseBody {
    job_id: String,
    job_token: String,
    status: &'static str,
}

fn validate_create_job(body: &CreateJobBody) -> Result<(), ApiError> {
    if body.video_url.trim().is_empty() {
        return Err(ApiError::validation("video_url is required"));
    }
    if !(CLIP_DURATION_MIN_SECS..=CLIP_DURATION_MAX_SECS).contains(&body.clip_duration_seconds) {
        return Err(ApiError::validation(format!(
            "clip_duration_seconds must be between {CLIP_DURATION_MIN_SECS} and {CLIP_DURATION_MAX_SECS}"
        )));
    }
    if !(CLIP_COUNT_MIN..=CLIP_COUNT_MAX).contains(&body.clip_count) {
        return Err(ApiError::validation(format!(
            "clip_count must be between {CLIP_COUNT_MIN} and {CLIP_COUNT_MAX}"
        )));
    }
    if !matches!(body.language.as_str(), "en" | "id" | "auto") {
        return Err(ApiError::validation("language must be one of en, id, auto"));
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn create_job(State(state): State<AppState>, Json(body): Json<CreateJobBody>) -> impl IntoResponse {
    if let Err(err) = validate_create_job(&body) {
        return err.into_response();
    }
    let request = CreateJobRequest {
        video_url: body.video_url,
        clip_duration_seconds: body.clip_duration_seconds,
        clip_count: body.clip_count,
        language: body.language,
    };
    match state.dispatcher.create_job(request, now_millis()).await {
        Ok(record) => (
            StatusCode::OK,
            Json(CreateJobResponseBody {
                job_id: record.job_id.to_string(),
                job_token: record.job_token,
                status: "QUEUED",
            }),
        )
            .into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

#[derive(Debug, Serialize)]
struct JobStatusResponseBody {
    job_id: String,
    status: JobStatus,
    stage: JobStage,
    progress: u8,
    start_error: Option<String>,
    error: Option<String>,
    nosana_run_id: Option<String>,
}

#[instrument(skip_all)]
pub async fn get_job(State(state): State<AppState>, Path(job_id): Path<String>) -> impl IntoResponse {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    match state.job_store.get_job(&job_id).await {
        Ok(Some(record)) => (
            StatusCode::OK,
            Json(JobStatusResponseBody {
                job_id: record.job_id.to_string(),
                status: record.status,
                stage: record.stage,
                progress: record.progress,
                start_error: record.start_error,
                error: record.error,
                nosana_run_id: record.run_id,
            }),
        )
            .into_response(),
        Ok(None) => ApiError::not_found("unknown job").into_response(),
        Err(err) => ApiError::internal(err.to_string()).into_response(),
    }
}

#[derive(Debug, Serialize)]
struct ResultClip {
    clip_file: String,
    title: String,
    duration: f64,
    locked: bool,
    unlock_endpoint: String,
    download_endpoint: String,
    preview_endpoint: String,
}

#[derive(Debug, Serialize)]
struct ResultsResponseBody {
    clips: Vec<ResultClip>,
}

#[instrument(skip_all)]
pub async fn get_results(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_job_token(&state, &job_id, &headers).await {
        return err.into_response();
    }

    let (_, manifest) = match state.artifact.load_manifest(&job_id).await {
        Ok(value) => value,
        Err(err) => return ApiError::from(err).into_response(),
    };

    let mut clips = Vec::with_capacity(manifest.clips.len());
    for clip in manifest.clips {
        let locked = match state.artifact.is_unlocked(&job_id, &clip.file).await {
            Ok(unlocked) => !unlocked,
            Err(err) => return ApiError::from(err).into_response(),
        };
        clips.push(ResultClip {
            unlock_endpoint: format!("/api/jobs/{job_id}/clips/{}/unlock", clip.file),
            download_endpoint: format!("/api/jobs/{job_id}/clips/{}/download", clip.file),
            preview_endpoint: format!("/api/jobs/{job_id}/clips/{}/preview", clip.file),
            clip_file: clip.file,
            title: clip.title,
            duration: clip.duration,
            locked,
        });
    }
    (StatusCode::OK, Json(ResultsResponseBody { clips })).into_response()
}
