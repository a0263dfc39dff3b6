//! HTTP surface: route table plus one handler module per resource family.
//! Token gates (spec.md §4.1) are checked inline at the top of each gated
//! handler via [`guards`] rather than as generic middleware, since which
//! gates apply (and which path/body fields they need) differs per route.

mod auth;
mod callback;
mod clips;
mod credits;
mod guards;
mod health;
mod jobs;

use axum::Router;
use axum::routing::{get, post};

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/api/jobs", post(jobs::create_job))
        .route("/api/jobs/{job_id}", get(jobs::get_job))
        .route("/api/jobs/{job_id}/results", get(jobs::get_results))
        .route("/api/jobs/{job_id}/clips/{clip_file}/preview", get(clips::preview))
        .route("/api/jobs/{job_id}/clips/{clip_file}/download", get(clips::download))
        .route("/api/jobs/{job_id}/clips/{clip_file}/range", get(clips::range))
        .route("/api/jobs/{job_id}/clips/{clip_file}/unlock", post(clips::unlock))
        .route("/api/auth/challenge", post(auth::challenge))
        .route("/api/auth/verify", post(auth::verify))
        .route("/api/credits/balance", get(credits::balance))
        .route("/api/credits/topup/usdc/intent", post(credits::topup_intent))
        .route("/api/credits/topup/usdc/confirm", post(credits::topup_confirm))
        .route("/api/callback/nosana", post(callback::nosana))
}
