//! KangKlip orchestrator HTTP entrypoint.
//!
//! Launches an Axum server that accepts clipping job requests, dispatches
//! them to the GPU execution fabric, tracks lifecycle in Redis, and gates
//! per-clip delivery behind a Solana-anchored credit ledger.
//!
//! Endpoints: see [`handlers::routes`].
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control binding address
//! - see [`config::Config`] for the full list of recognized variables

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors;

use kangklip_orchestrator::artifact::ArtifactGate;
use kangklip_orchestrator::artifact::object_store::S3ObjectStoreClient;
use kangklip_orchestrator::auth::AuthService;
use kangklip_orchestrator::chain::SolanaProvider;
use kangklip_orchestrator::config::Config;
use kangklip_orchestrator::credit::CreditService;
use kangklip_orchestrator::dispatcher::{Dispatcher, ReqwestNosanaClient};
use kangklip_orchestrator::handlers;
use kangklip_orchestrator::job_store::{JobStore, RedisJobStore};
use kangklip_orchestrator::sig_down::SigDown;
use kangklip_orchestrator::state::AppState;
use kangklip_orchestrator::telemetry::Telemetry;
use kangklip_orchestrator::trace_id::TraceIdLayer;
use kangklip_orchestrator::unlock::UnlockCoordinator;

fn cors_layer(cors_origins: Option<&str>) -> cors::CorsLayer {
    let layer = cors::CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(cors::Any);
    match cors_origins {
        Some(origins) => {
            let parsed: Vec<_> = origins
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .filter_map(|s| s.parse().ok())
                .collect();
            layer.allow_origin(parsed)
        }
        None => layer.allow_origin(cors::Any),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let _telemetry = Telemetry::new();

    let config = Arc::new(Config::load()?);

    let job_store: Arc<dyn JobStore> = Arc::new(RedisJobStore::connect(&config.redis_url).await?);
    let chain = Arc::new(SolanaProvider::new(&config, &config.load_spender_keypair_bytes()?)?);
    let object_store = Arc::new(S3ObjectStoreClient::new(
        config.r2_endpoint.as_str(),
        &config.r2_bucket,
        &config.r2_access_key_id,
        &config.r2_secret_access_key,
    ));
    let fabric = Arc::new(ReqwestNosanaClient::new(config.nosana_api_base.clone(), config.nosana_api_key.clone()));

    let auth = Arc::new(AuthService::new(job_store.clone()));
    let credit = Arc::new(CreditService::new(chain.clone(), job_store.clone()));
    let artifact = Arc::new(ArtifactGate::new(job_store.clone(), object_store));
    let unlock = Arc::new(UnlockCoordinator::new(job_store.clone(), credit.clone()));
    let dispatcher = Arc::new(Dispatcher::new(job_store.clone(), fabric, config.clone()));

    let state = AppState {
        config: config.clone(),
        job_store,
        chain,
        auth,
        credit,
        artifact,
        unlock,
        dispatcher,
    };

    let http_endpoints = Router::new()
        .merge(handlers::routes())
        .with_state(state)
        .layer(TraceIdLayer)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(cors_layer(config.cors_origins.as_deref()));

    let addr = SocketAddr::new(config.host, config.port);
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap_or_else(|e| {
        tracing::error!("Failed to bind to {}: {}", addr, e);
        std::process::exit(1);
    });

    let sig_down = SigDown::try_new()?;
    let axum_cancellation_token = sig_down.cancellation_token();
    let axum_graceful_shutdown = async move { axum_cancellation_token.cancelled().await };
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(axum_graceful_shutdown)
        .await?;

    Ok(())
}
