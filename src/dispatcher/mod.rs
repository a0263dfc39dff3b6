//! The dispatcher: submits a clipping job to the external GPU execution
//! fabric and tracks it through to a running deployment.
//!
//! [`NosanaClient`] is the trait boundary so the submission/poll/start
//! sequence (spec.md §4.7) can be exercised against a fake in tests without
//! an actual fabric to talk to — the same shape the credit/artifact modules
//! use for the chain and object store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::config::Config;
use crate::errors::ApiError;
use crate::ids::JobId;
use crate::job_store::{JobPatch, JobRecord, JobStatus, JobStore, JobStoreError};

#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error("fabric request failed: {0}")]
    Fabric(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

impl From<DispatcherError> for ApiError {
    fn from(err: DispatcherError) -> Self {
        match err {
            DispatcherError::Fabric(_) => ApiError::upstream(err.to_string()),
            DispatcherError::Store(_) => ApiError::internal(err.to_string()),
        }
    }
}

/// The environment payload a deployment receives, carrying both the job's
/// own parameters and the advisory render/caption/ASR passthroughs from
/// configuration (spec.md §6) — the worker pipeline itself is out of scope
/// here, this is just what gets handed to it.
#[derive(Debug, Serialize)]
pub struct WorkerEnv {
    pub job_id: String,
    pub video_url: String,
    pub clip_duration_seconds: u32,
    pub clip_count: u32,
    pub language: String,
    pub callback_url: String,
    pub callback_token: String,
    pub llm_api_base: String,
    pub llm_model_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_api_key: Option<String>,
    pub r2_endpoint: String,
    pub r2_bucket: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentState {
    Preparing,
    Running,
    Failed,
}

#[async_trait]
pub trait NosanaClient: Send + Sync {
    /// Advisory cache probe for the configured worker image — never gates
    /// submission (spec.md §9 open question (b) resolved: advisory only).
    async fn probe_image_cache(&self, image: &str) -> Result<bool, DispatcherError>;
    async fn submit_deployment(&self, market: &str, image: &str, env: &WorkerEnv) -> Result<String, DispatcherError>;
    async fn deployment_state(&self, run_id: &str) -> Result<DeploymentState, DispatcherError>;
    async fn start_deployment(&self, run_id: &str) -> Result<(), DispatcherError>;
}

pub struct ReqwestNosanaClient {
    http: reqwest::Client,
    api_base: Url,
    api_key: String,
}

impl ReqwestNosanaClient {
    pub fn new(api_base: Url, api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base,
            api_key,
        }
    }

    fn url(&self, path: &str) -> Url {
        self.api_base.join(path).expect("dispatcher path is a valid relative url")
    }
}

#[derive(Debug, Deserialize)]
struct CacheProbeResponse {
    cached: bool,
}

#[derive(Debug, Deserialize)]
struct SubmitDeploymentResponse {
    run_id: String,
}

#[derive(Debug, Deserialize)]
struct DeploymentStateResponse {
    state: String,
}

#[async_trait]
impl NosanaClient for ReqwestNosanaClient {
    async fn probe_image_cache(&self, image: &str) -> Result<bool, DispatcherError> {
        let response = self
            .http
            .get(self.url("v1/cache"))
            .bearer_auth(&self.api_key)
            .query(&[("image", image)])
            .send()
            .await
            .map_err(|e| DispatcherError::Fabric(e.to_string()))?;
        let body: CacheProbeResponse = response
            .json()
            .await
            .map_err(|e| DispatcherError::Fabric(e.to_string()))?;
        Ok(body.cached)
    }

    async fn submit_deployment(&self, market: &str, image: &str, env: &WorkerEnv) -> Result<String, DispatcherError> {
        let response = self
            .http
            .post(self.url("v1/deployments"))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "market": market,
                "image": image,
                "replicas": 1,
                "env": env,
            }))
            .send()
            .await
            .map_err(|e| DispatcherError::Fabric(e.to_string()))?;
        let body: SubmitDeploymentResponse = response
            .json()
            .await
            .map_err(|e| DispatcherError::Fabric(e.to_string()))?;
        Ok(body.run_id)
    }

    async fn deployment_state(&self, run_id: &str) -> Result<DeploymentState, DispatcherError> {
        let response = self
            .http
            .get(self.url(&format!("v1/deployments/{run_id}")))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| DispatcherError::Fabric(e.to_string()))?;
        let body: DeploymentStateResponse = response
            .json()
            .await
            .map_err(|e| DispatcherError::Fabric(e.to_string()))?;
        Ok(match body.state.as_str() {
            "RUNNING" => DeploymentState::Running,
            "FAILED" | "STOPPED" => DeploymentState::Failed,
            _ => DeploymentState::Preparing,
        })
    }

    async fn start_deployment(&self, run_id: &str) -> Result<(), DispatcherError> {
        self.http
            .post(self.url(&format!("v1/deployments/{run_id}/start")))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| DispatcherError::Fabric(e.to_string()))?
            .error_for_status()
            .map_err(|e| DispatcherError::Fabric(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateJobRequest {
    pub video_url: String,
    pub clip_duration_seconds: u32,
    pub clip_count: u32,
    pub language: String,
}

const START_POLL_ATTEMPTS: u32 = 30;
const START_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    fabric: Arc<dyn NosanaClient>,
    config: Arc<Config>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStore>, fabric: Arc<dyn NosanaClient>, config: Arc<Config>) -> Self {
        Self {
            store,
            fabric,
            config,
        }
    }

    /// Generates a job id and token, persists a Queued record, submits the
    /// deployment, and — if submission succeeds — spawns a background task
    /// that polls the deployment until it's ready and then starts it.
    /// Submission failure is surfaced to the caller as 502 and the job is
    /// persisted Failed; start failures are fire-and-forget (recorded as
    /// `startError`, never fail the creation response).
    pub async fn create_job(self: &Arc<Self>, request: CreateJobRequest, now_millis: u64) -> Result<JobRecord, DispatcherError> {
        let job_id = JobId::generate(now_millis);
        let job_token = crate::ids::HexSecret::generate().as_str().to_string();
        let mut record = JobRecord::queued(job_id.clone(), job_token, now_millis);
        self.store.create_job(&record).await?;

        let env = WorkerEnv {
            job_id: job_id.to_string(),
            video_url: request.video_url,
            clip_duration_seconds: request.clip_duration_seconds,
            clip_count: request.clip_count,
            language: request.language,
            callback_url: self.config.callback_base_url.join("api/callback/nosana").unwrap().to_string(),
            callback_token: self.config.callback_token.clone(),
            llm_api_base: self.config.llm_api_base.to_string(),
            llm_model_name: self.config.llm_model_name.clone(),
            llm_api_key: self.config.llm_api_key.clone(),
            r2_endpoint: self.config.r2_endpoint.to_string(),
            r2_bucket: self.config.r2_bucket.clone(),
        };

        // Advisory only; its result never gates submission (open question
        // (b) in spec.md §9, resolved in favor of "advisory").
        let _ = self.fabric.probe_image_cache(&self.config.nosana_worker_image).await;

        match self
            .fabric
            .submit_deployment(&self.config.nosana_market, &self.config.nosana_worker_image, &env)
            .await
        {
            Ok(run_id) => {
                record = self
                    .store
                    .merge_job(
                        &job_id,
                        JobPatch {
                            run_id: Some(run_id.clone()),
                            ..Default::default()
                        },
                        now_millis,
                    )
                    .await?;
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    this.poll_and_start(job_id, run_id).await;
                });
                Ok(record)
            }
            Err(err) => {
                self.store
                    .merge_job(
                        &job_id,
                        JobPatch {
                            status: Some(JobStatus::Failed),
                            error: Some(err.to_string()),
                            ..Default::default()
                        },
                        now_millis,
                    )
                    .await?;
                Err(err)
            }
        }
    }

    async fn poll_and_start(&self, job_id: JobId, run_id: String) {
        for _ in 0..START_POLL_ATTEMPTS {
            match self.fabric.deployment_state(&run_id).await {
                Ok(DeploymentState::Running) => {
                    if let Err(err) = self.fabric.start_deployment(&run_id).await {
                        self.record_start_error(&job_id, err.to_string()).await;
                    }
                    return;
                }
                Ok(DeploymentState::Failed) => {
                    self.record_start_error(&job_id, "deployment entered a failed preparation state".to_string())
                        .await;
                    return;
                }
                Ok(DeploymentState::Preparing) => {}
                Err(err) => {
                    self.record_start_error(&job_id, err.to_string()).await;
                    return;
                }
            }
            tokio::time::sleep(START_POLL_INTERVAL).await;
        }
        self.record_start_error(&job_id, "deployment did not become ready in time".to_string())
            .await;
    }

    async fn record_start_error(&self, job_id: &JobId, message: String) {
        tracing::warn!(job_id = %job_id, error = %message, "deployment start failed");
        let now_millis = 0; // best-effort bookkeeping; clock is not authoritative here
        let _ = self
            .store
            .merge_job(
                job_id,
                JobPatch {
                    start_error: Some(message),
                    ..Default::default()
                },
                now_millis,
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::MemoryJobStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeFabric {
        states: Vec<DeploymentState>,
        poll_index: AtomicU32,
        started: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl NosanaClient for FakeFabric {
        async fn probe_image_cache(&self, _image: &str) -> Result<bool, DispatcherError> {
            Ok(false)
        }

        async fn submit_deployment(&self, _market: &str, _image: &str, _env: &WorkerEnv) -> Result<String, DispatcherError> {
            Ok("run-1".to_string())
        }

        async fn deployment_state(&self, _run_id: &str) -> Result<DeploymentState, DispatcherError> {
            let idx = self.poll_index.fetch_add(1, Ordering::SeqCst) as usize;
            Ok(self.states.get(idx).copied().unwrap_or(DeploymentState::Running))
        }

        async fn start_deployment(&self, _run_id: &str) -> Result<(), DispatcherError> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_config() -> Config {
        Config {
            host: "0.0.0.0".parse().unwrap(),
            port: 8080,
            nosana_api_base: "https://nosana.example".parse().unwrap(),
            nosana_api_key: "key".to_string(),
            nosana_worker_image: "image".to_string(),
            nosana_market: "market".to_string(),
            redis_url: "redis://localhost".to_string(),
            r2_endpoint: "https://r2.example".parse().unwrap(),
            r2_bucket: "bucket".to_string(),
            r2_access_key_id: "id".to_string(),
            r2_secret_access_key: "secret".to_string(),
            callback_base_url: "https://callback.example".parse().unwrap(),
            callback_token: "token".to_string(),
            llm_api_base: "https://llm.example".parse().unwrap(),
            llm_model_name: "model".to_string(),
            llm_api_key: None,
            cors_origins: None,
            solana_rpc_url: "https://rpc.example".parse().unwrap(),
            usdc_mint: solana_pubkey::Pubkey::new_unique().to_string(),
            treasury_address: solana_pubkey::Pubkey::new_unique().to_string(),
            credits_program_id: solana_pubkey::Pubkey::new_unique().to_string(),
            spender_keypair: "[]".to_string(),
        }
    }

    #[tokio::test]
    async fn create_job_persists_queued_then_run_id_on_success() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let fabric: Arc<dyn NosanaClient> = Arc::new(FakeFabric {
            states: vec![DeploymentState::Running],
            poll_index: AtomicU32::new(0),
            started: std::sync::atomic::AtomicBool::new(false),
        });
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), fabric, Arc::new(test_config())));

        let record = dispatcher
            .create_job(
                CreateJobRequest {
                    video_url: "https://example.com/v.mp4".to_string(),
                    clip_duration_seconds: 30,
                    clip_count: 3,
                    language: "en".to_string(),
                },
                1_700_000_000_000,
            )
            .await
            .unwrap();

        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.run_id, Some("run-1".to_string()));
    }

    #[tokio::test]
    async fn create_job_marks_failed_when_submission_errors() {
        struct FailingFabric;
        #[async_trait]
        impl NosanaClient for FailingFabric {
            async fn probe_image_cache(&self, _image: &str) -> Result<bool, DispatcherError> {
                Ok(false)
            }
            async fn submit_deployment(&self, _market: &str, _image: &str, _env: &WorkerEnv) -> Result<String, DispatcherError> {
                Err(DispatcherError::Fabric("unreachable".to_string()))
            }
            async fn deployment_state(&self, _run_id: &str) -> Result<DeploymentState, DispatcherError> {
                unreachable!()
            }
            async fn start_deployment(&self, _run_id: &str) -> Result<(), DispatcherError> {
                unreachable!()
            }
        }

        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let fabric: Arc<dyn NosanaClient> = Arc::new(FailingFabric);
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), fabric, Arc::new(test_config())));

        let result = dispatcher
            .create_job(
                CreateJobRequest {
                    video_url: "https://example.com/v.mp4".to_string(),
                    clip_duration_seconds: 30,
                    clip_count: 3,
                    language: "en".to_string(),
                },
                1_700_000_000_000,
            )
            .await;
        assert!(result.is_err());
    }
}
