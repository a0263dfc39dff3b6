//! The artifact gate: resolves a job's output manifest in the object store
//! and mints scoped URLs (or proxies a ranged byte stream) for individual
//! clip files, enforcing the unlock requirement on anything that delivers
//! the final render rather than a preview.

pub mod object_store;

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

pub use object_store::{ObjectStoreClient, ObjectStoreError, RangeObject};

use crate::errors::ApiError;
use crate::ids::JobId;
use crate::job_store::{JobStatus, JobStore, JobStoreError};

const PREVIEW_URL_TTL: Duration = Duration::from_secs(600);
const DOWNLOAD_URL_TTL: Duration = Duration::from_secs(86_400);

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("job not found")]
    JobNotFound,
    #[error("job has not succeeded or has no artifact prefix yet")]
    JobNotReady,
    #[error("manifest could not be parsed: {0}")]
    BadManifest(String),
    #[error("clip {0} is not part of this job's manifest")]
    UnknownClip(String),
    #[error("locked")]
    Locked,
    #[error(transparent)]
    Store(#[from] ObjectStoreError),
    #[error(transparent)]
    JobStore(#[from] JobStoreError),
}

impl From<ArtifactError> for ApiError {
    fn from(err: ArtifactError) -> Self {
        match err {
            ArtifactError::JobNotFound | ArtifactError::UnknownClip(_) => ApiError::not_found(err.to_string()),
            ArtifactError::JobNotReady => ApiError::conflict(err.to_string()),
            ArtifactError::Locked => ApiError::forbidden("locked"),
            // A manifest that's missing, unreadable, or malformed after the
            // job reports Succeeded is a server-side contract violation
            // (spec.md §6), not an upstream/transport failure.
            ArtifactError::BadManifest(_) | ArtifactError::JobStore(_) | ArtifactError::Store(_) => {
                ApiError::internal(err.to_string())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Manifest {
    pub clips: Vec<ManifestClip>,
}

#[derive(Debug, Deserialize)]
pub struct ManifestClip {
    pub file: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub duration: f64,
}

impl Manifest {
    fn contains(&self, clip_file: &str) -> bool {
        self.clips.iter().any(|c| c.file == clip_file)
    }
}

pub struct ArtifactGate {
    job_store: Arc<dyn JobStore>,
    object_store: Arc<dyn ObjectStoreClient>,
}

impl ArtifactGate {
    pub fn new(job_store: Arc<dyn JobStore>, object_store: Arc<dyn ObjectStoreClient>) -> Self {
        Self {
            job_store,
            object_store,
        }
    }

    /// Loads the output manifest for a job that must already be Succeeded,
    /// used both by the per-clip endpoints and by `/results`, which lists
    /// every clip at once.
    pub async fn load_manifest(&self, job_id: &JobId) -> Result<(String, Manifest), ArtifactError> {
        let record = self
            .job_store
            .get_job(job_id)
            .await?
            .ok_or(ArtifactError::JobNotFound)?;
        if record.status != JobStatus::Succeeded {
            return Err(ArtifactError::JobNotReady);
        }
        let r2_prefix = record.r2_prefix.ok_or(ArtifactError::JobNotReady)?;
        let manifest_bytes = self
            .object_store
            .get_object(&format!("{r2_prefix}/manifest.json"))
            .await?;
        let manifest: Manifest =
            serde_json::from_slice(&manifest_bytes).map_err(|e| ArtifactError::BadManifest(e.to_string()))?;
        Ok((r2_prefix, manifest))
    }

    async fn resolve_manifest(&self, job_id: &JobId, clip_file: &str) -> Result<String, ArtifactError> {
        let (r2_prefix, manifest) = self.load_manifest(job_id).await?;
        if !manifest.contains(clip_file) {
            return Err(ArtifactError::UnknownClip(clip_file.to_string()));
        }
        Ok(format!("{r2_prefix}/{clip_file}"))
    }

    /// Whether `clip_file` has been unlocked for `job_id` — used by
    /// `/results` to populate each listed clip's `locked` flag.
    pub async fn is_unlocked(&self, job_id: &JobId, clip_file: &str) -> Result<bool, ArtifactError> {
        Ok(self.job_store.get_clip_unlock(job_id, clip_file).await?)
    }

    /// A signed GET URL valid for 10 minutes, granted with no unlock check.
    pub async fn preview_url(&self, job_id: &JobId, clip_file: &str) -> Result<String, ArtifactError> {
        let key = self.resolve_manifest(job_id, clip_file).await?;
        Ok(self.object_store.presign_get(&key, PREVIEW_URL_TTL).await?)
    }

    /// A signed GET URL valid for 24 hours, granted only once the clip has
    /// been unlocked.
    pub async fn download_url(&self, job_id: &JobId, clip_file: &str) -> Result<String, ArtifactError> {
        let key = self.resolve_manifest(job_id, clip_file).await?;
        if !self.job_store.get_clip_unlock(job_id, clip_file).await? {
            return Err(ArtifactError::Locked);
        }
        Ok(self.object_store.presign_get(&key, DOWNLOAD_URL_TTL).await?)
    }

    /// Streams the clip through the orchestrator instead of redirecting to
    /// a signed URL, honoring an incoming `Range` header. Gated the same as
    /// [`Self::download_url`] — it's an alternate delivery path for the
    /// same unlocked artifact, not a preview.
    pub async fn range_proxy(&self, job_id: &JobId, clip_file: &str, range: Option<&str>) -> Result<RangeObject, ArtifactError> {
        let key = self.resolve_manifest(job_id, clip_file).await?;
        if !self.job_store.get_clip_unlock(job_id, clip_file).await? {
            return Err(ArtifactError::Locked);
        }
        Ok(self.object_store.get_object_range(&key, range).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::{JobRecord, MemoryJobStore};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeObjectStore {
        objects: Mutex<std::collections::HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl ObjectStoreClient for FakeObjectStore {
        async fn get_object(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
        }

        async fn presign_get(&self, key: &str, _ttl: Duration) -> Result<String, ObjectStoreError> {
            Ok(format!("https://signed.example/{key}"))
        }

        async fn get_object_range(&self, key: &str, _range: Option<&str>) -> Result<RangeObject, ObjectStoreError> {
            let body = self.get_object(key).await?;
            Ok(RangeObject {
                body,
                content_type: Some("video/mp4".to_string()),
                content_range: None,
                partial: false,
            })
        }
    }

    async fn gate_with_succeeded_job() -> (ArtifactGate, JobId, Arc<dyn JobStore>) {
        let job_store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let job_id = JobId::generate(1_700_000_000_000);
        let mut record = JobRecord::queued(job_id.clone(), "tok".into(), 1000);
        record.status = JobStatus::Succeeded;
        record.r2_prefix = Some("jobs/abc".to_string());
        job_store.create_job(&record).await.unwrap();

        let mut objects = std::collections::HashMap::new();
        objects.insert(
            "jobs/abc/manifest.json".to_string(),
            br#"{"clips":[{"file":"clip_1.mp4"}]}"#.to_vec(),
        );
        let object_store: Arc<dyn ObjectStoreClient> = Arc::new(FakeObjectStore {
            objects: Mutex::new(objects),
        });
        let gate = ArtifactGate::new(job_store.clone(), object_store);
        (gate, job_id, job_store)
    }

    #[tokio::test]
    async fn preview_url_does_not_require_unlock() {
        let (gate, job_id, _store) = gate_with_succeeded_job().await;
        let url = gate.preview_url(&job_id, "clip_1.mp4").await.unwrap();
        assert!(url.contains("clip_1.mp4"));
    }

    #[tokio::test]
    async fn download_url_is_locked_until_unlock_is_recorded() {
        let (gate, job_id, store) = gate_with_succeeded_job().await;
        assert!(matches!(
            gate.download_url(&job_id, "clip_1.mp4").await,
            Err(ArtifactError::Locked)
        ));
        store.set_clip_unlock(&job_id, "clip_1.mp4").await.unwrap();
        assert!(gate.download_url(&job_id, "clip_1.mp4").await.is_ok());
    }

    #[tokio::test]
    async fn unknown_clip_file_is_rejected() {
        let (gate, job_id, _store) = gate_with_succeeded_job().await;
        assert!(matches!(
            gate.preview_url(&job_id, "nope.mp4").await,
            Err(ArtifactError::UnknownClip(_))
        ));
    }
}
