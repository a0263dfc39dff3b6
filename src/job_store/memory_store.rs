//! An in-process fake of [`JobStore`], used by component tests that would
//! otherwise need a live Redis instance. Mirrors the real store's semantics
//! closely enough that the unlock coordinator and handlers can be exercised
//! against it unmodified — TTLs are tracked but not actively swept; callers
//! check expiry on read, same as Redis would after `EXPIRE` fires.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{
    AuthNonceRecord, IdempotencyResult, JobPatch, JobRecord, JobStage, JobStatus, JobStore,
    JobStoreError, TryConsumeOutcome, UnlockPending,
};
use crate::ids::JobId;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

struct Expiring<T> {
    value: T,
    expires_at: Option<u64>,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl_secs: Option<u64>) -> Self {
        Self {
            value,
            expires_at: ttl_secs.map(|ttl| now_secs() + ttl),
        }
    }

    fn live(&self) -> bool {
        self.expires_at.is_none_or(|exp| exp > now_secs())
    }
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, JobRecord>,
    clip_unlocks: HashMap<(String, String), bool>,
    wallet_spend: HashMap<String, u64>,
    idempotency: HashMap<String, Expiring<IdempotencyResult>>,
    unlock_pending: HashMap<String, Expiring<UnlockPending>>,
    auth_nonces: HashMap<String, Expiring<AuthNonceRecord>>,
    auth_tokens: HashMap<String, Expiring<String>>,
    topup_signatures: HashMap<String, bool>,
}

/// In-memory [`JobStore`] for tests. Not for production use: state is lost
/// on process exit and nothing is shared across instances.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, record: &JobRecord) -> Result<(), JobStoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner
            .jobs
            .insert(record.job_id.as_str().to_string(), record.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.jobs.get(job_id.as_str()).cloned())
    }

    async fn merge_job(
        &self,
        job_id: &JobId,
        patch: JobPatch,
        now_millis: u64,
    ) -> Result<JobRecord, JobStoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let record = inner
            .jobs
            .get_mut(job_id.as_str())
            .ok_or_else(|| JobStoreError::Decode(format!("no such job: {job_id}")))?;
        if let Some(status) = patch.status {
            record.status = status;
        }
        if let Some(stage) = patch.stage {
            record.stage = stage;
        }
        if let Some(progress) = patch.progress {
            record.progress = progress;
        }
        if let Some(r2_prefix) = patch.r2_prefix {
            record.r2_prefix = Some(r2_prefix);
        }
        if let Some(run_id) = patch.run_id {
            record.run_id = Some(run_id);
        }
        if let Some(start_error) = patch.start_error {
            record.start_error = Some(start_error);
        }
        if let Some(error) = patch.error {
            record.error = Some(error);
        }
        record.updated_at = now_millis;
        Ok(record.clone())
    }

    async fn get_clip_unlock(&self, job_id: &JobId, clip_file: &str) -> Result<bool, JobStoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .clip_unlocks
            .get(&(job_id.as_str().to_string(), clip_file.to_string()))
            .copied()
            .unwrap_or(false))
    }

    async fn set_clip_unlock(&self, job_id: &JobId, clip_file: &str) -> Result<(), JobStoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner
            .clip_unlocks
            .insert((job_id.as_str().to_string(), clip_file.to_string()), true);
        Ok(())
    }

    async fn get_wallet_spend(&self, wallet: &str) -> Result<u64, JobStoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.wallet_spend.get(wallet).copied().unwrap_or(0))
    }

    async fn incr_wallet_spend(&self, wallet: &str, by: u64) -> Result<u64, JobStoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let entry = inner.wallet_spend.entry(wallet.to_string()).or_insert(0);
        *entry += by;
        Ok(*entry)
    }

    async fn get_idempotency(
        &self,
        unlock_request_id: &str,
    ) -> Result<Option<IdempotencyResult>, JobStoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .idempotency
            .get(unlock_request_id)
            .filter(|e| e.live())
            .map(|e| e.value.clone()))
    }

    async fn set_idempotency(
        &self,
        unlock_request_id: &str,
        value: &IdempotencyResult,
        ttl_secs: u64,
    ) -> Result<(), JobStoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.idempotency.insert(
            unlock_request_id.to_string(),
            Expiring::new(value.clone(), Some(ttl_secs)),
        );
        Ok(())
    }

    async fn set_idempotency_if_absent(
        &self,
        unlock_request_id: &str,
        value: &IdempotencyResult,
        ttl_secs: u64,
    ) -> Result<bool, JobStoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        if inner
            .idempotency
            .get(unlock_request_id)
            .is_some_and(|e| e.live())
        {
            return Ok(false);
        }
        inner.idempotency.insert(
            unlock_request_id.to_string(),
            Expiring::new(value.clone(), Some(ttl_secs)),
        );
        Ok(true)
    }

    async fn get_unlock_pending(
        &self,
        unlock_request_id: &str,
    ) -> Result<Option<UnlockPending>, JobStoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .unlock_pending
            .get(unlock_request_id)
            .filter(|e| e.live())
            .map(|e| e.value.clone()))
    }

    async fn set_unlock_pending(
        &self,
        unlock_request_id: &str,
        value: &UnlockPending,
        ttl_secs: u64,
    ) -> Result<(), JobStoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.unlock_pending.insert(
            unlock_request_id.to_string(),
            Expiring::new(value.clone(), Some(ttl_secs)),
        );
        Ok(())
    }

    async fn delete_unlock_pending(&self, unlock_request_id: &str) -> Result<(), JobStoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.unlock_pending.remove(unlock_request_id);
        Ok(())
    }

    async fn set_auth_nonce(
        &self,
        nonce: &str,
        value: &AuthNonceRecord,
        ttl_secs: u64,
    ) -> Result<(), JobStoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner
            .auth_nonces
            .insert(nonce.to_string(), Expiring::new(value.clone(), Some(ttl_secs)));
        Ok(())
    }

    async fn get_auth_nonce(&self, nonce: &str) -> Result<Option<AuthNonceRecord>, JobStoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .auth_nonces
            .get(nonce)
            .filter(|e| e.live())
            .map(|e| e.value.clone()))
    }

    async fn delete_auth_nonce(&self, nonce: &str) -> Result<(), JobStoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.auth_nonces.remove(nonce);
        Ok(())
    }

    async fn set_auth_token(
        &self,
        token: &str,
        wallet: &str,
        ttl_secs: u64,
    ) -> Result<(), JobStoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.auth_tokens.insert(
            token.to_string(),
            Expiring::new(wallet.to_string(), Some(ttl_secs)),
        );
        Ok(())
    }

    async fn get_auth_token(&self, token: &str) -> Result<Option<String>, JobStoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .auth_tokens
            .get(token)
            .filter(|e| e.live())
            .map(|e| e.value.clone()))
    }

    async fn set_topup_signature_if_absent(&self, signature: &str) -> Result<bool, JobStoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        if inner.topup_signatures.contains_key(signature) {
            return Ok(false);
        }
        inner.topup_signatures.insert(signature.to_string(), true);
        Ok(true)
    }

    async fn try_consume_credit(
        &self,
        job_id: &JobId,
        clip_file: &str,
        wallet: &str,
        unlock_request_id: &str,
        available_credits: u64,
        idempotency_ttl_secs: u64,
    ) -> Result<TryConsumeOutcome, JobStoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");

        if let Some(existing) = inner
            .idempotency
            .get(unlock_request_id)
            .filter(|e| e.live())
        {
            return Ok(TryConsumeOutcome::Replay(existing.value.clone()));
        }

        let clip_key = (job_id.as_str().to_string(), clip_file.to_string());
        if inner.clip_unlocks.get(&clip_key).copied().unwrap_or(false) {
            let replay = IdempotencyResult {
                unlocked: true,
                charged_credits: 0,
                idempotency: super::Idempotency::Replay,
                status: super::IdempotencyStatus::Final,
            };
            inner.idempotency.insert(
                unlock_request_id.to_string(),
                Expiring::new(replay.clone(), Some(idempotency_ttl_secs)),
            );
            return Ok(TryConsumeOutcome::Replay(replay));
        }

        let spent = inner.wallet_spend.get(wallet).copied().unwrap_or(0);
        if spent + 1 > available_credits {
            return Ok(TryConsumeOutcome::InsufficientCredits);
        }

        inner.wallet_spend.insert(wallet.to_string(), spent + 1);
        inner.clip_unlocks.insert(clip_key, true);
        let result = IdempotencyResult {
            unlocked: true,
            charged_credits: 1,
            idempotency: super::Idempotency::New,
            status: super::IdempotencyStatus::Final,
        };
        inner.idempotency.insert(
            unlock_request_id.to_string(),
            Expiring::new(result.clone(), Some(idempotency_ttl_secs)),
        );
        Ok(TryConsumeOutcome::New(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_id() -> JobId {
        JobId::generate(1_700_000_000_000)
    }

    #[tokio::test]
    async fn try_consume_credit_charges_once_and_replays_after() {
        let store = MemoryJobStore::new();
        let job = job_id();

        let first = store
            .try_consume_credit(&job, "clip_1.mp4", "wallet1", "req-1", 5, 300)
            .await
            .unwrap();
        assert!(matches!(first, TryConsumeOutcome::New(_)));
        assert_eq!(store.get_wallet_spend("wallet1").await.unwrap(), 1);

        let replay = store
            .try_consume_credit(&job, "clip_1.mp4", "wallet1", "req-1", 5, 300)
            .await
            .unwrap();
        assert!(matches!(replay, TryConsumeOutcome::Replay(_)));
        assert_eq!(store.get_wallet_spend("wallet1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn try_consume_credit_rejects_when_insufficient() {
        let store = MemoryJobStore::new();
        let job = job_id();
        store
            .try_consume_credit(&job, "clip_1.mp4", "wallet1", "req-1", 1, 300)
            .await
            .unwrap();

        let outcome = store
            .try_consume_credit(&job, "clip_2.mp4", "wallet1", "req-2", 1, 300)
            .await
            .unwrap();
        assert!(matches!(outcome, TryConsumeOutcome::InsufficientCredits));
    }

    #[tokio::test]
    async fn job_merge_applies_only_present_fields() {
        let store = MemoryJobStore::new();
        let job = job_id();
        store
            .create_job(&JobRecord::queued(job.clone(), "tok".into(), 1000))
            .await
            .unwrap();

        let merged = store
            .merge_job(
                &job,
                JobPatch {
                    progress: Some(42),
                    ..Default::default()
                },
                2000,
            )
            .await
            .unwrap();
        assert_eq!(merged.progress, 42);
        assert_eq!(merged.status, JobStatus::Queued);
        assert_eq!(merged.stage, JobStage::Download);
    }
}
