//! The per-clip unlock state machine (spec.md §4.5): `Absent -> Pending ->
//! Final(New) | Final(Replay) | Final(Insufficient)`, keyed by the caller's
//! `unlockRequestId`.
//!
//! The on-chain `consume_credit` submission sits between claiming the
//! `IdempotencyResult` slot (step 4) and committing the unlock (step 8), so
//! the commit itself can't be folded into a single compare-and-swap the way
//! [`crate::job_store::JobStore::try_consume_credit`] models the simpler
//! same-instant case — `WalletSpend` is bookkeeping only (I4), reconciled
//! against a fresh on-chain read rather than gating the decision; the chain
//! program is what actually refuses an overdrawn debit.

use serde::Serialize;
use solana_pubkey::Pubkey;
use std::sync::Arc;

use crate::credit::{CreditError, CreditService};
use crate::errors::ApiError;
use crate::ids::JobId;
use crate::job_store::{
    Idempotency, IdempotencyResult, IdempotencyStatus, JobStore, JobStoreError, UNLOCK_PENDING_TTL_SECS,
    UnlockPending,
};

const IDEMPOTENCY_TTL_SECS: u64 = crate::job_store::IDEMPOTENCY_TTL_SECS;

#[derive(Debug, thiserror::Error)]
pub enum UnlockError {
    #[error("an unlock is already in progress for this request")]
    InProgress,
    #[error("insufficient on-chain credits")]
    InsufficientCredits,
    #[error(transparent)]
    Credit(#[from] CreditError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

impl From<UnlockError> for ApiError {
    fn from(err: UnlockError) -> Self {
        match err {
            UnlockError::InProgress => ApiError::conflict(err.to_string()),
            UnlockError::InsufficientCredits => ApiError::payment_required(err.to_string()),
            UnlockError::Credit(CreditError::Chain(_)) => ApiError::upstream(err.to_string()),
            UnlockError::Credit(e) => e.into(),
            UnlockError::Store(_) => ApiError::internal(err.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UnlockResponse {
    pub job_id: JobId,
    pub clip_file: String,
    pub unlocked: bool,
    pub charged_credits: u8,
    pub idempotency: Idempotency,
}

fn to_response(job_id: &JobId, clip_file: &str, result: IdempotencyResult) -> UnlockResponse {
    UnlockResponse {
        job_id: job_id.clone(),
        clip_file: clip_file.to_string(),
        unlocked: result.unlocked,
        charged_credits: result.charged_credits,
        idempotency: result.idempotency,
    }
}

fn replay(charged: u8) -> IdempotencyResult {
    IdempotencyResult {
        unlocked: true,
        charged_credits: charged,
        idempotency: Idempotency::Replay,
        status: IdempotencyStatus::Final,
    }
}

fn terminal_new(unlocked: bool, charged: u8) -> IdempotencyResult {
    IdempotencyResult {
        unlocked,
        charged_credits: charged,
        idempotency: Idempotency::New,
        status: IdempotencyStatus::Final,
    }
}

pub struct UnlockCoordinator {
    store: Arc<dyn JobStore>,
    credit: Arc<CreditService>,
}

impl UnlockCoordinator {
    pub fn new(store: Arc<dyn JobStore>, credit: Arc<CreditService>) -> Self {
        Self { store, credit }
    }

    pub async fn unlock(
        &self,
        job_id: &JobId,
        clip_file: &str,
        wallet: &Pubkey,
        wallet_address: &str,
        unlock_request_id: &str,
    ) -> Result<UnlockResponse, UnlockError> {
        // 1. Recover pending: a prior attempt under this request id reached
        // on-chain submission before the process died before committing.
        if let Some(pending) = self.store.get_unlock_pending(unlock_request_id).await? {
            if pending.job_id == *job_id && pending.clip_file == clip_file {
                self.store.set_clip_unlock(job_id, clip_file).await?;
                self.store.delete_unlock_pending(unlock_request_id).await?;
                let result = replay(0);
                self.store
                    .set_idempotency(unlock_request_id, &result, IDEMPOTENCY_TTL_SECS)
                    .await?;
                return Ok(to_response(job_id, clip_file, result));
            }
        }

        // 2. Fast path: this request id has already reached a final state.
        // Must run before the generic clip-unlock check below — a replay of
        // the request that actually charged has to return its own stored
        // outcome, not a freshly synthesized zero-charge replay.
        if let Some(existing) = self.store.get_idempotency(unlock_request_id).await? {
            return match existing.status {
                IdempotencyStatus::Final => Ok(to_response(job_id, clip_file, existing)),
                IdempotencyStatus::Pending => Err(UnlockError::InProgress),
            };
        }

        // 3. Fast path: already unlocked by some earlier request id.
        if self.store.get_clip_unlock(job_id, clip_file).await? {
            let result = replay(0);
            self.store
                .set_idempotency(unlock_request_id, &result, IDEMPOTENCY_TTL_SECS)
                .await?;
            return Ok(to_response(job_id, clip_file, result));
        }

        // 4. Begin: claim the idempotency slot for this request id.
        let began = self
            .store
            .set_idempotency_if_absent(unlock_request_id, &IdempotencyResult::pending(), IDEMPOTENCY_TTL_SECS)
            .await?;
        if !began {
            let existing = self
                .store
                .get_idempotency(unlock_request_id)
                .await?
                .unwrap_or_else(IdempotencyResult::pending);
            return match existing.status {
                IdempotencyStatus::Final => Ok(to_response(job_id, clip_file, existing)),
                IdempotencyStatus::Pending => Err(UnlockError::InProgress),
            };
        }

        // 5. Funding check.
        let credits = self.credit.balance(wallet).await?;
        if credits < 1 {
            let result = terminal_new(false, 0);
            self.store
                .set_idempotency(unlock_request_id, &result, IDEMPOTENCY_TTL_SECS)
                .await?;
            return Err(UnlockError::InsufficientCredits);
        }

        // 6. Submit on chain.
        let tx_sig = match self.credit.consume_one_credit(wallet, unlock_request_id).await {
            Ok(sig) => sig,
            Err(err) => {
                let remaining = self.credit.balance(wallet).await.unwrap_or(0);
                let result = terminal_new(false, 0);
                self.store
                    .set_idempotency(unlock_request_id, &result, IDEMPOTENCY_TTL_SECS)
                    .await?;
                return if remaining < 1 {
                    Err(UnlockError::InsufficientCredits)
                } else {
                    Err(UnlockError::Credit(err))
                };
            }
        };

        // 7. Record pending: the crash-recovery record for step 1.
        self.store
            .set_unlock_pending(
                unlock_request_id,
                &UnlockPending {
                    job_id: job_id.clone(),
                    clip_file: clip_file.to_string(),
                    wallet: wallet_address.to_string(),
                    tx_sig,
                },
                UNLOCK_PENDING_TTL_SECS,
            )
            .await?;

        // 8. Commit.
        self.store.set_clip_unlock(job_id, clip_file).await?;
        self.store.delete_unlock_pending(unlock_request_id).await?;
        self.store.incr_wallet_spend(wallet_address, 1).await?;
        let result = terminal_new(true, 1);
        self.store
            .set_idempotency(unlock_request_id, &result, IDEMPOTENCY_TTL_SECS)
            .await?;
        Ok(to_response(job_id, clip_file, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::SolanaProvider;
    use crate::config::Config;
    use crate::job_store::{JobRecord, MemoryJobStore};
    use solana_keypair::Keypair;
    use solana_signer::Signer;

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
            usdc_mint: Pubkey::new_unique().to_string(),
            treasury_address: Pubkey::new_unique().to_string(),
            credits_program_id: Pubkey::new_unique().to_string(),
            spender_keypair: "[]".to_string(),
        }
    }

    #[tokio::test]
    async fn replaying_an_unlock_request_returns_the_same_final_body() {
        let config = test_config();
        let spender = Keypair::new();
        let chain = Arc::new(SolanaProvider::new(&config, &spender.to_bytes()).unwrap());
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let credit = Arc::new(CreditService::new(chain, store.clone()));
        let coordinator = UnlockCoordinator::new(store.clone(), credit);

        let job_id = JobId::generate(1_700_000_000_000);
        store
            .create_job(&JobRecord::queued(job_id.clone(), "tok".into(), 1000))
            .await
            .unwrap();
        // Simulate a clip that's already unlocked from an earlier request.
        store.set_clip_unlock(&job_id, "clip_1.mp4").await.unwrap();

        let wallet = Pubkey::new_unique();
        let first = coordinator
            .unlock(&job_id, "clip_1.mp4", &wallet, &wallet.to_string(), "req-1")
            .await
            .unwrap();
        assert_eq!(first.charged_credits, 0);
        assert!(first.unlocked);

        let replay = coordinator
            .unlock(&job_id, "clip_1.mp4", &wallet, &wallet.to_string(), "req-1")
            .await
            .unwrap();
        assert_eq!(replay.charged_credits, first.charged_credits);
        assert_eq!(replay.unlocked, first.unlocked);
    }

    #[tokio::test]
    async fn a_pending_request_id_rejects_concurrent_retries_with_conflict() {
        let config = test_config();
        let spender = Keypair::new();
        let chain = Arc::new(SolanaProvider::new(&config, &spender.to_bytes()).unwrap());
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let credit = Arc::new(CreditService::new(chain, store.clone()));
        let coordinator = UnlockCoordinator::new(store.clone(), credit);

        let job_id = JobId::generate(1_700_000_000_000);
        store
            .create_job(&JobRecord::queued(job_id.clone(), "tok".into(), 1000))
            .await
            .unwrap();
        let wallet = Pubkey::new_unique();

        // Another in-flight request already claimed this id (step 4) and
        // hasn't reached a final state yet.
        store
            .set_idempotency_if_absent(
                "req-1",
                &IdempotencyResult::pending(),
                IDEMPOTENCY_TTL_SECS,
            )
            .await
            .unwrap();

        let result = coordinator
            .unlock(&job_id, "clip_1.mp4", &wallet, &wallet.to_string(), "req-1")
            .await;
        assert!(matches!(result, Err(UnlockError::InProgress)));
    }

    #[tokio::test]
    async fn replaying_a_charging_request_returns_its_original_new_result() {
        let config = test_config();
        let spender = Keypair::new();
        let chain = Arc::new(SolanaProvider::new(&config, &spender.to_bytes()).unwrap());
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let credit = Arc::new(CreditService::new(chain, store.clone()));
        let coordinator = UnlockCoordinator::new(store.clone(), credit);

        let job_id = JobId::generate(1_700_000_000_000);
        store
            .create_job(&JobRecord::queued(job_id.clone(), "tok".into(), 1000))
            .await
            .unwrap();
        let wallet = Pubkey::new_unique();

        // Simulate the end state of a completed charge (steps 4-8): the clip
        // is unlocked and this request id's own idempotency record is New.
        store.set_clip_unlock(&job_id, "clip_1.mp4").await.unwrap();
        let original = terminal_new(true, 1);
        store
            .set_idempotency("req-1", &original, IDEMPOTENCY_TTL_SECS)
            .await
            .unwrap();

        let replay = coordinator
            .unlock(&job_id, "clip_1.mp4", &wallet, &wallet.to_string(), "req-1")
            .await
            .unwrap();
        assert_eq!(replay.charged_credits, 1);
        assert!(matches!(replay.idempotency, Idempotency::New));
        assert!(replay.unlocked);
    }

    #[tokio::test]
    async fn a_finalized_request_id_replays_its_stored_outcome() {
        let config = test_config();
        let spender = Keypair::new();
        let chain = Arc::new(SolanaProvider::new(&config, &spender.to_bytes()).unwrap());
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let credit = Arc::new(CreditService::new(chain, store.clone()));
        let coordinator = UnlockCoordinator::new(store.clone(), credit);

        let job_id = JobId::generate(1_700_000_000_000);
        store
            .create_job(&JobRecord::queued(job_id.clone(), "tok".into(), 1000))
            .await
            .unwrap();
        let wallet = Pubkey::new_unique();

        let finalized = terminal_new(false, 0);
        store
            .set_idempotency("req-1", &finalized, IDEMPOTENCY_TTL_SECS)
            .await
            .unwrap();

        let response = coordinator
            .unlock(&job_id, "clip_1.mp4", &wallet, &wallet.to_string(), "req-1")
            .await
            .unwrap();
        assert!(!response.unlocked);
        assert_eq!(response.charged_credits, 0);
    }
}
