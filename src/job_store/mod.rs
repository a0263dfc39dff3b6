//! The job store: a Redis-backed key-value service providing get/set/merge
//! for [`JobRecord`], set-once/get for clip unlocks, incr/get for wallet
//! spend, TTL'd records for idempotency bookkeeping, and the single scripted
//! atomic primitive the unlock coordinator depends on.
//!
//! The store is expressed as a trait so the unlock coordinator and HTTP
//! handlers depend on behavior, not a concrete Redis client — mirroring the
//! way the teacher facilitator abstracts chain providers behind
//! `FromConfig`/`ProviderMap` so callers never touch a connection directly.

pub mod memory_store;
pub mod redis_store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::JobId;

pub use memory_store::MemoryJobStore;
pub use redis_store::RedisJobStore;

#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("stored record failed to decode: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    /// Ordinal used to enforce I6: Queued < Running < {Succeeded, Failed}.
    /// Succeeded and Failed are both terminal and incomparable with each
    /// other, but strictly greater than Queued/Running.
    fn rank(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Running => 1,
            JobStatus::Succeeded | JobStatus::Failed => 2,
        }
    }

    /// Whether transitioning `self` -> `next` respects the monotonic
    /// lifecycle order (I6). Staying in place is allowed (idempotent
    /// callback retries); terminal -> terminal is allowed only if equal.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self == next {
            return true;
        }
        if self.rank() == 2 {
            return false;
        }
        next.rank() >= self.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStage {
    Download,
    Transcript,
    Chunk,
    Select,
    Render,
    Upload,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub job_token: String,
    pub status: JobStatus,
    pub stage: JobStage,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub r2_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub start_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub market_cache: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl JobRecord {
    pub fn queued(job_id: JobId, job_token: String, now_millis: u64) -> Self {
        Self {
            job_id,
            job_token,
            status: JobStatus::Queued,
            stage: JobStage::Download,
            progress: 0,
            r2_prefix: None,
            run_id: None,
            start_error: None,
            error: None,
            market_cache: None,
            created_at: now_millis,
            updated_at: now_millis,
        }
    }
}

/// A callback-driven patch applied to a [`JobRecord`] (§4.7 callback protocol).
/// Only present fields are merged; absent fields leave the current value.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub stage: Option<JobStage>,
    pub progress: Option<u8>,
    pub r2_prefix: Option<String>,
    pub run_id: Option<String>,
    pub start_error: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Idempotency {
    New,
    Replay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyStatus {
    Pending,
    Final,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyResult {
    pub unlocked: bool,
    pub charged_credits: u8,
    pub idempotency: Idempotency,
    pub status: IdempotencyStatus,
}

impl IdempotencyResult {
    pub fn pending() -> Self {
        Self {
            unlocked: false,
            charged_credits: 0,
            idempotency: Idempotency::New,
            status: IdempotencyStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockPending {
    pub job_id: JobId,
    pub clip_file: String,
    pub wallet: String,
    pub tx_sig: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthNonceRecord {
    pub wallet: String,
    pub challenge: String,
    pub expires_at: u64,
}

/// Outcome of the scripted `tryConsumeCredit` primitive (spec.md §4.2).
#[derive(Debug, Clone)]
pub enum TryConsumeOutcome {
    /// Either the idempotency key already existed, or the clip was already
    /// unlocked: zero credits were charged by this call.
    Replay(IdempotencyResult),
    /// `WalletSpend(wallet) + 1` would exceed `available_credits`; no
    /// mutation was performed.
    InsufficientCredits,
    /// This call performed the unique debit-and-unlock for this request id.
    New(IdempotencyResult),
}

impl fmt::Display for TryConsumeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryConsumeOutcome::Replay(_) => write!(f, "replay"),
            TryConsumeOutcome::InsufficientCredits => write!(f, "insufficient_credits"),
            TryConsumeOutcome::New(_) => write!(f, "new"),
        }
    }
}

pub const IDEMPOTENCY_TTL_SECS: u64 = 300;
pub const UNLOCK_PENDING_TTL_SECS: u64 = 86_400;
pub const AUTH_NONCE_TTL_SECS: u64 = 300;
pub const AUTH_TOKEN_TTL_SECS: u64 = 86_400;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, record: &JobRecord) -> Result<(), JobStoreError>;
    async fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Applies `patch` to the stored record and returns the merged record.
    /// A patch that would violate I6 (status monotonicity) is rejected by
    /// the caller before this is invoked (see [`crate::dispatcher`]); the
    /// store itself just persists whatever it's given, last-writer-wins.
    async fn merge_job(
        &self,
        job_id: &JobId,
        patch: JobPatch,
        now_millis: u64,
    ) -> Result<JobRecord, JobStoreError>;

    async fn get_clip_unlock(&self, job_id: &JobId, clip_file: &str) -> Result<bool, JobStoreError>;
    async fn set_clip_unlock(&self, job_id: &JobId, clip_file: &str) -> Result<(), JobStoreError>;

    async fn get_wallet_spend(&self, wallet: &str) -> Result<u64, JobStoreError>;
    /// Monotonically increments the local wallet-spend counter (I4): an
    /// advisory record of credits this process believes it has already
    /// debited on chain, reconciled against a fresh on-chain balance read
    /// rather than enforced here.
    async fn incr_wallet_spend(&self, wallet: &str, by: u64) -> Result<u64, JobStoreError>;

    async fn get_idempotency(
        &self,
        unlock_request_id: &str,
    ) -> Result<Option<IdempotencyResult>, JobStoreError>;
    async fn set_idempotency(
        &self,
        unlock_request_id: &str,
        value: &IdempotencyResult,
        ttl_secs: u64,
    ) -> Result<(), JobStoreError>;
    /// Sets the idempotency record only if absent. Returns `true` if this
    /// call created it, `false` if one already existed.
    async fn set_idempotency_if_absent(
        &self,
        unlock_request_id: &str,
        value: &IdempotencyResult,
        ttl_secs: u64,
    ) -> Result<bool, JobStoreError>;

    async fn get_unlock_pending(
        &self,
        unlock_request_id: &str,
    ) -> Result<Option<UnlockPending>, JobStoreError>;
    async fn set_unlock_pending(
        &self,
        unlock_request_id: &str,
        value: &UnlockPending,
        ttl_secs: u64,
    ) -> Result<(), JobStoreError>;
    async fn delete_unlock_pending(&self, unlock_request_id: &str) -> Result<(), JobStoreError>;

    async fn set_auth_nonce(
        &self,
        nonce: &str,
        value: &AuthNonceRecord,
        ttl_secs: u64,
    ) -> Result<(), JobStoreError>;
    async fn get_auth_nonce(&self, nonce: &str) -> Result<Option<AuthNonceRecord>, JobStoreError>;
    async fn delete_auth_nonce(&self, nonce: &str) -> Result<(), JobStoreError>;

    async fn set_auth_token(
        &self,
        token: &str,
        wallet: &str,
        ttl_secs: u64,
    ) -> Result<(), JobStoreError>;
    async fn get_auth_token(&self, token: &str) -> Result<Option<String>, JobStoreError>;

    /// Sets the topup signature marker only if absent. Returns `true` if
    /// this call newly marked it (i.e. the caller should proceed to credit
    /// the on-chain observation), `false` if it was already marked.
    async fn set_topup_signature_if_absent(&self, signature: &str) -> Result<bool, JobStoreError>;

    /// The scripted atomic primitive from spec.md §4.2.
    async fn try_consume_credit(
        &self,
        job_id: &JobId,
        clip_file: &str,
        wallet: &str,
        unlock_request_id: &str,
        available_credits: u64,
        idempotency_ttl_secs: u64,
    ) -> Result<TryConsumeOutcome, JobStoreError>;
}
