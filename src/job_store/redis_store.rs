//! Redis-backed [`JobStore`].
//!
//! Everything except `try_consume_credit` is a direct `GET`/`SET EX`/`INCR`
//! against a `ConnectionManager` (auto-reconnecting, cheap to clone — the
//! same shape the teacher reaches for an RPC client it expects to hold for
//! the life of the process). `try_consume_credit` is the one place two
//! requests can race each other, so it runs as a single Lua script: Redis
//! executes scripts atomically, which gets us the equivalent of a
//! compare-and-swap across three keys without a client-side transaction.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::{Client, Script};

use super::{
    AuthNonceRecord, IdempotencyResult, JobPatch, JobRecord, JobStore, JobStoreError,
    TryConsumeOutcome, UnlockPending,
};
use crate::ids::JobId;

const TRY_CONSUME_CREDIT_SCRIPT: &str = r#"
local idem_key = KEYS[1]
local clip_key = KEYS[2]
local spend_key = KEYS[3]
local available = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])

local existing = redis.call('GET', idem_key)
if existing then
  return {1, existing}
end

local already_unlocked = redis.call('GET', clip_key)
if already_unlocked then
  local body = '{"unlocked":true,"charged_credits":0,"idempotency":"replay","status":"final"}'
  redis.call('SET', idem_key, body, 'EX', ttl)
  return {1, body}
end

local spent = tonumber(redis.call('GET', spend_key) or '0')
if spent + 1 > available then
  return {2, ''}
end

redis.call('INCR', spend_key)
redis.call('SET', clip_key, '1')
local body = '{"unlocked":true,"charged_credits":1,"idempotency":"new","status":"final"}'
redis.call('SET', idem_key, body, 'EX', ttl)
return {0, body}
"#;

pub struct RedisJobStore {
    conn: ConnectionManager,
    script: Script,
}

impl RedisJobStore {
    pub async fn connect(redis_url: &str) -> Result<Self, JobStoreError> {
        let client =
            Client::open(redis_url).map_err(|e| JobStoreError::Unavailable(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| JobStoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            conn,
            script: Script::new(TRY_CONSUME_CREDIT_SCRIPT),
        })
    }

    fn job_key(job_id: &JobId) -> String {
        format!("job:{job_id}")
    }

    fn clip_unlock_key(job_id: &JobId, clip_file: &str) -> String {
        format!("clip_unlock:{job_id}:{clip_file}")
    }

    fn wallet_spend_key(wallet: &str) -> String {
        format!("wallet_spend:{wallet}")
    }

    fn idempotency_key(unlock_request_id: &str) -> String {
        format!("idempotency:{unlock_request_id}")
    }

    fn unlock_pending_key(unlock_request_id: &str) -> String {
        format!("unlock_pending:{unlock_request_id}")
    }

    fn auth_nonce_key(nonce: &str) -> String {
        format!("auth_nonce:{nonce}")
    }

    fn auth_token_key(token: &str) -> String {
        format!("auth_token:{token}")
    }

    fn topup_signature_key(signature: &str) -> String {
        format!("topup_sig:{signature}")
    }

    fn decode<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, JobStoreError> {
        serde_json::from_str(raw).map_err(|e| JobStoreError::Decode(e.to_string()))
    }

    fn encode<T: serde::Serialize>(value: &T) -> Result<String, JobStoreError> {
        serde_json::to_string(value).map_err(|e| JobStoreError::Decode(e.to_string()))
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn create_job(&self, record: &JobRecord) -> Result<(), JobStoreError> {
        let mut conn = self.conn.clone();
        let body = Self::encode(record)?;
        conn.set::<_, _, ()>(Self::job_key(&record.job_id), body)
            .await
            .map_err(|e| JobStoreError::Unavailable(e.to_string()))
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(Self::job_key(job_id))
            .await
            .map_err(|e| JobStoreError::Unavailable(e.to_string()))?;
        raw.map(|r| Self::decode(&r)).transpose()
    }

    async fn merge_job(
        &self,
        job_id: &JobId,
        patch: JobPatch,
        now_millis: u64,
    ) -> Result<JobRecord, JobStoreError> {
        let mut record = self
            .get_job(job_id)
            .await?
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
        self.create_job(&record).await?;
        Ok(record)
    }

    async fn get_clip_unlock(&self, job_id: &JobId, clip_file: &str) -> Result<bool, JobStoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(Self::clip_unlock_key(job_id, clip_file))
            .await
            .map_err(|e| JobStoreError::Unavailable(e.to_string()))?;
        Ok(raw.is_some())
    }

    async fn set_clip_unlock(&self, job_id: &JobId, clip_file: &str) -> Result<(), JobStoreError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(Self::clip_unlock_key(job_id, clip_file), "1")
            .await
            .map_err(|e| JobStoreError::Unavailable(e.to_string()))
    }

    async fn get_wallet_spend(&self, wallet: &str) -> Result<u64, JobStoreError> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = conn
            .get(Self::wallet_spend_key(wallet))
            .await
            .map_err(|e| JobStoreError::Unavailable(e.to_string()))?;
        Ok(value.unwrap_or(0))
    }

    async fn incr_wallet_spend(&self, wallet: &str, by: u64) -> Result<u64, JobStoreError> {
        let mut conn = self.conn.clone();
        conn.incr(Self::wallet_spend_key(wallet), by)
            .await
            .map_err(|e| JobStoreError::Unavailable(e.to_string()))
    }

    async fn get_idempotency(
        &self,
        unlock_request_id: &str,
    ) -> Result<Option<IdempotencyResult>, JobStoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(Self::idempotency_key(unlock_request_id))
            .await
            .map_err(|e| JobStoreError::Unavailable(e.to_string()))?;
        raw.map(|r| Self::decode(&r)).transpose()
    }

    async fn set_idempotency(
        &self,
        unlock_request_id: &str,
        value: &IdempotencyResult,
        ttl_secs: u64,
    ) -> Result<(), JobStoreError> {
        let mut conn = self.conn.clone();
        let body = Self::encode(value)?;
        conn.set_ex::<_, _, ()>(Self::idempotency_key(unlock_request_id), body, ttl_secs)
            .await
            .map_err(|e| JobStoreError::Unavailable(e.to_string()))
    }

    async fn set_idempotency_if_absent(
        &self,
        unlock_request_id: &str,
        value: &IdempotencyResult,
        ttl_secs: u64,
    ) -> Result<bool, JobStoreError> {
        let mut conn = self.conn.clone();
        let body = Self::encode(value)?;
        let opts = redis::SetOptions::default()
            .conditional_set(redis::ExistenceCheck::NX)
            .with_expiration(redis::SetExpiry::EX(ttl_secs as i64 as u64));
        let result: Option<String> = conn
            .set_options(Self::idempotency_key(unlock_request_id), body, opts)
            .await
            .map_err(|e| JobStoreError::Unavailable(e.to_string()))?;
        Ok(result.is_some())
    }

    async fn get_unlock_pending(
        &self,
        unlock_request_id: &str,
    ) -> Result<Option<UnlockPending>, JobStoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(Self::unlock_pending_key(unlock_request_id))
            .await
            .map_err(|e| JobStoreError::Unavailable(e.to_string()))?;
        raw.map(|r| Self::decode(&r)).transpose()
    }

    async fn set_unlock_pending(
        &self,
        unlock_request_id: &str,
        value: &UnlockPending,
        ttl_secs: u64,
    ) -> Result<(), JobStoreError> {
        let mut conn = self.conn.clone();
        let body = Self::encode(value)?;
        conn.set_ex::<_, _, ()>(Self::unlock_pending_key(unlock_request_id), body, ttl_secs)
            .await
            .map_err(|e| JobStoreError::Unavailable(e.to_string()))
    }

    async fn delete_unlock_pending(&self, unlock_request_id: &str) -> Result<(), JobStoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::unlock_pending_key(unlock_request_id))
            .await
            .map_err(|e| JobStoreError::Unavailable(e.to_string()))
    }

    async fn set_auth_nonce(
        &self,
        nonce: &str,
        value: &AuthNonceRecord,
        ttl_secs: u64,
    ) -> Result<(), JobStoreError> {
        let mut conn = self.conn.clone();
        let body = Self::encode(value)?;
        conn.set_ex::<_, _, ()>(Self::auth_nonce_key(nonce), body, ttl_secs)
            .await
            .map_err(|e| JobStoreError::Unavailable(e.to_string()))
    }

    async fn get_auth_nonce(&self, nonce: &str) -> Result<Option<AuthNonceRecord>, JobStoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(Self::auth_nonce_key(nonce))
            .await
            .map_err(|e| JobStoreError::Unavailable(e.to_string()))?;
        raw.map(|r| Self::decode(&r)).transpose()
    }

    async fn delete_auth_nonce(&self, nonce: &str) -> Result<(), JobStoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::auth_nonce_key(nonce))
            .await
            .map_err(|e| JobStoreError::Unavailable(e.to_string()))
    }

    async fn set_auth_token(
        &self,
        token: &str,
        wallet: &str,
        ttl_secs: u64,
    ) -> Result<(), JobStoreError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(Self::auth_token_key(token), wallet, ttl_secs)
            .await
            .map_err(|e| JobStoreError::Unavailable(e.to_string()))
    }

    async fn get_auth_token(&self, token: &str) -> Result<Option<String>, JobStoreError> {
        let mut conn = self.conn.clone();
        conn.get(Self::auth_token_key(token))
            .await
            .map_err(|e| JobStoreError::Unavailable(e.to_string()))
    }

    async fn set_topup_signature_if_absent(&self, signature: &str) -> Result<bool, JobStoreError> {
        let mut conn = self.conn.clone();
        let set: bool = conn
            .set_nx(Self::topup_signature_key(signature), "1")
            .await
            .map_err(|e| JobStoreError::Unavailable(e.to_string()))?;
        Ok(set)
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
        let mut conn = self.conn.clone();
        let (code, body): (i64, String) = self
            .script
            .key(Self::idempotency_key(unlock_request_id))
            .key(Self::clip_unlock_key(job_id, clip_file))
            .key(Self::wallet_spend_key(wallet))
            .arg(available_credits)
            .arg(idempotency_ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| JobStoreError::Unavailable(e.to_string()))?;

        match code {
            0 => Ok(TryConsumeOutcome::New(Self::decode(&body)?)),
            1 => Ok(TryConsumeOutcome::Replay(Self::decode(&body)?)),
            2 => Ok(TryConsumeOutcome::InsufficientCredits),
            other => Err(JobStoreError::Decode(format!(
                "unexpected try_consume_credit script result code: {other}"
            ))),
        }
    }
}
