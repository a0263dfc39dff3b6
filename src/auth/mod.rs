//! Wallet authentication: a challenge/verify handshake proving control of a
//! Solana wallet without ever asking for a private key.
//!
//! The caller requests a one-time challenge string tied to their wallet
//! address, signs it with their wallet (ed25519, the same keypair Solana
//! transactions use), and exchanges the signature for a bearer auth token.

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature as DalekSignature, Verifier, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::ids::HexSecret;
use crate::job_store::{AUTH_NONCE_TTL_SECS, AUTH_TOKEN_TTL_SECS, AuthNonceRecord, JobStore, JobStoreError};

/// The result of issuing a challenge: the wire response carries both the
/// full challenge string and its constituent nonce, since the client signs
/// the former but presents the latter back to `verify`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Challenge {
    pub wallet_address: String,
    pub challenge: String,
    pub nonce: String,
    pub expires_in: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("wallet address is not a valid base58 public key")]
    InvalidWallet,
    #[error("no pending challenge for this wallet, or it has expired")]
    ChallengeExpired,
    #[error("signature does not verify against the issued challenge")]
    BadSignature,
    #[error("signature is not valid base58/hex or is not 64 bytes")]
    MalformedSignature,
    #[error("store error: {0}")]
    Store(#[from] JobStoreError),
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

pub struct AuthService {
    store: Arc<dyn JobStore>,
}

impl AuthService {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Issues a fresh challenge for `wallet` and stores it for later
    /// verification. The challenge text embeds the wallet address and a
    /// random nonce so a signature can't be replayed against a different
    /// wallet or re-used verbatim after expiry.
    pub async fn challenge(&self, wallet: &str) -> Result<Challenge, AuthError> {
        validate_wallet(wallet)?;
        let mut nonce_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = hex::encode(nonce_bytes);
        let timestamp: DateTime<Utc> = DateTime::from_timestamp(now_secs() as i64, 0)
            .expect("current unix time fits in a DateTime<Utc>");
        let challenge = format!("KANGKLIP_AUTH:{wallet}:{nonce}:{}", timestamp.to_rfc3339());
        let expires_at = now_secs() + AUTH_NONCE_TTL_SECS;
        self.store
            .set_auth_nonce(
                &nonce,
                &AuthNonceRecord {
                    wallet: wallet.to_string(),
                    challenge: challenge.clone(),
                    expires_at,
                },
                AUTH_NONCE_TTL_SECS,
            )
            .await?;
        Ok(Challenge {
            wallet_address: wallet.to_string(),
            challenge,
            nonce,
            expires_in: AUTH_NONCE_TTL_SECS,
        })
    }

    /// Verifies `signature` (base58-encoded, 64 bytes) against the
    /// challenge previously issued under `nonce`, and if it checks out,
    /// mints and stores a bearer auth token bound to `wallet`.
    pub async fn verify(&self, wallet: &str, nonce: &str, signature: &str) -> Result<String, AuthError> {
        let pubkey_bytes = validate_wallet(wallet)?;
        let record = self
            .store
            .get_auth_nonce(nonce)
            .await?
            .ok_or(AuthError::ChallengeExpired)?;
        if record.expires_at < now_secs() {
            self.store.delete_auth_nonce(nonce).await?;
            return Err(AuthError::ChallengeExpired);
        }
        if record.wallet != wallet {
            return Err(AuthError::ChallengeExpired);
        }

        let verifying_key =
            VerifyingKey::from_bytes(&pubkey_bytes).map_err(|_| AuthError::InvalidWallet)?;
        let sig_bytes: [u8; 64] = bs58::decode(signature)
            .into_vec()
            .map_err(|_| AuthError::MalformedSignature)?
            .try_into()
            .map_err(|_| AuthError::MalformedSignature)?;
        let signature = DalekSignature::from_bytes(&sig_bytes);
        verifying_key
            .verify(record.challenge.as_bytes(), &signature)
            .map_err(|_| AuthError::BadSignature)?;

        self.store.delete_auth_nonce(nonce).await?;

        let token = HexSecret::generate();
        self.store
            .set_auth_token(token.as_str(), wallet, AUTH_TOKEN_TTL_SECS)
            .await?;
        Ok(token.as_str().to_string())
    }

    /// Resolves a bearer auth token to the wallet it was issued for.
    pub async fn resolve_token(&self, token: &str) -> Result<Option<String>, AuthError> {
        Ok(self.store.get_auth_token(token).await?)
    }
}

fn validate_wallet(wallet: &str) -> Result<[u8; 32], AuthError> {
    bs58::decode(wallet)
        .into_vec()
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(AuthError::InvalidWallet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::MemoryJobStore;
    use ed25519_dalek::{Signer, SigningKey};

    fn wallet_keypair() -> (SigningKey, String) {
        let signing_key = SigningKey::from_bytes(&[7u8; 32]);
        let address = bs58::encode(signing_key.verifying_key().to_bytes()).into_string();
        (signing_key, address)
    }

    #[tokio::test]
    async fn challenge_then_verify_round_trips_to_a_token() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let auth = AuthService::new(store);
        let (signing_key, wallet) = wallet_keypair();

        let issued = auth.challenge(&wallet).await.unwrap();
        let signature = signing_key.sign(issued.challenge.as_bytes());
        let signature_b58 = bs58::encode(signature.to_bytes()).into_string();

        let token = auth.verify(&wallet, &issued.nonce, &signature_b58).await.unwrap();
        assert_eq!(auth.resolve_token(&token).await.unwrap().as_deref(), Some(wallet.as_str()));
    }

    #[tokio::test]
    async fn verify_rejects_signature_from_a_different_wallet() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let auth = AuthService::new(store);
        let (_signing_key, wallet) = wallet_keypair();
        let (other_signing_key, _other_wallet) = {
            let signing_key = SigningKey::from_bytes(&[9u8; 32]);
            let address = bs58::encode(signing_key.verifying_key().to_bytes()).into_string();
            (signing_key, address)
        };

        let issued = auth.challenge(&wallet).await.unwrap();
        let bad_signature = other_signing_key.sign(issued.challenge.as_bytes());
        let bad_signature_b58 = bs58::encode(bad_signature.to_bytes()).into_string();

        let result = auth.verify(&wallet, &issued.nonce, &bad_signature_b58).await;
        assert!(matches!(result, Err(AuthError::BadSignature)));
    }
}
