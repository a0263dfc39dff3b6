//! The credit service: all interaction with the on-chain credit ledger.
//!
//! Balance reads and `consume_credit` submission are delegated to
//! [`SolanaProvider`]; this module adds the request-shaping logic spec'd for
//! the HTTP surface (topup intent construction, topup confirmation against
//! the set-once [`TopupSignature`] marker) and the error taxonomy that maps
//! chain/store failures onto [`ApiError`].

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use solana_pubkey::Pubkey;
use std::sync::Arc;

use crate::chain::{ChainError, SolanaProvider};
use crate::chain::solana::{pay_usdc_instruction_data, parse_signature};
use crate::config::bound_defaults::CREDIT_UNIT_BASE_UNITS;
use crate::errors::ApiError;
use crate::job_store::{JobStore, JobStoreError};

#[derive(Debug, thiserror::Error)]
pub enum CreditError {
    #[error("credits_to_buy must be a positive integer")]
    InvalidAmount,
    #[error("invalid transaction signature")]
    InvalidSignature,
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

impl From<CreditError> for ApiError {
    fn from(err: CreditError) -> Self {
        match err {
            CreditError::InvalidAmount | CreditError::InvalidSignature => {
                ApiError::validation(err.to_string())
            }
            CreditError::Chain(ChainError::TransactionFailed(_))
            | CreditError::Chain(ChainError::ProgramNotInvoked(_)) => {
                ApiError::validation(err.to_string())
            }
            CreditError::Chain(_) => ApiError::upstream(err.to_string()),
            CreditError::Store(_) => ApiError::internal(err.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TopupIntent {
    pub program_id: String,
    pub config_pda: String,
    pub user_credit_pda: String,
    pub vault_ata: String,
    pub user_ata: String,
    pub mint: String,
    pub instruction_data_base64: String,
    pub amount_base_units: u64,
    pub credit_unit: u64,
}

#[derive(Debug, Serialize)]
pub struct TopupConfirmResult {
    pub credited: bool,
    pub new_balance: u64,
}

pub struct CreditService {
    chain: Arc<SolanaProvider>,
    store: Arc<dyn JobStore>,
}

impl CreditService {
    pub fn new(chain: Arc<SolanaProvider>, store: Arc<dyn JobStore>) -> Self {
        Self { chain, store }
    }

    /// The caller's current on-chain credit balance — also the
    /// `availableCredits` bound fed into the unlock coordinator's scripted
    /// primitive, always re-read fresh rather than cached.
    pub async fn balance(&self, wallet: &Pubkey) -> Result<u64, CreditError> {
        Ok(self.chain.get_user_credits(wallet).await?)
    }

    pub fn build_topup_intent(&self, wallet: &Pubkey, credits_to_buy: u64) -> Result<TopupIntent, CreditError> {
        if credits_to_buy == 0 {
            return Err(CreditError::InvalidAmount);
        }
        let amount_base_units = credits_to_buy
            .checked_mul(CREDIT_UNIT_BASE_UNITS)
            .ok_or(CreditError::InvalidAmount)?;
        let (config_pda, _) = self.chain.config_pda();
        let (user_credit_pda, _) = self.chain.user_credit_pda(wallet);
        let data = pay_usdc_instruction_data(amount_base_units);
        Ok(TopupIntent {
            program_id: self.chain.credits_program_id().to_string(),
            config_pda: config_pda.to_string(),
            user_credit_pda: user_credit_pda.to_string(),
            vault_ata: self.chain.vault_usdc_ata().to_string(),
            user_ata: self.chain.user_usdc_ata(wallet).to_string(),
            mint: self.chain.usdc_mint().to_string(),
            instruction_data_base64: BASE64.encode(data),
            amount_base_units,
            credit_unit: CREDIT_UNIT_BASE_UNITS,
        })
    }

    /// Marks `signature` as observed (set-once) and, the first time it's
    /// seen, verifies the transaction actually succeeded and invoked the
    /// credits program before trusting it. Never credits anything
    /// off-chain: the chain remains the ledger of record, and the returned
    /// balance is always a fresh on-chain read.
    pub async fn confirm_topup(&self, wallet: &Pubkey, signature_str: &str) -> Result<TopupConfirmResult, CreditError> {
        let signature = parse_signature(signature_str).map_err(|_| CreditError::InvalidSignature)?;
        let newly_marked = self.store.set_topup_signature_if_absent(signature_str).await?;
        if newly_marked {
            self.chain
                .verify_transaction_invokes_credits_program(&signature)
                .await?;
        }
        let new_balance = self.balance(wallet).await?;
        Ok(TopupConfirmResult {
            credited: true,
            new_balance,
        })
    }

    /// Debits exactly 1 credit on chain, tagging the transaction with
    /// `unlock_request_id` as its memo so the debit is traceable back to the
    /// unlock it paid for.
    pub async fn consume_one_credit(&self, wallet: &Pubkey, unlock_request_id: &str) -> Result<String, CreditError> {
        let signature = self
            .chain
            .consume_credit(wallet, 1, unlock_request_id)
            .await?;
        Ok(signature.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::job_store::MemoryJobStore;
    use solana_keypair::Keypair;
    use solana_signer::Signer;
    use std::str::FromStr;

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

    fn test_service() -> (CreditService, Pubkey) {
        let config = test_config();
        let spender = Keypair::new();
        let chain = Arc::new(SolanaProvider::new(&config, &spender.to_bytes()).unwrap());
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        (CreditService::new(chain, store), Pubkey::new_unique())
    }

    #[test]
    fn topup_intent_rejects_zero_credits() {
        let (service, wallet) = test_service();
        assert!(matches!(
            service.build_topup_intent(&wallet, 0),
            Err(CreditError::InvalidAmount)
        ));
    }

    #[test]
    fn topup_intent_encodes_amount_and_instruction_data() {
        let (service, wallet) = test_service();
        let intent = service.build_topup_intent(&wallet, 5).unwrap();
        assert_eq!(intent.amount_base_units, 500_000);
        assert_eq!(intent.credit_unit, 100_000);
        let decoded = BASE64.decode(&intent.instruction_data_base64).unwrap();
        assert_eq!(&decoded[..8], &crate::chain::solana::instruction_discriminator("pay_usdc"));
        assert_eq!(&decoded[8..], &500_000u64.to_le_bytes());
        assert!(Pubkey::from_str(&intent.config_pda).is_ok());
    }
}
