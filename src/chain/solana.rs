//! A Solana RPC provider scoped to exactly the on-chain surface the credit
//! ledger needs: reading a `UserCredit` PDA, building/signing/submitting the
//! `consume_credit` instruction, and verifying a client-submitted `pay_usdc`
//! transaction actually touched the credits program.
//!
//! The signing and confirmation plumbing below follows the same shape as a
//! general-purpose chain provider — construct a message, sign it, send with
//! preflight skipped, poll `confirm_transaction_with_commitment` — but drops
//! the multi-chain abstraction layer and WebSocket subscription path since
//! this service only ever talks to one program on one cluster.

use sha2::{Digest, Sha256};
use solana_account::Account;
use solana_client::client_error::ClientError;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_client::SerializableTransaction;
use solana_client::rpc_config::RpcSendTransactionConfig;
use solana_commitment_config::CommitmentConfig;
use solana_instruction::{AccountMeta, Instruction};
use solana_keypair::Keypair;
use solana_message::Message;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use solana_signer::{Signer, SignerError};
use solana_transaction::versioned::VersionedTransaction;
use solana_transaction_status_client_types::{
    EncodedTransaction, UiInstruction, UiMessage, UiTransactionEncoding,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("invalid base58 public key: {0}")]
    InvalidPubkey(String),
    #[error("invalid transaction signature: {0}")]
    InvalidSignature(String),
    #[error("failed to sign transaction: {0}")]
    Signer(#[from] SignerError),
    #[error("rpc transport error: {0}")]
    Rpc(#[from] ClientError),
    #[error("account {0} has unexpected discriminator or is too short to decode")]
    BadAccountLayout(Pubkey),
    #[error("account {0} is not owned by the credits program")]
    WrongOwner(Pubkey),
    #[error("transaction not confirmed within the polling window")]
    ConfirmationTimeout,
    #[error("transaction {0} failed on-chain")]
    TransactionFailed(Signature),
    #[error("transaction {0} does not invoke the credits program")]
    ProgramNotInvoked(Signature),
}

/// Anchor-style account discriminator: first 8 bytes of
/// `sha256("account:<Name>")`.
pub fn account_discriminator(name: &str) -> [u8; 8] {
    let digest = Sha256::digest(format!("account:{name}").as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

/// Anchor-style instruction selector: first 8 bytes of
/// `sha256("global:<name>")`.
pub fn instruction_discriminator(name: &str) -> [u8; 8] {
    let digest = Sha256::digest(format!("global:{name}").as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

pub fn pay_usdc_instruction_data(amount_base_units: u64) -> Vec<u8> {
    let mut data = instruction_discriminator("pay_usdc").to_vec();
    data.extend_from_slice(&amount_base_units.to_le_bytes());
    data
}

fn consume_credit_instruction_data(amount: u64) -> Vec<u8> {
    let mut data = instruction_discriminator("consume_credit").to_vec();
    data.extend_from_slice(&amount.to_le_bytes());
    data
}

pub fn parse_pubkey(s: &str) -> Result<Pubkey, ChainError> {
    Pubkey::from_str(s).map_err(|_| ChainError::InvalidPubkey(s.to_string()))
}

pub fn parse_signature(s: &str) -> Result<Signature, ChainError> {
    Signature::from_str(s).map_err(|_| ChainError::InvalidSignature(s.to_string()))
}

/// The decoded `UserCredit` account: `[discriminator:8][owner:32][credits:8 LE]`.
#[derive(Debug, Clone, Copy)]
struct UserCreditAccount {
    owner: Pubkey,
    credits: u64,
}

const USER_CREDIT_OWNER_OFFSET: usize = 8;
const USER_CREDIT_CREDITS_OFFSET: usize = 40;
const USER_CREDIT_ACCOUNT_LEN: usize = 48;

impl UserCreditAccount {
    fn decode(pubkey: &Pubkey, account: &Account, credits_program_id: &Pubkey) -> Result<Self, ChainError> {
        if account.owner != *credits_program_id {
            return Err(ChainError::WrongOwner(*pubkey));
        }
        let data = &account.data;
        if data.len() < USER_CREDIT_ACCOUNT_LEN || data[..8] != account_discriminator("UserCredit") {
            return Err(ChainError::BadAccountLayout(*pubkey));
        }
        let owner = Pubkey::try_from(&data[USER_CREDIT_OWNER_OFFSET..USER_CREDIT_OWNER_OFFSET + 32])
            .map_err(|_| ChainError::BadAccountLayout(*pubkey))?;
        let credits = u64::from_le_bytes(
            data[USER_CREDIT_CREDITS_OFFSET..USER_CREDIT_CREDITS_OFFSET + 8]
                .try_into()
                .map_err(|_| ChainError::BadAccountLayout(*pubkey))?,
        );
        Ok(Self { owner, credits })
    }
}

/// Connection to the Solana cluster plus the fixed addresses (USDC mint,
/// treasury, credits program, spender keypair) the credit ledger operates
/// against.
pub struct SolanaProvider {
    rpc_client: RpcClient,
    spender: Arc<Keypair>,
    usdc_mint: Pubkey,
    treasury: Pubkey,
    credits_program_id: Pubkey,
}

impl SolanaProvider {
    pub fn new(config: &Config, spender_keypair_bytes: &[u8]) -> Result<Self, ChainError> {
        let spender = Keypair::try_from(spender_keypair_bytes)
            .map_err(|_| ChainError::InvalidPubkey("SPENDER_KEYPAIR".to_string()))?;
        tracing::info!(
            spender = %spender.pubkey(),
            rpc = %config.solana_rpc_url,
            "using Solana provider"
        );
        Ok(Self {
            rpc_client: RpcClient::new(config.solana_rpc_url.to_string()),
            spender: Arc::new(spender),
            usdc_mint: parse_pubkey(&config.usdc_mint)?,
            treasury: parse_pubkey(&config.treasury_address)?,
            credits_program_id: parse_pubkey(&config.credits_program_id)?,
        })
    }

    pub fn spender_pubkey(&self) -> Pubkey {
        self.spender.pubkey()
    }

    pub fn credits_program_id(&self) -> Pubkey {
        self.credits_program_id
    }

    pub fn usdc_mint(&self) -> Pubkey {
        self.usdc_mint
    }

    /// The program's global config PDA, seeded on the treasury address as
    /// its configured authority.
    pub fn config_pda(&self) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[b"config", self.treasury.as_ref()], &self.credits_program_id)
    }

    /// The per-wallet `UserCredit` PDA.
    pub fn user_credit_pda(&self, wallet: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[b"credit", wallet.as_ref()], &self.credits_program_id)
    }

    pub fn user_usdc_ata(&self, wallet: &Pubkey) -> Pubkey {
        spl_associated_token_account::get_associated_token_address(wallet, &self.usdc_mint)
    }

    /// The config PDA's associated token account, the vault that receives
    /// `pay_usdc` transfers.
    pub fn vault_usdc_ata(&self) -> Pubkey {
        let (config_pda, _) = self.config_pda();
        spl_associated_token_account::get_associated_token_address(&config_pda, &self.usdc_mint)
    }

    /// Reads the caller's on-chain credit balance. Reports 0 for an
    /// uninitialized `UserCredit` PDA, and also 0 (rather than erroring) if
    /// the account's stored owner field doesn't match `wallet` — this
    /// shouldn't happen for a correctly-derived PDA, but the spec treats it
    /// as "no credits" rather than a hard failure.
    pub async fn get_user_credits(&self, wallet: &Pubkey) -> Result<u64, ChainError> {
        let (pda, _bump) = self.user_credit_pda(wallet);
        match self.rpc_client.get_account(&pda).await {
            Ok(account) => {
                let decoded = UserCreditAccount::decode(&pda, &account, &self.credits_program_id)?;
                if decoded.owner != *wallet {
                    return Ok(0);
                }
                Ok(decoded.credits)
            }
            Err(err) if is_account_not_found(&err) => Ok(0),
            Err(err) => Err(ChainError::Rpc(err)),
        }
    }

    /// Builds, signs (spender as sole signer and fee payer), and submits a
    /// `consume_credit` instruction debiting `amount` credits from
    /// `wallet`'s `UserCredit` PDA. A Memo CPI carrying `memo` (truncated to
    /// its hex-encoded digest if over 64 bytes) is prepended so the
    /// `unlockRequestId` that triggered this debit is recoverable from chain
    /// history.
    pub async fn consume_credit(&self, wallet: &Pubkey, amount: u64, memo: &str) -> Result<Signature, ChainError> {
        let (config_pda, _) = self.config_pda();
        let (user_credit_pda, _) = self.user_credit_pda(wallet);
        let consume_ix = Instruction {
            program_id: self.credits_program_id,
            accounts: vec![
                AccountMeta::new(self.spender.pubkey(), true),
                AccountMeta::new_readonly(config_pda, false),
                AccountMeta::new_readonly(*wallet, false),
                AccountMeta::new(user_credit_pda, false),
            ],
            data: consume_credit_instruction_data(amount),
        };
        let memo_bytes = if memo.len() <= 64 {
            memo.as_bytes().to_vec()
        } else {
            hex::encode(Sha256::digest(memo.as_bytes())).into_bytes()
        };
        let memo_ix = spl_memo::build_memo(&memo_bytes, &[&self.spender.pubkey()]);
        self.sign_and_send(vec![memo_ix, consume_ix]).await
    }

    async fn sign_and_send(&self, instructions: Vec<Instruction>) -> Result<Signature, ChainError> {
        let blockhash = self.rpc_client.get_latest_blockhash().await?;
        let message = Message::new_with_blockhash(&instructions, Some(&self.spender.pubkey()), &blockhash);
        let signature = self.spender.try_sign_message(&message.serialize())?;
        let tx = VersionedTransaction {
            signatures: vec![signature],
            message: solana_message::VersionedMessage::Legacy(message),
        };
        self.send_and_confirm(&tx).await
    }

    async fn send_and_confirm(&self, tx: &VersionedTransaction) -> Result<Signature, ChainError> {
        let tx_sig = *tx.get_signature();
        self.rpc_client
            .send_transaction_with_config(
                tx,
                RpcSendTransactionConfig {
                    skip_preflight: true,
                    ..RpcSendTransactionConfig::default()
                },
            )
            .await?;
        for _ in 0..30 {
            let confirmed = self
                .rpc_client
                .confirm_transaction_with_commitment(&tx_sig, CommitmentConfig::confirmed())
                .await?;
            if confirmed.value {
                return Ok(tx_sig);
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Err(ChainError::ConfirmationTimeout)
    }

    /// Fetches the confirmed transaction at `signature` and verifies it (a)
    /// succeeded and (b) invoked the credits program, either as a top-level
    /// instruction or a CPI. Used by topup confirmation to avoid trusting a
    /// client-supplied signature for an unrelated transaction.
    pub async fn verify_transaction_invokes_credits_program(&self, signature: &Signature) -> Result<(), ChainError> {
        let confirmed = self
            .rpc_client
            .get_transaction(signature, UiTransactionEncoding::JsonParsed)
            .await?;
        let meta = confirmed
            .transaction
            .meta
            .ok_or(ChainError::TransactionFailed(*signature))?;
        if meta.err.is_some() {
            return Err(ChainError::TransactionFailed(*signature));
        }

        let program_id_str = self.credits_program_id.to_string();
        let mut invoked = false;

        if let EncodedTransaction::Json(ui_tx) = &confirmed.transaction.transaction
            && let UiMessage::Parsed(parsed) = &ui_tx.message
        {
            invoked |= parsed
                .instructions
                .iter()
                .any(|ix| instruction_program_id(ix).as_deref() == Some(program_id_str.as_str()));
        }

        if let solana_transaction_status_client_types::option_serializer::OptionSerializer::Some(inner) =
            &meta.inner_instructions
        {
            invoked |= inner.iter().any(|group| {
                group
                    .instructions
                    .iter()
                    .any(|ix| instruction_program_id(ix).as_deref() == Some(program_id_str.as_str()))
            });
        }

        if invoked {
            Ok(())
        } else {
            Err(ChainError::ProgramNotInvoked(*signature))
        }
    }

    /// Pings the RPC endpoint for the ambient `/healthz` surface.
    pub async fn health_check(&self) -> Result<(), ChainError> {
        self.rpc_client.get_health().await.map_err(ChainError::Rpc)
    }
}

fn instruction_program_id(ix: &UiInstruction) -> Option<String> {
    match ix {
        UiInstruction::Compiled(_) => None,
        UiInstruction::Parsed(parsed) => match parsed {
            solana_transaction_status_client_types::UiParsedInstruction::Parsed(p) => {
                Some(p.program_id.clone())
            }
            solana_transaction_status_client_types::UiParsedInstruction::PartiallyDecoded(p) => {
                Some(p.program_id.clone())
            }
        },
    }
}

fn is_account_not_found(err: &ClientError) -> bool {
    // The nonblocking RPC client surfaces a missing account as an RPC error
    // whose message names the account, rather than a distinct error variant.
    err.to_string().contains("AccountNotFound") || err.to_string().contains("could not find account")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_discriminator_is_stable_and_distinct_per_name() {
        let a = account_discriminator("UserCredit");
        let b = account_discriminator("Config");
        assert_ne!(a, b);
        assert_eq!(a, account_discriminator("UserCredit"));
    }

    #[test]
    fn instruction_discriminator_matches_anchor_global_namespace() {
        let pay = instruction_discriminator("pay_usdc");
        let consume = instruction_discriminator("consume_credit");
        assert_ne!(pay, consume);
        assert_eq!(pay.len(), 8);
    }

    #[test]
    fn pay_usdc_instruction_data_has_expected_shape() {
        let data = pay_usdc_instruction_data(500_000);
        assert_eq!(&data[..8], &instruction_discriminator("pay_usdc"));
        assert_eq!(&data[8..], &500_000u64.to_le_bytes());
    }

    #[test]
    fn user_credit_account_decodes_owner_and_balance() {
        let program_id = Pubkey::new_unique();
        let owner = Pubkey::new_unique();
        let mut data = account_discriminator("UserCredit").to_vec();
        data.extend_from_slice(owner.as_ref());
        data.extend_from_slice(&42u64.to_le_bytes());
        let account = Account {
            lamports: 1,
            data,
            owner: program_id,
            executable: false,
            rent_epoch: 0,
        };
        let pda = Pubkey::new_unique();
        let decoded = UserCreditAccount::decode(&pda, &account, &program_id).unwrap();
        assert_eq!(decoded.owner, owner);
        assert_eq!(decoded.credits, 42);
    }

    #[test]
    fn user_credit_account_rejects_wrong_owner() {
        let program_id = Pubkey::new_unique();
        let wrong_owner = Pubkey::new_unique();
        let account = Account {
            lamports: 1,
            data: vec![0u8; USER_CREDIT_ACCOUNT_LEN],
            owner: wrong_owner,
            executable: false,
            rent_epoch: 0,
        };
        let pda = Pubkey::new_unique();
        assert!(matches!(
            UserCreditAccount::decode(&pda, &account, &program_id),
            Err(ChainError::WrongOwner(_))
        ));
    }
}
