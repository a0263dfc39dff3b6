//! Solana chain access: account reads, PDA/ATA derivation, and instruction
//! encoding for the two on-chain operations the credit ledger needs
//! (`pay_usdc`, `consume_credit`).

pub mod solana;

pub use solana::{ChainError, SolanaProvider};
