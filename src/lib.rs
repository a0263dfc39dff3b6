//! Orchestration core for a short-video clipping service.
//!
//! This crate is a stateful HTTP backend that accepts clipping job requests,
//! dispatches them to an external GPU execution fabric, tracks job lifecycle
//! in a Redis-backed job store, and gates per-clip delivery behind a
//! blockchain-anchored credit ledger.
//!
//! # Modules
//!
//! - [`config`] — environment-driven server configuration.
//! - [`errors`] — crate-wide error taxonomy mapped to HTTP status codes.
//! - [`ids`] — opaque identifier types (job id, hex secrets).
//! - [`job_store`] — the Redis-backed KV store and its scripted atomic primitive.
//! - [`chain`] — Solana RPC provider, PDA/ATA derivation, instruction encoding.
//! - [`auth`] — wallet challenge/verify authentication.
//! - [`credit`] — on-chain balance reads, topup intents, and credit consumption.
//! - [`unlock`] — the idempotent per-clip unlock state machine.
//! - [`artifact`] — manifest resolution and signed URL minting.
//! - [`dispatcher`] — job submission to the GPU execution fabric.
//! - [`state`] — the shared `AppState` threaded through all handlers.
//! - [`handlers`] — HTTP endpoint handlers and route table.

pub mod artifact;
pub mod auth;
pub mod chain;
pub mod config;
pub mod credit;
pub mod dispatcher;
pub mod errors;
pub mod handlers;
pub mod ids;
pub mod job_store;
pub mod sig_down;
pub mod state;
pub mod telemetry;
pub mod trace_id;
pub mod unlock;

pub use trace_id::TraceId;
