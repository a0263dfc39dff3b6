//! Configuration for the KangKlip orchestrator.
//!
//! Unlike the multi-chain JSON config the teacher facilitator supports, this
//! service talks to exactly one chain and one fabric, so configuration is a
//! flat set of environment variables resolved by `clap`'s `env` derive —
//! fields with no sane default are required and fail startup immediately if
//! absent, rather than deferring the failure to first use.

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use url::Url;

/// Server configuration, loaded from environment variables (and `.env`).
#[derive(Parser, Debug, Clone)]
#[command(name = "kangklip-orchestrator")]
#[command(about = "Job orchestration core for the KangKlip clipping service")]
pub struct Config {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// GPU execution fabric (Nosana) API base URL.
    #[arg(long, env = "NOSANA_API_BASE")]
    pub nosana_api_base: Url,
    #[arg(long, env = "NOSANA_API_KEY")]
    pub nosana_api_key: String,
    #[arg(long, env = "NOSANA_WORKER_IMAGE")]
    pub nosana_worker_image: String,
    #[arg(long, env = "NOSANA_MARKET")]
    pub nosana_market: String,

    #[arg(long, env = "REDIS_URL")]
    pub redis_url: String,

    #[arg(long, env = "R2_ENDPOINT")]
    pub r2_endpoint: Url,
    #[arg(long, env = "R2_BUCKET")]
    pub r2_bucket: String,
    #[arg(long, env = "R2_ACCESS_KEY_ID")]
    pub r2_access_key_id: String,
    #[arg(long, env = "R2_SECRET_ACCESS_KEY")]
    pub r2_secret_access_key: String,

    #[arg(long, env = "CALLBACK_BASE_URL")]
    pub callback_base_url: Url,
    #[arg(long, env = "CALLBACK_TOKEN")]
    pub callback_token: String,

    /// Passthrough LLM endpoint forwarded into the worker payload; unused by
    /// the orchestrator itself (the worker pipeline is out of scope, §1).
    #[arg(long, env = "LLM_API_BASE")]
    pub llm_api_base: Url,
    #[arg(long, env = "LLM_MODEL_NAME")]
    pub llm_model_name: String,
    #[arg(long, env = "LLM_API_KEY")]
    pub llm_api_key: Option<String>,

    #[arg(long, env = "CORS_ORIGINS")]
    pub cors_origins: Option<String>,

    #[arg(long, env = "SOLANA_RPC_URL")]
    pub solana_rpc_url: Url,
    #[arg(long, env = "USDC_MINT")]
    pub usdc_mint: String,
    #[arg(long, env = "TREASURY_ADDRESS")]
    pub treasury_address: String,
    #[arg(long, env = "CREDITS_PROGRAM_ID")]
    pub credits_program_id: String,

    /// Either a filesystem path to a 64-byte JSON keypair array, or the
    /// inline JSON array itself.
    #[arg(long, env = "SPENDER_KEYPAIR")]
    pub spender_keypair: String,
}

mod bound_defaults {
    pub const CLIP_COUNT_MIN: u32 = 1;
    pub const CLIP_COUNT_MAX: u32 = 5;
    pub const CLIP_DURATION_MIN_SECS: u32 = 30;
    pub const CLIP_DURATION_MAX_SECS: u32 = 60;
    pub const CREDIT_UNIT_BASE_UNITS: u64 = 100_000;
}
pub use bound_defaults::*;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing or invalid configuration: {0}")]
    Invalid(#[from] clap::Error),
    #[error("failed to read spender keypair at {0}: {1}")]
    KeypairRead(PathBuf, std::io::Error),
    #[error("failed to parse spender keypair: {0}")]
    KeypairParse(#[from] serde_json::Error),
}

impl Config {
    /// Loads configuration from the process environment (after `.env` has
    /// been applied by the caller).
    pub fn load() -> Result<Self, ConfigError> {
        // `try_parse_from` over an empty args slice reads purely from `env`
        // bindings declared above; CLI flags remain available for local runs.
        let config = Config::try_parse_from(std::env::args())?;
        Ok(config)
    }

    /// Resolves `SPENDER_KEYPAIR` to its raw 64-byte array, accepting either
    /// an inline JSON array or a path to a file containing one.
    pub fn load_spender_keypair_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        let trimmed = self.spender_keypair.trim();
        if trimmed.starts_with('[') {
            Ok(serde_json::from_str(trimmed)?)
        } else {
            let path = PathBuf::from(trimmed);
            let content = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::KeypairRead(path.clone(), e))?;
            Ok(serde_json::from_str(content.trim())?)
        }
    }
}
