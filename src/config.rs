//! Configuration types and constants for the passage server.

use clap::Parser;

use crate::edition::Edition;

/// TTL for peer registrations and queued signals (seconds).
pub const SIGNAL_TTL_SECS: u64 = 30;
/// Base TTL for chunk-relay sessions (seconds); grows with chunk count.
pub const CHUNK_TTL_BASE_SECS: u64 = 60;
/// Per-chunk TTL increment for relay sessions (milliseconds).
pub const CHUNK_TTL_PER_CHUNK_MS: u64 = 500;
/// Ceiling for the dynamic relay-session TTL (seconds).
pub const CHUNK_TTL_MAX_SECS: u64 = 180;
/// TTL for the standalone acknowledgment record (seconds).
pub const ACK_TTL_SECS: u64 = 60;
/// TTL for envelope handshake sessions and their PIN index entries (seconds).
pub const HANDSHAKE_TTL_SECS: u64 = 180;
/// TTL for Enterprise device registrations (seconds).
pub const DEVICE_TTL_SECS: u64 = 86_400;

/// Hard cap on a single ciphertext chunk (bytes of the `data` string).
pub const MAX_CHUNK_BYTES: usize = 48 * 1024;
/// Chunk count bounds for one relay session.
pub const MAX_TOTAL_CHUNKS: u32 = 2048;
/// Envelope ciphertext bounds (raw bytes after base64 decode).
pub const MIN_ENVELOPE_CT_BYTES: usize = 16;
pub const MAX_ENVELOPE_CT_BYTES: usize = 64 * 1024;
/// Request bodies above this are rejected with 413 before parsing.
pub const MAX_BODY_BYTES: usize = 256 * 1024;

/// Attempts for the optimistic push loop before `concurrency_conflict`.
pub const CAS_MAX_ATTEMPTS: u32 = 5;
/// Rejection-sampling attempts when minting a fresh 6-digit PIN.
pub const PIN_MINT_ATTEMPTS: u32 = 10;

/// Zero-knowledge signaling relay for paired-device transfers.
///
/// Stores only ciphertext and TTL'd metadata; every record expires on its
/// own. Configuration can be set via CLI arguments or environment variables;
/// CLI arguments take precedence.
#[derive(Parser, Debug)]
#[command(name = "passage", version, about)]
pub struct Cli {
    /// HTTP bind address [env: PASSAGE_BIND] [default: 127.0.0.1:8787]
    #[arg(long, short = 'b')]
    pub bind: Option<String>,

    /// Redis URL for the external store; omit to run on the in-process map
    /// [env: PASSAGE_REDIS_URL]
    #[arg(long)]
    pub redis_url: Option<String>,

    /// Edition: community or enterprise [env: PASSAGE_EDITION]
    #[arg(long)]
    pub edition: Option<String>,

    /// Comma-separated list of allowed CORS origins, or "*"
    /// [env: PASSAGE_ALLOWED_ORIGINS]
    #[arg(long)]
    pub allowed_origins: Option<String>,

    /// PIN-resolve requests allowed per client IP per minute
    /// [env: PASSAGE_RESOLVE_RATE_PER_MIN] [default: 30]
    #[arg(long)]
    pub resolve_rate_per_min: Option<u32>,

    /// Create a placeholder relay session when the receiver polls first
    /// [env: PASSAGE_PLACEHOLDER_SESSIONS]
    #[arg(long)]
    pub placeholder_sessions: bool,

    /// Seconds between expiry sweeps [env: PASSAGE_SWEEP_INTERVAL_SECS]
    /// [default: 5]
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: String,
    pub redis_url: Option<String>,
    pub edition: Edition,
    pub allowed_origins: Vec<String>,
    pub resolve_rate_per_min: u32,
    pub placeholder_sessions: bool,
    pub sweep_interval_secs: u64,
}

impl Config {
    pub fn from_cli_and_env(cli: Cli) -> Self {
        let bind_addr = cli
            .bind
            .or_else(|| std::env::var("PASSAGE_BIND").ok())
            .unwrap_or_else(|| "127.0.0.1:8787".to_string());

        let redis_url = cli
            .redis_url
            .or_else(|| std::env::var("PASSAGE_REDIS_URL").ok());

        let edition = cli
            .edition
            .or_else(|| std::env::var("PASSAGE_EDITION").ok())
            .map(|v| Edition::parse(&v))
            .unwrap_or(Edition::Community);

        let allowed_origins = cli
            .allowed_origins
            .or_else(|| std::env::var("PASSAGE_ALLOWED_ORIGINS").ok())
            .unwrap_or_else(|| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let resolve_rate_per_min = cli
            .resolve_rate_per_min
            .or_else(|| {
                std::env::var("PASSAGE_RESOLVE_RATE_PER_MIN")
                    .ok()
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(30);

        let placeholder_sessions = cli.placeholder_sessions
            || std::env::var("PASSAGE_PLACEHOLDER_SESSIONS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false);

        let sweep_interval_secs = cli
            .sweep_interval_secs
            .or_else(|| {
                std::env::var("PASSAGE_SWEEP_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(5);

        Self {
            bind_addr,
            redis_url,
            edition,
            allowed_origins,
            resolve_rate_per_min,
            placeholder_sessions,
            sweep_interval_secs,
        }
    }
}

/// Dynamic TTL for a relay session: base plus half a second per chunk,
/// capped. An unknown chunk count (placeholder session) gets the base.
pub fn chunk_session_ttl_ms(total_chunks: Option<u32>) -> u64 {
    let base = CHUNK_TTL_BASE_SECS * 1000;
    let dynamic = base + u64::from(total_chunks.unwrap_or(0)) * CHUNK_TTL_PER_CHUNK_MS;
    dynamic.min(CHUNK_TTL_MAX_SECS * 1000)
}
