use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::Level;

use blockrelay_core::broadcast::LogConfig;
use blockrelay_engine::{CoordinatorConfig, MonitorConfig};
use blockrelay_llm::NormalizerConfig;
use blockrelay_server::ServerConfig;
use blockrelay_telemetry::TelemetryConfig;

/// Streams model responses as resumable block records.
#[derive(Parser, Debug)]
#[command(name = "blockrelay", version)]
pub struct Cli {
    /// HTTP port
    #[arg(long, env = "BLOCKRELAY_PORT", default_value_t = 9091)]
    pub port: u16,

    /// SQLite database path (defaults to ~/.blockrelay/blockrelay.db)
    #[arg(long, env = "BLOCKRELAY_DB")]
    pub db: Option<PathBuf>,

    /// Sliding expiry of a broadcast stream, refreshed on every append
    #[arg(long, env = "BLOCKRELAY_STREAM_TTL_SECS", default_value_t = 600)]
    pub stream_ttl_secs: u64,

    /// How often an active round checks its session's cancellation flag
    #[arg(long, env = "BLOCKRELAY_CANCEL_POLL_MS", default_value_t = 500)]
    pub cancel_poll_ms: u64,

    /// Same-block deltas merged into one published delta
    #[arg(long, env = "BLOCKRELAY_BATCH_SIZE", default_value_t = 1)]
    pub batch_size: usize,

    /// Longest wait for the query summary before completing
    #[arg(long, env = "BLOCKRELAY_SUMMARY_WAIT_SECS", default_value_t = 5)]
    pub summary_wait_secs: u64,

    /// Model rounds allowed per query
    #[arg(long, env = "BLOCKRELAY_MAX_ROUNDS", default_value_t = 25)]
    pub max_rounds: u32,

    /// Emit JSON log lines
    #[arg(long, env = "BLOCKRELAY_LOG_JSON")]
    pub log_json: bool,

    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Default model for new sessions
    #[arg(long)]
    pub model: Option<String>,

    /// Override the provider endpoint
    #[arg(long)]
    pub base_url: Option<String>,

    /// Model used for query summaries; summaries are off when unset
    #[arg(long, env = "BLOCKRELAY_SUMMARY_MODEL")]
    pub summary_model: Option<String>,
}

impl Cli {
    pub fn db_path(&self) -> PathBuf {
        self.db
            .clone()
            .unwrap_or_else(|| home_dir().join(".blockrelay").join("blockrelay.db"))
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: self.log_json,
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            ttl: Duration::from_secs(self.stream_ttl_secs),
            ..LogConfig::default()
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_rounds_per_query: self.max_rounds,
            summary_wait: Duration::from_secs(self.summary_wait_secs),
            normalizer: NormalizerConfig {
                batch_size: self.batch_size.max(1),
            },
            monitor: MonitorConfig {
                poll_interval: Duration::from_millis(self.cancel_poll_ms.max(1)),
            },
            ..CoordinatorConfig::default()
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            port: self.port,
            ..ServerConfig::default()
        }
    }
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
