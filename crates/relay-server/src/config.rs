//! Runtime configuration: CLI flags with `RELAY_*` environment fallbacks.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Server configuration.
#[derive(Clone, Debug, Parser)]
#[command(name = "relay-server", version, about = "Real-time chat relay server")]
pub struct Config {
    /// Address to listen on.
    #[arg(long, env = "RELAY_BIND_ADDR", default_value = "127.0.0.1:8080")]
    pub bind_addr: SocketAddr,

    /// Redis URL for cross-instance state and fan-out. Omit to run
    /// single-instance with in-memory stores.
    #[arg(long, env = "RELAY_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Sqlite database path for direct-message history.
    #[arg(long, env = "RELAY_DB_PATH", default_value = "relay.db")]
    pub db_path: PathBuf,

    /// HS256 signing secret for session tokens.
    #[arg(long, env = "RELAY_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,
}
