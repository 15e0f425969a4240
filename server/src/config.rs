use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

const DEFAULT_ALLOWED_ORIGINS: &[&str] = &[
    "http://localhost:5173",
    "http://localhost:5174",
    "http://localhost:3000",
    "http://127.0.0.1:5173",
    "http://127.0.0.1:5174",
    "http://127.0.0.1:3000",
];

#[derive(Debug, Clone, Parser)]
#[command(name = "mindmap-server", about = "Collaborative mind map session server")]
pub struct ServerConfig {
    /// Address the HTTP/WebSocket listener binds to.
    #[arg(long, env = "MINDMAP_BIND", default_value = "127.0.0.1:8080")]
    pub bind: String,

    /// Directory holding one JSON file per session. In-memory when absent.
    #[arg(long, env = "MINDMAP_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// How long a dropped participant stays present while it may reconnect.
    #[arg(long, env = "MINDMAP_RECONNECT_GRACE_MS", default_value_t = 10_000)]
    pub reconnect_grace_ms: u64,

    #[arg(long, default_value_t = 64)]
    pub outbound_buffer: usize,

    #[arg(long, default_value_t = 256)]
    pub session_mailbox: usize,

    #[arg(
        long = "allowed-origin",
        env = "MINDMAP_ALLOWED_ORIGINS",
        value_delimiter = ','
    )]
    pub allowed_origins: Vec<String>,

    #[arg(long, env = "MINDMAP_ALLOW_SELF_LOOPS", default_value_t = false)]
    pub allow_self_loops: bool,
}

impl ServerConfig {
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            reconnect_grace: Duration::from_millis(self.reconnect_grace_ms),
            session_mailbox: self.session_mailbox.max(1),
            allow_self_loops: self.allow_self_loops,
        }
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            outbound_buffer: self.outbound_buffer.max(1),
        }
    }

    pub fn allowed_origins(&self) -> Vec<String> {
        if self.allowed_origins.is_empty() {
            DEFAULT_ALLOWED_ORIGINS.iter().map(|o| o.to_string()).collect()
        } else {
            self.allowed_origins.clone()
        }
    }
}

/// Settings of the session engine, independent of the HTTP layer.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub reconnect_grace: Duration,
    pub session_mailbox: usize,
    pub allow_self_loops: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconnect_grace: Duration::from_secs(10),
            session_mailbox: 256,
            allow_self_loops: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub outbound_buffer: usize,
}
