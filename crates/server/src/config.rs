//! Command-line / environment configuration

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::reducer::SessionInit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    /// SQLite file under the data dir
    Sqlite,
    /// Process memory; nothing survives a restart
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// mdxai session service: durable agent session state with live WebSocket updates
#[derive(Debug, Clone, Parser)]
#[command(name = "mdxai-service", version, about)]
pub struct Config {
    /// Address to bind
    #[arg(long, env = "MDXAI_BIND", default_value = "127.0.0.1")]
    pub bind: IpAddr,

    /// Port to listen on
    #[arg(long, short, env = "MDXAI_PORT", default_value_t = 4000)]
    pub port: u16,

    /// Data directory (database, logs). Defaults to ~/.mdxai
    #[arg(long, env = "MDXAI_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Externally visible base URL used in session links, e.g. https://agents.example.com
    #[arg(long, env = "MDXAI_PUBLIC_URL")]
    pub public_url: Option<String>,

    /// Session snapshot backend
    #[arg(long, env = "MDXAI_STORE", value_enum, default_value = "sqlite")]
    pub store: StoreKind,

    /// Log output format
    #[arg(long, env = "MDXAI_LOG_FORMAT", value_enum, default_value = "json")]
    pub log_format: LogFormat,

    /// Model recorded on sessions created without one
    #[arg(long, env = "MDXAI_DEFAULT_MODEL", default_value = "claude-sonnet-4-20250514")]
    pub default_model: String,

    /// Execution mode recorded on sessions created without one
    #[arg(long, env = "MDXAI_DEFAULT_EXECUTION_MODE", default_value = "sdk")]
    pub default_execution_mode: String,

    /// Working directory recorded on sessions created without one
    #[arg(long, env = "MDXAI_DEFAULT_CWD", default_value = "/")]
    pub default_cwd: String,

    /// Seconds without commands or subscribers before a session actor is
    /// unloaded (0 keeps actors forever)
    #[arg(long, env = "MDXAI_IDLE_TIMEOUT_SECS", default_value_t = 300)]
    pub idle_timeout_secs: u64,
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn session_defaults(&self) -> SessionInit {
        SessionInit {
            execution_mode: self.default_execution_mode.clone(),
            model: self.default_model.clone(),
            cwd: self.default_cwd.clone(),
            prompt: None,
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    /// Public URL with any trailing slash removed
    pub fn public_base_url(&self) -> Option<String> {
        self.public_url
            .as_deref()
            .map(|url| url.trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
    }
}
