use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::Heartbeat;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_STATIC_DIR: &str = "public";
pub const DEFAULT_SERVER_NAME: &str = "Local";

/// How the process was started. Both modes run the same relay; local mode
/// also serves the display and controller pages from disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeployMode {
    Local,
    Production,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub mode: DeployMode,
    pub static_dir: PathBuf,
    /// Shown on the root status page
    pub server_name: String,
    pub heartbeat: Heartbeat,
}

impl RelayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        Self::from_lookup(&args, |key| std::env::var(key).ok())
    }

    /// Resolve configuration from command line arguments and an environment
    /// lookup. Empty variables count as unset.
    pub fn from_lookup<F>(args: &[String], lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = match var("PORT") {
            Some(p) => p
                .trim()
                .parse::<u16>()
                .with_context(|| format!("invalid PORT {p:?}"))?,
            None => DEFAULT_PORT,
        };

        let listen = match var("TELEPROMPTER_LISTEN") {
            Some(addr) => addr
                .parse::<SocketAddr>()
                .with_context(|| format!("invalid TELEPROMPTER_LISTEN {addr:?} (expected host:port)"))?,
            None => SocketAddr::from(([0, 0, 0, 0], port)),
        };

        let local_flag = args.iter().any(|a| a == "--local" || a == "-l");
        let mode = match var("TELEPROMPTER_MODE").as_deref() {
            Some("local") => DeployMode::Local,
            Some("production") => DeployMode::Production,
            Some(other) => anyhow::bail!("invalid TELEPROMPTER_MODE {other:?} (expected local|production)"),
            None if var("NODE_ENV").as_deref() == Some("production") => DeployMode::Production,
            None if var("HEROKU_APP_NAME").is_some() => DeployMode::Production,
            None if local_flag => DeployMode::Local,
            None if var("PORT").is_some() => DeployMode::Production,
            None => DeployMode::Local,
        };

        Ok(Self {
            listen,
            mode,
            static_dir: var("TELEPROMPTER_STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATIC_DIR)),
            server_name: var("HEROKU_APP_NAME").unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string()),
            heartbeat: Heartbeat::default(),
        })
    }

    /// Directory served for non-relay paths, local mode only.
    pub fn static_root(&self) -> Option<&Path> {
        match self.mode {
            DeployMode::Local => Some(self.static_dir.as_path()),
            DeployMode::Production => None,
        }
    }
}
