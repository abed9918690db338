use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

/// Settings read from the environment (and `.env`, if present).
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub peer: SocketAddr,
    pub staging_dir: PathBuf,
    pub idle_timeout: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind = std::env::var("SALVAGE_BIND").unwrap_or_else(|_| "0.0.0.0:4900".into());
        let peer = std::env::var("SALVAGE_PEER").unwrap_or_else(|_| "255.255.255.255:4900".into());
        let staging_dir: PathBuf = std::env::var("SALVAGE_STAGING_DIR")
            .unwrap_or_else(|_| "./staging".into())
            .into();
        let idle_secs: u64 = std::env::var("SALVAGE_IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        Ok(Self {
            bind: bind
                .parse()
                .with_context(|| format!("SALVAGE_BIND is not a socket address: {bind}"))?,
            peer: peer
                .parse()
                .with_context(|| format!("SALVAGE_PEER is not a socket address: {peer}"))?,
            staging_dir,
            idle_timeout: Duration::from_secs(idle_secs.max(1)),
        })
    }
}
