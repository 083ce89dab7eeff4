//! Node configuration

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::mesh::GossipConfig;
use crate::session::SessionLimits;
use crate::transport::PowerMode;

/// Top-level configuration for one mesh node
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the encrypted store and incoming files
    pub data_dir: PathBuf,

    /// Display name announced to the mesh; defaults to `anon` plus the
    /// short-ID prefix
    pub nickname: Option<String>,

    /// Battery class selecting the scan duty cycle
    pub power_mode: PowerMode,

    /// Cadence of identity announcements
    pub announce_interval: Duration,

    /// Noise session limits and rate caps
    pub session: SessionLimits,

    /// Gossip sync schedules and bounds
    pub gossip: GossipConfig,

    /// Bound on the dedup window
    pub seen_capacity: usize,

    /// Per-peer queue of messages accepted before a session exists
    pub outbox_capacity: usize,

    /// Debounce for batched identity persistence
    pub save_debounce: Duration,

    /// Cadence of the stale-peer sweep
    pub peer_sweep_interval: Duration,

    /// Cadence of the session expiry sweep
    pub session_sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".bitchat");
        Self {
            data_dir,
            nickname: None,
            power_mode: PowerMode::Normal,
            announce_interval: Duration::from_secs(30),
            session: SessionLimits::default(),
            gossip: GossipConfig::default(),
            seen_capacity: crate::mesh::deduplication::DEFAULT_SEEN_CAPACITY,
            outbox_capacity: 64,
            save_debounce: Duration::from_secs(2),
            peer_sweep_interval: Duration::from_secs(30),
            session_sweep_interval: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = env::var("BITCHAT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(nickname) = env::var("BITCHAT_NICKNAME") {
            if !nickname.is_empty() {
                config.nickname = Some(nickname);
            }
        }
        if let Ok(mode) = env::var("BITCHAT_POWER_MODE") {
            config.power_mode = match mode.to_lowercase().as_str() {
                "powersave" | "power-save" => PowerMode::PowerSave,
                "ultralow" | "ultra-low" => PowerMode::UltraLow,
                _ => PowerMode::Normal,
            };
        }

        config
    }
}
