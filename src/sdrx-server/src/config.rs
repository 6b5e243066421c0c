// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Configuration file support for sdrx-server.
//!
//! Config is loaded from `sdrx.toml`. Default search order:
//! 1. Path specified via `--config` CLI argument
//! 2. `./sdrx.toml`
//! 3. `~/.config/sdrx/sdrx.toml`
//! 4. `/etc/sdrx/sdrx.toml`

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use sdrx_core::modes::Mode;

/// Top-level server configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// General settings
    pub general: GeneralConfig,
    /// WebSocket listener configuration
    pub listen: ListenConfig,
    /// Session policy knobs
    pub server: PolicyConfig,
    /// Multicast endpoints of the DSP backend
    pub radiod: RadiodConfig,
    /// Spectrum polling and display gain
    pub spectrum: SpectrumConfig,
    /// Audio egress encoders
    pub audio: AudioConfig,
    /// Queue bounds and rate limits
    pub limits: LimitsConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: Option<String>,
    /// Station label reported in status responses
    pub callsign: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: None,
            callsign: Some("N0CALL".to_string()),
        }
    }
}

/// WebSocket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub addr: IpAddr,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addr: IpAddr::from([0, 0, 0, 0]),
            port: 8073,
        }
    }
}

/// Session policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Reject a WebSocket whose source IP differs from the IP already
    /// bound to its user session ID.
    pub enforce_session_ip_match: bool,
    /// Wide-IQ modes that do not require bypass.
    pub public_iq_modes: HashSet<Mode>,
    /// IPs granted bypass (wide-IQ access, no edge clamp).
    pub bypassed_ips: HashSet<IpAddr>,
    /// Password granting the same bypass. Empty disables the mechanism.
    pub bypass_password: String,
    /// IPs whose connections count as instance reporters (always granted
    /// iq48).
    pub instance_reporter_ips: HashSet<IpAddr>,
    /// IPs rejected outright at the upgrade.
    pub banned_ips: HashSet<IpAddr>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enforce_session_ip_match: true,
            public_iq_modes: HashSet::new(),
            bypassed_ips: HashSet::new(),
            bypass_password: String::new(),
            instance_reporter_ips: HashSet::new(),
            banned_ips: HashSet::new(),
        }
    }
}

/// Multicast endpoints of the radiod backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadiodConfig {
    /// STATUS/command multicast group.
    pub status_group: String,
    /// RTP audio multicast group.
    pub data_group: String,
    /// Channel name prefix used when creating backend channels.
    pub channel_prefix: String,
}

impl Default for RadiodConfig {
    fn default() -> Self {
        Self {
            status_group: "239.85.1.1:5006".to_string(),
            data_group: "239.85.1.2:5004".to_string(),
            channel_prefix: "sdrx".to_string(),
        }
    }
}

/// One gain override for a frequency range, with linear transitions of
/// `transition_hz` width around the edges.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GainRange {
    pub start_freq: f64,
    pub end_freq: f64,
    pub gain_db: f32,
    pub transition_hz: f64,
}

/// Spectrum polling and gain shaping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectrumConfig {
    /// Poll command cadence in milliseconds.
    pub poll_period_ms: u64,
    /// Master gain applied to every bin and to signal-quality values.
    pub gain_db: f32,
    /// Per-frequency-range gain overrides.
    #[serde(rename = "gain_ranges")]
    pub gain_db_frequency_ranges: Vec<GainRange>,
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            poll_period_ms: 100,
            gain_db: 0.0,
            gain_db_frequency_ranges: Vec::new(),
        }
    }
}

/// Audio egress configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub opus: OpusConfig,
}

/// Opus encoder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpusConfig {
    /// Bits per second, 6000..=510000.
    pub bitrate: u32,
    /// Encoder complexity, 0..=10.
    pub complexity: u8,
}

impl Default for OpusConfig {
    fn default() -> Self {
        Self {
            bitrate: 64_000,
            complexity: 5,
        }
    }
}

/// Queue bounds and rate limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Audio queue depth per session, in packets.
    pub audio_queue: usize,
    /// Spectrum queue depth per session, in frames.
    pub spectrum_queue: usize,
    /// Command token bucket per user session ID.
    pub command_burst: u32,
    pub commands_per_sec: f64,
    /// Connection token bucket per client IP.
    pub connection_burst: u32,
    pub connections_per_sec: f64,
    /// Maximum concurrent sessions per client IP.
    pub sessions_per_ip: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            audio_queue: 64,
            spectrum_queue: 8,
            command_burst: 10,
            commands_per_sec: 5.0,
            connection_burst: 5,
            connections_per_sec: 1.0,
            sessions_per_ip: 16,
        }
    }
}

impl ServerConfig {
    /// Load from an explicit path, or walk the default search order.
    /// A missing file resolves to defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => default_search_paths().into_iter().find(|p| p.exists()),
        };
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        let cfg: ServerConfig =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(path.display().to_string(), e))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Range checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(6_000..=510_000).contains(&self.audio.opus.bitrate) {
            return Err(ConfigError::Invalid(format!(
                "audio.opus.bitrate {} outside 6000..=510000",
                self.audio.opus.bitrate
            )));
        }
        if self.audio.opus.complexity > 10 {
            return Err(ConfigError::Invalid(format!(
                "audio.opus.complexity {} outside 0..=10",
                self.audio.opus.complexity
            )));
        }
        if self.spectrum.poll_period_ms == 0 {
            return Err(ConfigError::Invalid(
                "spectrum.poll_period_ms must be positive".into(),
            ));
        }
        for r in &self.spectrum.gain_db_frequency_ranges {
            if r.start_freq >= r.end_freq {
                return Err(ConfigError::Invalid(format!(
                    "gain range {}..{} is empty",
                    r.start_freq, r.end_freq
                )));
            }
        }
        self.radiod_status_addr()?;
        self.radiod_data_addr()?;
        Ok(())
    }

    pub fn radiod_status_addr(&self) -> Result<std::net::SocketAddr, ConfigError> {
        self.radiod
            .status_group
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bad status_group {}", self.radiod.status_group)))
    }

    pub fn radiod_data_addr(&self) -> Result<std::net::SocketAddr, ConfigError> {
        self.radiod
            .data_group
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bad data_group {}", self.radiod.data_group)))
    }

    /// Render an example configuration for `--print-config`.
    pub fn example_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("./sdrx.toml")];
    if let Ok(home) = std::env::var("HOME") {
        paths.push(PathBuf::from(home).join(".config/sdrx/sdrx.toml"));
    }
    paths.push(PathBuf::from("/etc/sdrx/sdrx.toml"));
    paths
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {0}: {1}")]
    Io(String, #[source] std::io::Error),
    #[error("cannot parse {0}: {1}")]
    Parse(String, #[source] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ServerConfig::default().validate().expect("defaults valid");
    }

    #[test]
    fn example_round_trips() {
        let text = ServerConfig::example_toml();
        let cfg: ServerConfig = toml::from_str(&text).expect("example parses");
        cfg.validate().expect("example valid");
    }

    #[test]
    fn opus_bitrate_is_range_checked() {
        let mut cfg = ServerConfig::default();
        cfg.audio.opus.bitrate = 5_000;
        assert!(cfg.validate().is_err());
        cfg.audio.opus.bitrate = 510_001;
        assert!(cfg.validate().is_err());
        cfg.audio.opus.bitrate = 510_000;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_gain_range_is_rejected() {
        let mut cfg = ServerConfig::default();
        cfg.spectrum.gain_db_frequency_ranges.push(GainRange {
            start_freq: 7_100_000.0,
            end_freq: 7_000_000.0,
            gain_db: 3.0,
            transition_hz: 1_000.0,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: ServerConfig = toml::from_str(
            r#"
            [listen]
            port = 9000

            [server]
            enforce_session_ip_match = false
            public_iq_modes = ["iq48"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.listen.port, 9000);
        assert!(!cfg.server.enforce_session_ip_match);
        assert!(cfg.server.public_iq_modes.contains(&Mode::Iq48));
        assert_eq!(cfg.spectrum.poll_period_ms, 100);
        assert_eq!(cfg.limits.audio_queue, 64);
    }

    #[test]
    fn bad_multicast_group_is_rejected() {
        let mut cfg = ServerConfig::default();
        cfg.radiod.status_group = "not-an-addr".to_string();
        assert!(cfg.validate().is_err());
    }
}
