//! The tunable surface: protocol pacing, burst policy, and phase control
//!
//! Everything lives in one JSON document so a whole rig can share a single
//! file; every key has a default good for a 30 fps sensor on a quiet hotspot.

use crate::sntp::BurstConfig;
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// UDP port both roles bind, in the dynamic range
    pub rpc_port: u16,
    /// Client heartbeat pacing
    pub heartbeat_period_ms: u64,
    /// Leader evicts a client silent for longer than this
    pub expiry_ms: u64,
    /// Safety lead the leader adds when scheduling a trigger, so every
    /// client hears the broadcast before its frame must match
    pub trigger_lead_ms: u64,
    /// Per-stream cap on outstanding (acquired but unreleased) image
    /// buffers; the length of this list is the stream count
    pub max_outstanding: Vec<usize>,
    pub sntp: SntpSection,
    pub phase: PhaseConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_port: 55_555,
            heartbeat_period_ms: 1_000,
            expiry_ms: 5_000,
            trigger_lead_ms: 500,
            max_outstanding: vec![4, 4],
            sntp: SntpSection::default(),
            phase: PhaseConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SntpSection {
    /// Exchanges per burst (K)
    pub samples: usize,
    /// Inter-sample spacing (S)
    pub spacing_ms: u64,
    /// Per-sample deadline (D)
    pub deadline_ms: u64,
    /// Burst attempts before marking the client unsynced (R)
    pub retries: usize,
}

impl Default for SntpSection {
    fn default() -> Self {
        Self {
            samples: 20,
            spacing_ms: 10,
            deadline_ms: 200,
            retries: 3,
        }
    }
}

impl SntpSection {
    pub fn burst(&self) -> BurstConfig {
        BurstConfig {
            samples: self.samples,
            spacing: Duration::from_millis(self.spacing_ms),
            deadline: Duration::from_millis(self.deadline_ms),
            retries: self.retries,
        }
    }
}

/// Phase controller knobs, read-only once loaded
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    /// Sensor frame period
    pub frame_period_ns: u64,
    /// Target phase within the period, shared by the whole rig
    pub goal_phase_ns: u64,
    /// Phase error below this counts as aligned
    pub tolerance_ns: u64,
    /// Frames skipped after each injection before re-measuring
    pub settle_frames: u32,
    /// Damping factor in (0, 1]; below 1 avoids oscillation under frame
    /// duration jitter
    pub step_gain: f64,
    pub min_inject_exposure_ns: u64,
    pub max_inject_exposure_ns: u64,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            frame_period_ns: 33_333_333,
            goal_phase_ns: 0,
            tolerance_ns: 100_000,
            settle_frames: 3,
            step_gain: 0.5,
            min_inject_exposure_ns: 1_000_000,
            max_inject_exposure_ns: 66_000_000,
        }
    }
}

impl Config {
    /// Load from a JSON file, or fall back to defaults when no path is given
    pub fn load(path: Option<&Path>) -> eyre::Result<Self> {
        let config = match path {
            Some(p) => {
                info!("Loading config from {}", p.display());
                let text = std::fs::read_to_string(p)?;
                serde_json::from_str(&text)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> eyre::Result<()> {
        if self.max_outstanding.is_empty() || self.max_outstanding.len() > crate::common::MAX_STREAMS
        {
            eyre::bail!(
                "between 1 and {} streams must be configured",
                crate::common::MAX_STREAMS
            );
        }
        if !(self.phase.step_gain > 0.0 && self.phase.step_gain <= 1.0) {
            eyre::bail!("phase.step_gain must be in (0, 1]");
        }
        if self.phase.goal_phase_ns >= self.phase.frame_period_ns {
            eyre::bail!("phase.goal_phase_ns must be inside the frame period");
        }
        if self.sntp.samples == 0 || self.sntp.retries == 0 {
            eyre::bail!("sntp.samples and sntp.retries must be nonzero");
        }
        Ok(())
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn expiry_ns(&self) -> u64 {
        self.expiry_ms * 1_000_000
    }

    pub fn trigger_lead_ns(&self) -> u64 {
        self.trigger_lead_ms * 1_000_000
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn json_round_trip() {
        let cfg = Config::default();
        let text = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&text).unwrap();
        assert_eq!(back.rpc_port, cfg.rpc_port);
        assert_eq!(back.phase.frame_period_ns, cfg.phase.frame_period_ns);
    }

    #[test]
    fn partial_files_take_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"rpc_port": 50000}"#).unwrap();
        assert_eq!(cfg.rpc_port, 50_000);
        assert_eq!(cfg.sntp.samples, 20);
    }

    #[test]
    fn bad_gain_is_refused() {
        let mut cfg = Config::default();
        cfg.phase.step_gain = 0.0;
        assert!(cfg.validate().is_err());
        cfg.phase.step_gain = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn goal_phase_must_fit_the_period() {
        let mut cfg = Config::default();
        cfg.phase.goal_phase_ns = cfg.phase.frame_period_ns;
        assert!(cfg.validate().is_err());
    }
}
