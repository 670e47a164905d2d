use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::{klog_debug, Error, Result};

pub const CONFIG_FILE: &str = "keel.toml";

/// Tunables for near-duplicate detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Length of the normalized prefix used for containment matching.
    pub prefix_len: usize,
    /// Fraction of the smaller keyword set that must appear in the larger.
    pub overlap_ratio: f64,
    /// Minimum keyword length; shorter words are ignored.
    pub min_keyword_len: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            prefix_len: 25,
            overlap_ratio: 0.6,
            min_keyword_len: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub pending_floor: usize,
    pub urgent_tag: String,
    /// Below this budget cap the selector avoids large tasks.
    pub budget_threshold: f64,
    pub retention_hours: i64,
    pub blocker_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            pending_floor: 3,
            urgent_tag: "urgent".to_string(),
            budget_threshold: 5.0,
            retention_hours: 24,
            blocker_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplenishConfig {
    pub observation_cap: usize,
    pub friction_touch_threshold: u32,
    pub friction_trend_window: usize,
    pub failing_hook_threshold: usize,
}

impl Default for ReplenishConfig {
    fn default() -> Self {
        Self {
            observation_cap: 2,
            friction_touch_threshold: 5,
            friction_trend_window: 3,
            failing_hook_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub cooldown_secs: i64,
    pub probe_timeout_secs: u64,
    /// Recovery probe command per resource id.
    pub probes: BTreeMap<String, String>,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 3600,
            probe_timeout_secs: 10,
            probes: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    pub history_window: usize,
    pub penalty_floor_secs: u64,
    pub profile_min_samples: usize,
    pub profile_headroom: f64,
    pub hard_deadline_secs: u64,
    pub excerpt_chars: usize,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            history_window: 200,
            penalty_floor_secs: 5,
            profile_min_samples: 5,
            profile_headroom: 1.5,
            hard_deadline_secs: 900,
            excerpt_chars: 400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub dedup: DedupConfig,
    pub queue: QueueConfig,
    pub replenish: ReplenishConfig,
    pub circuit: CircuitConfig,
    pub hooks: HooksConfig,
}

impl Config {
    /// Resolve the state directory: explicit flag, `KEEL_HOME`, then `~/.keel`.
    pub fn state_dir(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(dir) = explicit {
            return Ok(dir.to_path_buf());
        }
        if let Ok(home) = std::env::var("KEEL_HOME") {
            if !home.is_empty() {
                return Ok(expand_tilde(&home));
            }
        }
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".keel"))
    }

    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(CONFIG_FILE);
        klog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            klog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.dedup.overlap_ratio) {
            return Err(Error::Validation(format!(
                "dedup.overlap_ratio must be within 0..=1, got {}",
                self.dedup.overlap_ratio
            )));
        }
        if self.circuit.failure_threshold == 0 {
            return Err(Error::Validation(
                "circuit.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.hooks.history_window == 0 {
            return Err(Error::Validation(
                "hooks.history_window must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
