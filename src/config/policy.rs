//! Occupation policy file.
//!
//! ```toml
//! [lock]
//! mode = "ttl"
//! ttl_secs = 1800
//! abandonment_secs = 28800
//! staleness_secs = 28800
//!
//! [conflict]
//! max_attempts = 5
//! base_delay_ms = 25
//!
//! [rework]
//! max_cycles = 3
//! ```
//!
//! Every key is optional.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::conflict::BackoffPolicy;
use crate::engine::rework::ReworkCycleGuard;
use crate::error::{Error, Result};
use crate::lock::{LockMode, LockSettings};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OccupationPolicy {
    pub lock: LockPolicy,
    pub conflict: ConflictPolicy,
    pub rework: ReworkPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockModeSetting {
    Ttl,
    #[default]
    Persistent,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockPolicy {
    pub mode: LockModeSetting,
    pub ttl_secs: u64,
    pub abandonment_secs: u64,
    pub staleness_secs: u64,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            mode: LockModeSetting::Persistent,
            ttl_secs: 3600,
            abandonment_secs: 8 * 3600,
            staleness_secs: 8 * 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConflictPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 1000,
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReworkPolicy {
    pub max_cycles: u32,
}

impl Default for ReworkPolicy {
    fn default() -> Self {
        Self { max_cycles: 3 }
    }
}

impl OccupationPolicy {
    /// Read and validate a policy file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read policy file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("bad policy file {}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let policy: Self =
            toml::from_str(content).map_err(|e| Error::Config(format!("invalid TOML: {e}")))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        if self.conflict.max_attempts == 0 {
            return Err(Error::Config("conflict.max_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.conflict.jitter) {
            return Err(Error::Config("conflict.jitter must be within [0, 1]".into()));
        }
        if self.conflict.multiplier < 1.0 {
            return Err(Error::Config("conflict.multiplier must be >= 1".into()));
        }
        if self.conflict.max_delay_ms < self.conflict.base_delay_ms {
            return Err(Error::Config(
                "conflict.max_delay_ms must not be below base_delay_ms".into(),
            ));
        }
        if self.rework.max_cycles == 0 {
            return Err(Error::Config("rework.max_cycles must be at least 1".into()));
        }
        if self.lock.mode == LockModeSetting::Ttl && self.lock.ttl_secs == 0 {
            return Err(Error::Config("lock.ttl_secs must be positive in ttl mode".into()));
        }
        Ok(())
    }

    pub fn lock_mode(&self) -> LockMode {
        match self.lock.mode {
            LockModeSetting::Ttl => LockMode::Ttl(Duration::from_secs(self.lock.ttl_secs)),
            LockModeSetting::Persistent => LockMode::Persistent,
        }
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            abandonment: Duration::from_secs(self.lock.abandonment_secs),
            staleness: Duration::from_secs(self.lock.staleness_secs),
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.conflict.base_delay_ms),
            max: Duration::from_millis(self.conflict.max_delay_ms),
            multiplier: self.conflict.multiplier,
            jitter: self.conflict.jitter,
        }
    }

    pub fn rework_guard(&self) -> ReworkCycleGuard {
        ReworkCycleGuard::new(self.rework.max_cycles)
    }
}
