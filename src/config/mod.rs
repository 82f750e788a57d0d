//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.
//! Occupation tuning (lock mode, thresholds, retry and rework limits) lives
//! in an optional TOML policy file.

pub mod policy;
pub mod secrets;

use std::path::PathBuf;

use crate::error::{Error, Result};
use secrecy::SecretString;

pub use policy::OccupationPolicy;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub policy_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            policy_path: std::env::var("OCCUPATION_POLICY").ok().map(PathBuf::from),
        })
    }

    /// The policy file if one is configured, defaults otherwise.
    pub fn policy(&self) -> Result<OccupationPolicy> {
        match &self.policy_path {
            Some(path) => OccupationPolicy::load(path),
            None => Ok(OccupationPolicy::default()),
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
