//! Control-plane configuration.
//!
//! Precedence, lowest first: built-in defaults, an optional TOML file,
//! `CONVOY_*` environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConvoyError, ConvoyResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub scheduler: SchedulerSection,
    pub builds: BuildSection,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub workers: usize,
    pub queue_capacity: usize,
    pub sweep_interval_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            workers: 5,
            queue_capacity: 100,
            sweep_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    #[default]
    InProcess,
    Farm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSection {
    /// Concurrent local builds platform-wide.
    pub slots: usize,
    /// Budget for slot wait plus build, per attempt.
    pub timeout_secs: u64,
    pub mode: BuildMode,
    pub farm_url: Option<String>,
    pub farm_api_key: Option<String>,
    pub farm_timeout_secs: u64,
    /// Where the farm reports job completion.
    pub callback_url: Option<String>,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            slots: 1,
            timeout_secs: 30 * 60,
            mode: BuildMode::InProcess,
            farm_url: None,
            farm_api_key: None,
            farm_timeout_secs: 30,
            callback_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            level: "info".to_string(),
        }
    }
}

impl ControlPlaneConfig {
    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(raw: &str) -> ConvoyResult<Self> {
        toml::from_str(raw).map_err(|e| ConvoyError::Config(e.to_string()))
    }

    /// Defaults, then the file at `path` (if given), then the environment.
    pub fn load(path: Option<&Path>) -> ConvoyResult<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// [`load`](Self::load) with `lookup` standing in for the environment.
    pub fn load_with(
        path: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> ConvoyResult<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    ConvoyError::Config(format!("failed to read {}: {e}", path.display()))
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> ConvoyResult<Self> {
        Self::load(None)
    }

    /// Overlay `CONVOY_*` variables using `lookup` as the environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ConvoyResult<()> {
        fn parsed<T: std::str::FromStr>(key: &str, raw: String) -> ConvoyResult<T> {
            raw.trim()
                .parse()
                .map_err(|_| ConvoyError::Config(format!("{key}: cannot parse '{raw}'")))
        }

        if let Some(v) = lookup("CONVOY_WORKERS") {
            self.scheduler.workers = parsed("CONVOY_WORKERS", v)?;
        }
        if let Some(v) = lookup("CONVOY_QUEUE_CAPACITY") {
            self.scheduler.queue_capacity = parsed("CONVOY_QUEUE_CAPACITY", v)?;
        }
        if let Some(v) = lookup("CONVOY_SWEEP_INTERVAL_SECS") {
            self.scheduler.sweep_interval_secs = parsed("CONVOY_SWEEP_INTERVAL_SECS", v)?;
        }
        if let Some(v) = lookup("CONVOY_BUILD_SLOTS") {
            self.builds.slots = parsed("CONVOY_BUILD_SLOTS", v)?;
        }
        if let Some(v) = lookup("CONVOY_BUILD_TIMEOUT_SECS") {
            self.builds.timeout_secs = parsed("CONVOY_BUILD_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("CONVOY_BUILD_MODE") {
            self.builds.mode = match v.trim() {
                "in_process" => BuildMode::InProcess,
                "farm" => BuildMode::Farm,
                other => {
                    return Err(ConvoyError::Config(format!(
                        "CONVOY_BUILD_MODE: unknown mode '{other}'"
                    )))
                }
            };
        }
        if let Some(v) = lookup("CONVOY_FARM_URL") {
            self.builds.farm_url = Some(v);
        }
        if let Some(v) = lookup("CONVOY_FARM_API_KEY") {
            self.builds.farm_api_key = Some(v);
        }
        if let Some(v) = lookup("CONVOY_LOG_JSON") {
            self.logging.json = parsed("CONVOY_LOG_JSON", v)?;
        }
        if let Some(v) = lookup("CONVOY_LOG_LEVEL") {
            self.logging.level = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConvoyResult<()> {
        let fail = |msg: &str| Err(ConvoyError::Config(msg.to_string()));
        if self.scheduler.workers == 0 {
            return fail("scheduler.workers must be at least 1");
        }
        if self.scheduler.queue_capacity == 0 {
            return fail("scheduler.queue_capacity must be at least 1");
        }
        if self.scheduler.sweep_interval_secs == 0 {
            return fail("scheduler.sweep_interval_secs must be at least 1");
        }
        if self.builds.slots == 0 {
            return fail("builds.slots must be at least 1");
        }
        if self.builds.timeout_secs == 0 {
            return fail("builds.timeout_secs must be at least 1");
        }
        if self.builds.mode == BuildMode::Farm && self.builds.farm_url.is_none() {
            return fail("builds.mode = \"farm\" requires builds.farm_url");
        }
        Ok(())
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.builds.timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.sweep_interval_secs)
    }
}
