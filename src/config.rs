// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process-wide downloader settings.
//!
//! Settings come from, in increasing precedence: built-in defaults, an
//! optional JSON file, and `STAGEDL_*` environment variables.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Default stall timeout, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 8;

/// Default number of simultaneously active transfers.
pub const DEFAULT_CONCURRENCY_CAP: usize = 1;

/// Environment variable overriding [`DownloaderConfig::timeout_secs`].
pub const ENV_TIMEOUT_SECS: &str = "STAGEDL_TIMEOUT_SECS";

/// Environment variable overriding [`DownloaderConfig::concurrency_cap`].
pub const ENV_CONCURRENCY: &str = "STAGEDL_CONCURRENCY";

/// Settings shared by every transfer of one [`Downloader`](crate::Downloader).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Seconds a transfer may go without receiving bytes. Zero disables it.
    pub timeout_secs: u64,
    /// Maximum number of byte transfers running at once. Must be at least 1.
    pub concurrency_cap: usize,
    /// Where in-progress files are staged.
    pub staging_dir: Option<PathBuf>,
    /// Where finished files land when a request gives no destination.
    pub cache_dir: Option<PathBuf>,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            concurrency_cap: DEFAULT_CONCURRENCY_CAP,
            staging_dir: None,
            cache_dir: None,
        }
    }
}

impl DownloaderConfig {
    /// Location of the user-level config file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("stagedl").join("config.json"))
            .unwrap_or_else(|| PathBuf::from(".stagedl/config.json"))
    }

    /// Load settings from a JSON file. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: DownloaderConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings no engine can honor.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency_cap == 0 {
            bail!("concurrency_cap must be at least 1");
        }
        Ok(())
    }

    /// Apply `STAGEDL_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup. Unparseable values are
    /// logged and ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup(ENV_TIMEOUT_SECS) {
            match raw.trim().parse::<u64>() {
                Ok(secs) => self.timeout_secs = secs,
                Err(_) => tracing::warn!(key = ENV_TIMEOUT_SECS, value = %raw, "ignoring invalid override"),
            }
        }
        if let Some(raw) = lookup(ENV_CONCURRENCY) {
            match raw.trim().parse::<usize>() {
                Ok(cap) if cap >= 1 => self.concurrency_cap = cap,
                _ => tracing::warn!(key = ENV_CONCURRENCY, value = %raw, "ignoring invalid override"),
            }
        }
        self
    }

    /// Stall timeout, or `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    /// Resolved staging directory.
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("stagedl"))
    }

    /// Resolved directory for finished files.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .map(|d| d.join("stagedl"))
                .unwrap_or_else(|| std::env::temp_dir().join("stagedl").join("cache"))
        })
    }
}
