//! Configuration file handling for ferry.
//!
//! This crate provides configuration loading from `.ferry.toml` files with
//! serde defaults for every section, so a missing file yields a usable
//! (if inert) configuration.
//!
//! # Example
//!
//! ```
//! use ferry_config::{Config, load_config};
//! use std::path::Path;
//!
//! // Load config from a directory (looks for .ferry.toml)
//! let config = load_config(Path::new(".")).expect("load config");
//!
//! // Access configuration values
//! assert_eq!(config.status_context(), "upstream/gecko");
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

/// Default configuration file name
pub const CONFIG_FILE: &str = ".ferry.toml";

/// Status context owned by this system; inbound statuses carrying it are
/// our own reports and must never be routed back into the engine.
pub const DEFAULT_STATUS_CONTEXT: &str = "upstream/gecko";

/// Fallback stability repeat count when the configured value is unusable.
const DEFAULT_STABILITY_COUNT: u32 = 5;

/// Get the config file path for a directory
pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// Complete ferry configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for on-disk state (log storage lives beneath it).
    /// Empty means the working directory.
    #[serde(default)]
    root: PathBuf,
    /// Repository topology for the push handler.
    #[serde(default)]
    sync: SyncConfig,
    /// Try-push tuning.
    #[serde(default)]
    gecko: GeckoConfig,
    /// Relative storage locations under `root`.
    #[serde(default)]
    paths: PathsConfig,
    /// Local clones the engine operates on.
    #[serde(default)]
    repos: ReposConfig,
    /// Inbound status filtering.
    #[serde(default)]
    status: StatusConfig,
    /// Links into the CI dashboard.
    #[serde(default)]
    treeherder: TreeherderConfig,
    /// Defect-tracker endpoint.
    #[serde(default)]
    tracker: TrackerConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SyncConfig {
    /// Integration-repo-name → URL.
    #[serde(default)]
    integration: BTreeMap<String, String>,
    /// URL of the landing repo.
    #[serde(default)]
    landing: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GeckoConfig {
    #[serde(default, rename = "try")]
    try_: TryConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TryConfig {
    /// Cap on the number of test paths passed to the submission tool.
    #[serde(default)]
    max_tests: Option<usize>,
    /// Repeat count for stability runs. Kept untyped so a malformed value
    /// degrades to the default instead of rejecting the whole file.
    #[serde(default)]
    stability_count: Option<toml::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ReposConfig {
    /// Local gecko clone (try push records live in its refs).
    #[serde(default)]
    gecko: Option<PathBuf>,
    /// Local web-platform-tests clone.
    #[serde(default)]
    wpt: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PathsConfig {
    #[serde(default = "default_try_logs")]
    try_logs: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            try_logs: default_try_logs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatusConfig {
    #[serde(default = "default_status_context")]
    context: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            context: default_status_context(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TreeherderConfig {
    #[serde(default = "default_treeherder_base")]
    base: String,
}

impl Default for TreeherderConfig {
    fn default() -> Self {
        Self {
            base: default_treeherder_base(),
        }
    }
}

/// Defect-tracker REST endpoint configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Base URL of the tracker REST API, e.g. `https://bugzilla.example`.
    #[serde(default)]
    pub base: Option<String>,
    /// API key sent in the `X-Bugzilla-API-Key` header.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_tracker_timeout")]
    pub timeout_secs: u64,
}

fn default_try_logs() -> String {
    "try_logs".to_string()
}

fn default_status_context() -> String {
    DEFAULT_STATUS_CONTEXT.to_string()
}

fn default_treeherder_base() -> String {
    "https://treeherder.mozilla.org".to_string()
}

fn default_tracker_timeout() -> u64 {
    30
}

impl Config {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Root directory for on-disk state.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative path under `root` where try logs are stored.
    pub fn try_logs(&self) -> &str {
        &self.paths.try_logs
    }

    /// The status context this system reports under.
    pub fn status_context(&self) -> &str {
        &self.status.context
    }

    /// Treeherder base URL for dashboard links.
    pub fn treeherder_base(&self) -> &str {
        &self.treeherder.base
    }

    /// URL of the landing repo, when configured.
    pub fn landing_repo(&self) -> Option<&str> {
        self.sync.landing.as_deref()
    }

    /// Integration repos keyed by normalized URL, valued by repo name.
    ///
    /// URLs are forced to the https scheme: the VCS bridge reports pushes
    /// with whatever scheme the mirror was cloned over, and routing must
    /// not depend on that.
    pub fn integration_repos(&self) -> BTreeMap<String, String> {
        let mut repos = BTreeMap::new();
        for (name, url) in &self.sync.integration {
            match normalize_repo_url(url) {
                Ok(normalized) => {
                    repos.insert(normalized, name.clone());
                }
                Err(err) => {
                    warn!(repo = %name, url = %url, error = %err, "skipping unparseable integration repo URL");
                }
            }
        }
        repos
    }

    /// Optional cap on test paths passed to the submission tool.
    pub fn max_tests(&self) -> Option<usize> {
        self.gecko.try_.max_tests
    }

    /// Repeat count for stability try pushes.
    ///
    /// Falls back to 5 when the key is missing or not an integer.
    pub fn stability_count(&self) -> u32 {
        match &self.gecko.try_.stability_count {
            Some(toml::Value::Integer(n)) if *n >= 0 => *n as u32,
            Some(other) => {
                warn!(value = %other, "stability_count is not a non-negative integer, using default");
                DEFAULT_STABILITY_COUNT
            }
            None => DEFAULT_STABILITY_COUNT,
        }
    }

    /// Defect-tracker endpoint configuration.
    pub fn tracker(&self) -> &TrackerConfig {
        &self.tracker
    }

    /// Path of the local gecko clone, when configured.
    pub fn gecko_repo(&self) -> Option<&Path> {
        self.repos.gecko.as_deref()
    }

    /// Path of the local wpt clone, when configured.
    pub fn wpt_repo(&self) -> Option<&Path> {
        self.repos.wpt.as_deref()
    }

    /// Parse a config from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("failed to parse ferry config")
    }
}

/// Normalize a repository URL to the https scheme, preserving everything
/// after the scheme.
pub fn normalize_repo_url(raw: &str) -> Result<String> {
    let mut url = Url::parse(raw).with_context(|| format!("invalid repo URL {raw:?}"))?;
    url.set_scheme("https")
        .map_err(|_| anyhow::anyhow!("cannot force https on URL {raw:?}"))?;
    Ok(url.to_string())
}

/// Load config from a directory, looking for `.ferry.toml`.
///
/// A missing file yields the default configuration.
pub fn load_config(dir: &Path) -> Result<Config> {
    let path = config_path(dir);
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;

    toml::from_str(&content)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}
