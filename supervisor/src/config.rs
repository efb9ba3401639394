use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_WATCH_PATH: &str = "src";
pub const DEFAULT_WATCH_EXTENSION: &str = ".rs";
/// Version control, build output and lock files.
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[".git/", ".hg/", ".svn/", "target/", "*.lock"];
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;
pub const DEFAULT_TERMINATION_TIMEOUT_MS: u64 = 1_500;
pub const DEFAULT_RELOAD_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;

/// Supervisor configuration. Immutable once the supervisor has started.
///
/// Every field has a default, so an empty TOML document is a valid config.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ReloadConfig {
    /// Directories watched recursively for source changes.
    #[serde(default = "default_watch_paths")]
    pub watch_paths: Vec<PathBuf>,
    /// A changed file is only considered if its path ends with one of these.
    #[serde(default = "default_watch_extensions")]
    pub watch_extensions: Vec<String>,
    /// Root-relative substrings, `*` wildcards or `**pattern**` wraps to ignore.
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,
    /// Quiet period after the last accepted change before a reload fires.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default)]
    pub verbose: bool,
    /// Grace period between the polite signal and the forceful kill.
    #[serde(default = "default_termination_timeout_ms")]
    pub termination_timeout_ms: u64,
    /// Upper bound on a single live-patch round trip.
    #[serde(default = "default_reload_timeout_ms")]
    pub reload_timeout_ms: u64,
    /// Upper bound on connecting to an announced live-patch endpoint.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            watch_paths: default_watch_paths(),
            watch_extensions: default_watch_extensions(),
            ignore_patterns: default_ignore_patterns(),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            verbose: false,
            termination_timeout_ms: DEFAULT_TERMINATION_TIMEOUT_MS,
            reload_timeout_ms: DEFAULT_RELOAD_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl ReloadConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn termination_timeout(&self) -> Duration {
        Duration::from_millis(self.termination_timeout_ms)
    }

    pub fn reload_timeout(&self) -> Duration {
        Duration::from_millis(self.reload_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Returns the configured watch paths that currently exist on disk,
    /// preserving their configured order.
    pub fn existing_watch_paths(&self) -> Vec<PathBuf> {
        self.watch_paths
            .iter()
            .filter(|p| p.exists())
            .cloned()
            .collect()
    }

    /// Extensions with a guaranteed leading `.`, so `"rs"` and `".rs"` behave
    /// the same and `"rs"` never matches a file called `bars`.
    pub fn normalized_extensions(&self) -> Vec<String> {
        self.watch_extensions
            .iter()
            .filter(|e| !e.is_empty())
            .map(|e| {
                if e.starts_with('.') {
                    e.clone()
                } else {
                    format!(".{e}")
                }
            })
            .collect()
    }
}

/// Loads the config file at `path`, returning `ReloadConfig::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<ReloadConfig> {
    if !path.exists() {
        return Ok(ReloadConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn default_watch_paths() -> Vec<PathBuf> {
    vec![PathBuf::from(DEFAULT_WATCH_PATH)]
}

fn default_watch_extensions() -> Vec<String> {
    vec![DEFAULT_WATCH_EXTENSION.to_string()]
}

fn default_ignore_patterns() -> Vec<String> {
    DEFAULT_IGNORE_PATTERNS.iter().map(|p| p.to_string()).collect()
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

fn default_termination_timeout_ms() -> u64 {
    DEFAULT_TERMINATION_TIMEOUT_MS
}

fn default_reload_timeout_ms() -> u64 {
    DEFAULT_RELOAD_TIMEOUT_MS
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}
