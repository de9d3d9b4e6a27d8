//! Configuration for sisilink.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (SISILINK_HOME, SISILINK_MODE, SISILINK_WS_URL, SISILINK_HTTP_BASE)
//! 2. Config file (.sisilink/config.yaml)
//! 3. Defaults (~/.sisilink, real backend on localhost)
//!
//! Config file discovery:
//! - Searches current directory and parents for .sisilink/config.yaml
//! - `paths.home` is relative to the .sisilink/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::stabilizer::StabilizerConfig;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:10003";
pub const DEFAULT_HTTP_BASE: &str = "http://127.0.0.1:5000";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub backend: Option<BackendFileConfig>,
    #[serde(default)]
    pub transcript: Option<TranscriptFileConfig>,
    #[serde(default)]
    pub timing: Option<TimingFileConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .sisilink/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendFileConfig {
    pub mode: Option<String>,
    pub ws_url: Option<String>,
    pub http_base: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptFileConfig {
    pub history_limit: Option<usize>,
    pub echo_window_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimingFileConfig {
    pub reconnect_delay_ms: Option<u64>,
    pub audio_keep_window_ms: Option<u64>,
    pub audio_stop_hold_ms: Option<u64>,
    pub audio_stop_margin_ms: Option<u64>,
    pub audio_stop_min_wait_ms: Option<u64>,
}

/// Whether the live transport should run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    #[default]
    Real,
    Mock,
}

impl BackendMode {
    /// `real` (any case) is live; every other value is mock
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("real") {
            Self::Real
        } else {
            Self::Mock
        }
    }

    pub fn is_live(&self) -> bool {
        *self == Self::Real
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendConfig {
    pub mode: BackendMode,
    pub ws_url: String,
    pub http_base: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            mode: BackendMode::Real,
            ws_url: DEFAULT_WS_URL.to_string(),
            http_base: DEFAULT_HTTP_BASE.to_string(),
        }
    }
}

impl BackendConfig {
    /// Url the transport should hold open, if any
    pub fn live_target(&self) -> Option<&str> {
        let url = self.ws_url.trim();
        (self.mode.is_live() && !url.is_empty()).then_some(url)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptSettings {
    pub history_limit: usize,
    pub echo_window_ms: u64,
}

impl Default for TranscriptSettings {
    fn default() -> Self {
        Self {
            history_limit: 200,
            echo_window_ms: 12_000,
        }
    }
}

impl TranscriptSettings {
    pub fn echo_window(&self) -> Duration {
        Duration::from_millis(self.echo_window_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimingSettings {
    pub reconnect_delay_ms: u64,
    pub audio_keep_window_ms: u64,
    pub audio_stop_hold_ms: u64,
    pub audio_stop_margin_ms: u64,
    pub audio_stop_min_wait_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 1200,
            audio_keep_window_ms: 1100,
            audio_stop_hold_ms: 860,
            audio_stop_margin_ms: 40,
            audio_stop_min_wait_ms: 120,
        }
    }
}

impl TimingSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn stabilizer(&self) -> StabilizerConfig {
        StabilizerConfig {
            keep_window: Duration::from_millis(self.audio_keep_window_ms),
            stop_hold: Duration::from_millis(self.audio_stop_hold_ms),
            margin: Duration::from_millis(self.audio_stop_margin_ms),
            min_wait: Duration::from_millis(self.audio_stop_min_wait_ms),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Absolute path to sisilink home (state)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub backend: BackendConfig,
    pub transcript: TranscriptSettings,
    pub timing: TimingSettings,
}

impl ResolvedConfig {
    /// Defaults rooted at `home`
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            config_file: None,
            backend: BackendConfig::default(),
            transcript: TranscriptSettings::default(),
            timing: TimingSettings::default(),
        }
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.home.join("storage")
    }

    pub fn events_log_path(&self) -> PathBuf {
        self.home.join("events.jsonl")
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".sisilink").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge defaults, an optional config file and env overrides
fn resolve<F>(default_home: PathBuf, file: Option<(PathBuf, ConfigFile)>, env: F) -> ResolvedConfig
where
    F: Fn(&str) -> Option<String>,
{
    let mut resolved = ResolvedConfig::with_home(default_home);

    if let Some((config_path, config)) = file {
        if let Some(ref home_path) = config.paths.home {
            // home is relative to .sisilink/ directory
            let state_dir = config_path.parent().unwrap_or(Path::new("."));
            resolved.home = resolve_path(state_dir, home_path);
        }

        if let Some(backend) = config.backend {
            if let Some(mode) = backend.mode {
                resolved.backend.mode = BackendMode::parse(&mode);
            }
            if let Some(ws_url) = backend.ws_url {
                resolved.backend.ws_url = ws_url;
            }
            if let Some(http_base) = backend.http_base {
                resolved.backend.http_base = http_base;
            }
        }

        if let Some(transcript) = config.transcript {
            let t = &mut resolved.transcript;
            t.history_limit = transcript.history_limit.unwrap_or(t.history_limit).max(1);
            t.echo_window_ms = transcript.echo_window_ms.unwrap_or(t.echo_window_ms);
        }

        if let Some(timing) = config.timing {
            let t = &mut resolved.timing;
            t.reconnect_delay_ms = timing.reconnect_delay_ms.unwrap_or(t.reconnect_delay_ms);
            t.audio_keep_window_ms = timing.audio_keep_window_ms.unwrap_or(t.audio_keep_window_ms);
            t.audio_stop_hold_ms = timing.audio_stop_hold_ms.unwrap_or(t.audio_stop_hold_ms);
            t.audio_stop_margin_ms = timing.audio_stop_margin_ms.unwrap_or(t.audio_stop_margin_ms);
            t.audio_stop_min_wait_ms = timing
                .audio_stop_min_wait_ms
                .unwrap_or(t.audio_stop_min_wait_ms);
        }

        resolved.config_file = Some(config_path);
    }

    // Environment wins over the file
    if let Some(home) = env("SISILINK_HOME") {
        resolved.home = PathBuf::from(home);
    }
    if let Some(mode) = env("SISILINK_MODE") {
        resolved.backend.mode = BackendMode::parse(&mode);
    }
    if let Some(ws_url) = env("SISILINK_WS_URL") {
        resolved.backend.ws_url = ws_url;
    }
    if let Some(http_base) = env("SISILINK_HTTP_BASE") {
        resolved.backend.http_base = http_base;
    }

    resolved
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    // Default home directory
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".sisilink");

    let file = match find_config_file() {
        Some(path) => {
            let config = load_config_file(&path)?;
            Some((path, config))
        }
        None => None,
    };

    Ok(resolve(default_home, file, |key| {
        std::env::var(key).ok().filter(|v| !v.trim().is_empty())
    }))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the sisilink home directory
pub fn sisilink_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the key/value storage directory ($SISILINK_HOME/storage)
pub fn storage_dir() -> Result<PathBuf> {
    Ok(config()?.storage_dir())
}

/// Get the diagnostics log path ($SISILINK_HOME/events.jsonl)
pub fn events_log_path() -> Result<PathBuf> {
    Ok(config()?.events_log_path())
}
