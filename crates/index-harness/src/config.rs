//! Configuration parsing and validation.
//!
//! Index Harness is configured via a TOML file (default: `config/ixh.toml`).
//! The file is parsed into a [`Config`] struct and validated at load time
//! so that misconfiguration is caught before a worker claims a run.
//!
//! # Configuration Sections
//!
//! | Section | Required | Purpose |
//! |---------|----------|---------|
//! | `[db]` | Yes | SQLite database path |
//! | `[chunking]` | Yes | Token budget per chunk |
//! | `[coordination]` | No | Heartbeat, stall, and concurrency tuning |
//! | `[logging]` | No | Log output format |
//! | `[connectors.fixture.<name>]` | No | JSON fixture connectors |
//!
//! # Example Configuration
//!
//! ```toml
//! [db]
//! path = "./data/ixh.sqlite"
//!
//! [chunking]
//! max_tokens = 700
//!
//! [coordination]
//! heartbeat_interval_secs = 30
//! monitor_interval_secs = 60
//! stall_threshold_secs = 1800
//! stall_grace_secs = 3600
//! dead_after_missed_checks = 2
//! max_concurrent_batches = 4
//!
//! [logging]
//! format = "pretty"
//!
//! [connectors.fixture.eng-slack]
//! cc_pair_id = 1
//! path = "./fixtures/eng-slack.json"
//! perm_sync = true
//! resolver_path = "./fixtures/eng-slack-identities.json"
//! ```
//!
//! The database path and fixture paths are resolved relative to the config
//! file's directory.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use index_harness_core::liveness::MonitorConfig;

use crate::observability::LogFormat;

/// Upper bound on the stall threshold and grace window (one year).
const MAX_STALL_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

/// Top-level configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
}

/// Database configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file. Created on `ixh init`. Relative
    /// paths are resolved against the config file's directory.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Maximum whitespace tokens per chunk. Must be > 0.
    pub max_tokens: usize,
}

/// Heartbeat, stall, and batch concurrency settings.
#[derive(Debug, Deserialize, Clone)]
pub struct CoordinationConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold_secs: u64,
    #[serde(default = "default_stall_grace")]
    pub stall_grace_secs: u64,
    #[serde(default = "default_dead_after")]
    pub dead_after_missed_checks: i64,
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            monitor_interval_secs: default_monitor_interval(),
            stall_threshold_secs: default_stall_threshold(),
            stall_grace_secs: default_stall_grace(),
            dead_after_missed_checks: default_dead_after(),
            max_concurrent_batches: default_max_concurrent_batches(),
        }
    }
}

fn default_heartbeat_interval() -> u64 {
    30
}
fn default_monitor_interval() -> u64 {
    60
}
fn default_stall_threshold() -> u64 {
    1800
}
fn default_stall_grace() -> u64 {
    3600
}
fn default_dead_after() -> i64 {
    2
}
fn default_max_concurrent_batches() -> usize {
    4
}

impl CoordinationConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    /// Thresholds in the form the liveness monitor takes.
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            stall_threshold: chrono::Duration::seconds(self.stall_threshold_secs as i64),
            stall_grace: chrono::Duration::seconds(self.stall_grace_secs as i64),
            dead_after_missed_checks: self.dead_after_missed_checks,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

/// Connector configurations, keyed by type then instance name.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectorsConfig {
    #[serde(default)]
    pub fixture: BTreeMap<String, FixtureConnectorConfig>,
}

/// A connector that replays documents from a JSON file.
#[derive(Debug, Deserialize, Clone)]
pub struct FixtureConnectorConfig {
    /// Connector-credential pair this instance indexes for. Unique.
    pub cc_pair_id: i64,
    /// JSON file with the pages to serve.
    pub path: PathBuf,
    /// Serve perm-sync loads (documents carry external access).
    #[serde(default)]
    pub perm_sync: bool,
    /// JSON identity directory used by `ixh perm-sync`.
    #[serde(default)]
    pub resolver_path: Option<PathBuf>,
}

/// Load and validate a configuration file.
///
/// Relative database and fixture paths are resolved against the config
/// file's parent directory.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid TOML, or
/// fails validation.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;

    if let Some(base) = path.parent() {
        config.db.path = resolve_relative(base, &config.db.path);
        for fixture in config.connectors.fixture.values_mut() {
            fixture.path = resolve_relative(base, &fixture.path);
            if let Some(resolver) = fixture.resolver_path.as_mut() {
                *resolver = resolve_relative(base, resolver);
            }
        }
    }

    Ok(config)
}

fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }

    let c = &config.coordination;
    if c.heartbeat_interval_secs == 0 {
        bail!("coordination.heartbeat_interval_secs must be > 0");
    }
    if c.monitor_interval_secs == 0 {
        bail!("coordination.monitor_interval_secs must be > 0");
    }
    // A worker beating no faster than the monitor sweeps looks frozen.
    if c.heartbeat_interval_secs >= c.monitor_interval_secs {
        bail!(
            "coordination.heartbeat_interval_secs ({}) must be less than monitor_interval_secs ({})",
            c.heartbeat_interval_secs,
            c.monitor_interval_secs
        );
    }
    if c.stall_threshold_secs == 0 {
        bail!("coordination.stall_threshold_secs must be > 0");
    }
    for (key, value) in [
        ("stall_threshold_secs", c.stall_threshold_secs),
        ("stall_grace_secs", c.stall_grace_secs),
    ] {
        if value > MAX_STALL_WINDOW_SECS {
            bail!(
                "coordination.{} ({}) must be at most {}",
                key,
                value,
                MAX_STALL_WINDOW_SECS
            );
        }
    }
    if c.stall_grace_secs <= c.stall_threshold_secs {
        bail!(
            "coordination.stall_grace_secs ({}) must be greater than stall_threshold_secs ({})",
            c.stall_grace_secs,
            c.stall_threshold_secs
        );
    }
    if c.dead_after_missed_checks < 1 {
        bail!("coordination.dead_after_missed_checks must be >= 1");
    }
    if c.max_concurrent_batches == 0 {
        bail!("coordination.max_concurrent_batches must be >= 1");
    }

    let mut seen = BTreeMap::new();
    for (name, fixture) in &config.connectors.fixture {
        if let Some(other) = seen.insert(fixture.cc_pair_id, name) {
            bail!(
                "connectors.fixture.{} and connectors.fixture.{} share cc_pair_id {}",
                other,
                name,
                fixture.cc_pair_id
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("ixh.toml");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "[db]\npath = \"./ixh.sqlite\"\n\n[chunking]\nmax_tokens = 100\n",
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.coordination.heartbeat_interval_secs, 30);
        assert_eq!(config.coordination.dead_after_missed_checks, 2);
        assert_eq!(config.coordination.max_concurrent_batches, 4);
        assert!(matches!(config.logging.format, LogFormat::Pretty));
        assert!(config.connectors.fixture.is_empty());

        let monitor = config.coordination.monitor_config();
        assert_eq!(monitor.stall_threshold, chrono::Duration::minutes(30));
        assert_eq!(monitor.stall_grace, chrono::Duration::minutes(60));
    }

    #[test]
    fn fixture_paths_resolve_against_config_dir() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            r#"
[db]
path = "./ixh.sqlite"

[chunking]
max_tokens = 100

[logging]
format = "json"

[connectors.fixture.docs]
cc_pair_id = 7
path = "fixtures/docs.json"
resolver_path = "/abs/identities.json"
perm_sync = true
"#,
        );
        let config = load_config(&path).unwrap();
        let docs = &config.connectors.fixture["docs"];
        assert_eq!(docs.path, dir.path().join("fixtures/docs.json"));
        assert_eq!(
            docs.resolver_path.as_deref(),
            Some(Path::new("/abs/identities.json"))
        );
        assert!(docs.perm_sync);
        assert_eq!(docs.cc_pair_id, 7);
        assert!(matches!(config.logging.format, LogFormat::Json));
    }

    #[test]
    fn duplicate_cc_pair_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            r#"
[db]
path = "./ixh.sqlite"

[chunking]
max_tokens = 100

[connectors.fixture.a]
cc_pair_id = 1
path = "a.json"

[connectors.fixture.b]
cc_pair_id = 1
path = "b.json"
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("share cc_pair_id 1"));
    }

    #[test]
    fn grace_must_exceed_threshold() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            r#"
[db]
path = "./ixh.sqlite"

[chunking]
max_tokens = 100

[coordination]
stall_threshold_secs = 600
stall_grace_secs = 600
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("stall_grace_secs"));
    }

    #[test]
    fn zero_concurrency_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "[db]\npath = \"x\"\n\n[chunking]\nmax_tokens = 1\n\n[coordination]\nmax_concurrent_batches = 0\n",
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn db_path_resolves_against_config_dir() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "[db]\npath = \"data/ixh.sqlite\"\n\n[chunking]\nmax_tokens = 100\n",
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.db.path, dir.path().join("data/ixh.sqlite"));
    }

    #[test]
    fn heartbeat_must_be_faster_than_monitor() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            r#"
[db]
path = "./ixh.sqlite"

[chunking]
max_tokens = 100

[coordination]
heartbeat_interval_secs = 60
monitor_interval_secs = 60
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("heartbeat_interval_secs"));
    }

    #[test]
    fn oversized_stall_window_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            r#"
[db]
path = "./ixh.sqlite"

[chunking]
max_tokens = 100

[coordination]
stall_threshold_secs = 600
stall_grace_secs = 9223372036854776
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("stall_grace_secs"));
        assert!(err.to_string().contains("at most"));
    }
}
