//! Supervisor configuration.
//!
//! Gathers watch roots, the ledger root, listen parameters, and the timing
//! knobs of the scheduling loop. Serializable so a config file can feed it;
//! durations use the human-readable format.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::discovery::{WatchRoot, DEFAULT_GLOBS};

/// Supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YardConfig {
    /// Directories to discover database files under.
    pub roots: Vec<PathBuf>,

    /// Globs matched relative to each root.
    #[serde(default = "default_globs")]
    pub globs: Vec<String>,

    /// Ledger root holding session directories.
    pub ledger_root: PathBuf,

    /// Host children bind.
    #[serde(default = "default_listen_host")]
    pub listen_host: String,

    /// First port considered during allocation.
    #[serde(default = "default_port_start")]
    pub port_start: u16,

    /// Debounce window for filesystem events.
    #[serde(default = "default_debounce")]
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,

    /// Interval of the periodic full reconcile sweep.
    #[serde(default = "default_reconcile_interval")]
    #[serde(with = "humantime_serde")]
    pub reconcile_interval: Duration,

    /// Window during which a failed source file is not respawned.
    #[serde(default = "default_respawn_backoff")]
    #[serde(with = "humantime_serde")]
    pub respawn_backoff: Duration,

    /// Fast-exit confirmation window after spawn.
    #[serde(default = "default_fast_exit")]
    #[serde(with = "humantime_serde")]
    pub fast_exit: Duration,

    /// Timeout of the informational reachability probe.
    #[serde(default = "default_probe_timeout")]
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,

    /// Whether reconciliation may act on records owned by another token.
    #[serde(default)]
    pub adopt_foreign_state: bool,

    /// Whether session teardown kills every owned pid.
    #[serde(default)]
    pub kill_all_on_exit: bool,

    /// Whether the ad-hoc SQL admin endpoint is enabled.
    #[serde(default)]
    pub sql_endpoint_enabled: bool,
}

fn default_globs() -> Vec<String> {
    DEFAULT_GLOBS.iter().map(ToString::to_string).collect()
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port_start() -> u16 {
    4010
}

const fn default_debounce() -> Duration {
    Duration::from_millis(500)
}

const fn default_reconcile_interval() -> Duration {
    Duration::from_secs(3)
}

const fn default_respawn_backoff() -> Duration {
    Duration::from_secs(15)
}

const fn default_fast_exit() -> Duration {
    Duration::from_millis(750)
}

const fn default_probe_timeout() -> Duration {
    Duration::from_secs(15)
}

impl YardConfig {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> YardConfigBuilder {
        YardConfigBuilder::default()
    }

    /// The watch roots with their glob set applied.
    #[must_use]
    pub fn watch_roots(&self) -> Vec<WatchRoot> {
        self.roots
            .iter()
            .map(|root| WatchRoot::new(root).with_globs(self.globs.clone()))
            .collect()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No watch root was given.
    #[error("at least one watch root is required")]
    NoRoots,

    /// No ledger root was given.
    #[error("a ledger root is required")]
    NoLedgerRoot,
}

/// Builder for [`YardConfig`].
#[derive(Debug, Default)]
pub struct YardConfigBuilder {
    roots: Vec<PathBuf>,
    globs: Option<Vec<String>>,
    ledger_root: Option<PathBuf>,
    listen_host: Option<String>,
    port_start: Option<u16>,
    debounce: Option<Duration>,
    reconcile_interval: Option<Duration>,
    respawn_backoff: Option<Duration>,
    fast_exit: Option<Duration>,
    probe_timeout: Option<Duration>,
    adopt_foreign_state: bool,
    kill_all_on_exit: bool,
    sql_endpoint_enabled: bool,
}

impl YardConfigBuilder {
    /// Add a watch root.
    #[must_use]
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.roots.push(root.into());
        self
    }

    /// Replace the glob set.
    #[must_use]
    pub fn globs<I, S>(mut self, globs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.globs = Some(globs.into_iter().map(Into::into).collect());
        self
    }

    /// Set the ledger root.
    #[must_use]
    pub fn ledger_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.ledger_root = Some(root.into());
        self
    }

    /// Set the bind host for children.
    #[must_use]
    pub fn listen_host(mut self, host: impl Into<String>) -> Self {
        self.listen_host = Some(host.into());
        self
    }

    /// Set the first port considered during allocation.
    #[must_use]
    pub const fn port_start(mut self, port: u16) -> Self {
        self.port_start = Some(port);
        self
    }

    /// Set the event debounce window.
    #[must_use]
    pub const fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = Some(debounce);
        self
    }

    /// Set the periodic sweep interval.
    #[must_use]
    pub const fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = Some(interval);
        self
    }

    /// Set the respawn backoff window.
    #[must_use]
    pub const fn respawn_backoff(mut self, backoff: Duration) -> Self {
        self.respawn_backoff = Some(backoff);
        self
    }

    /// Set the fast-exit confirmation window.
    #[must_use]
    pub const fn fast_exit(mut self, window: Duration) -> Self {
        self.fast_exit = Some(window);
        self
    }

    /// Set the reachability probe timeout.
    #[must_use]
    pub const fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }

    /// Allow reconciliation over foreign records.
    #[must_use]
    pub const fn adopt_foreign_state(mut self, adopt: bool) -> Self {
        self.adopt_foreign_state = adopt;
        self
    }

    /// Kill every owned pid on exit.
    #[must_use]
    pub const fn kill_all_on_exit(mut self, kill: bool) -> Self {
        self.kill_all_on_exit = kill;
        self
    }

    /// Enable the ad-hoc SQL admin endpoint.
    #[must_use]
    pub const fn sql_endpoint_enabled(mut self, enabled: bool) -> Self {
        self.sql_endpoint_enabled = enabled;
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when no root or no ledger root was given.
    pub fn build(self) -> Result<YardConfig, ConfigError> {
        if self.roots.is_empty() {
            return Err(ConfigError::NoRoots);
        }
        let ledger_root = self.ledger_root.ok_or(ConfigError::NoLedgerRoot)?;

        Ok(YardConfig {
            roots: self.roots,
            globs: self.globs.unwrap_or_else(default_globs),
            ledger_root,
            listen_host: self.listen_host.unwrap_or_else(default_listen_host),
            port_start: self.port_start.unwrap_or_else(default_port_start),
            debounce: self.debounce.unwrap_or_else(default_debounce),
            reconcile_interval: self
                .reconcile_interval
                .unwrap_or_else(default_reconcile_interval),
            respawn_backoff: self
                .respawn_backoff
                .unwrap_or_else(default_respawn_backoff),
            fast_exit: self.fast_exit.unwrap_or_else(default_fast_exit),
            probe_timeout: self.probe_timeout.unwrap_or_else(default_probe_timeout),
            adopt_foreign_state: self.adopt_foreign_state,
            kill_all_on_exit: self.kill_all_on_exit,
            sql_endpoint_enabled: self.sql_endpoint_enabled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = YardConfig::builder()
            .root("/srv/data")
            .ledger_root("/var/lib/yard")
            .build()
            .unwrap();

        assert_eq!(config.listen_host, "127.0.0.1");
        assert_eq!(config.port_start, 4010);
        assert_eq!(config.respawn_backoff, Duration::from_secs(15));
        assert_eq!(config.reconcile_interval, Duration::from_secs(3));
        assert!(!config.adopt_foreign_state);
        assert!(!config.sql_endpoint_enabled);
    }

    #[test]
    fn test_builder_requires_roots_and_ledger() {
        assert!(matches!(
            YardConfig::builder().ledger_root("/l").build(),
            Err(ConfigError::NoRoots)
        ));
        assert!(matches!(
            YardConfig::builder().root("/r").build(),
            Err(ConfigError::NoLedgerRoot)
        ));
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = YardConfig::builder()
            .root("/srv/data")
            .ledger_root("/var/lib/yard")
            .debounce(Duration::from_millis(250))
            .build()
            .unwrap();

        let json = serde_json::to_string(&config).unwrap();
        let reread: YardConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(reread.debounce, Duration::from_millis(250));
        assert_eq!(reread.roots, config.roots);
    }

    #[test]
    fn test_watch_roots_carry_globs() {
        let config = YardConfig::builder()
            .root("/srv/data")
            .globs(["**/*.custom"])
            .ledger_root("/var/lib/yard")
            .build()
            .unwrap();

        let roots = config.watch_roots();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].globs, vec!["**/*.custom"]);
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
