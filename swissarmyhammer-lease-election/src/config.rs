//! Election configuration
//!
//! Configuration can be built in code with the `with_*` methods or loaded with
//! [`ElectionConfig::load`], which layers (later wins):
//! 1. Default values
//! 2. An optional TOML, YAML or JSON file
//! 3. Environment variables prefixed `SAH_ELECTION_`, with `__` separating
//!    nested keys (e.g. `SAH_ELECTION_PREEMPTION__ENABLED=true`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::coordination::join_path;
use crate::error::{ElectionError, Result};

/// Environment variable prefix read by [`ElectionConfig::load`]
pub const ENV_PREFIX: &str = "SAH_ELECTION_";

/// Name of the lease record node under the leader path
pub const LEASE_NODE: &str = "leader_lease";
/// Name of the lock node under the leader path
pub const LOCK_NODE: &str = "__lock__";
/// Name of the version ledger directory under the leader path
pub const VERSION_DIR: &str = "leader_version";
/// Name of the default leader info node under the leader path
pub const LEADER_INFO_NODE: &str = "leader_info";

/// Default lease timeout (10 seconds)
pub const DEFAULT_LEASE_TIMEOUT_US: u64 = 10_000_000;
/// Default loop interval (1 second)
pub const DEFAULT_LOOP_INTERVAL_US: u64 = 1_000_000;
/// Default staleness window of the local version cache (30 minutes)
pub const DEFAULT_CACHE_STALE_AFTER_SECS: u64 = 30 * 60;
/// Default pause at the end of a graceful shutdown in preemptive mode
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 3_000;

/// Milliseconds to microseconds, saturating at `i64::MAX`
pub(crate) fn millis_to_micros(ms: u64) -> i64 {
    i64::try_from(ms.saturating_mul(1_000)).unwrap_or(i64::MAX)
}

/// Preemption via the version ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreemptionConfig {
    /// Whether the version ledger check runs at all
    pub enabled: bool,
    /// Local file caching this instance's registered version
    pub cache_path: PathBuf,
    /// Age after which the cache file is ignored
    pub stale_after_secs: u64,
    /// Pause after a graceful shutdown before returning
    pub shutdown_grace_ms: u64,
}

impl Default for PreemptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_path: PathBuf::from("leader_version"),
            stale_after_secs: DEFAULT_CACHE_STALE_AFTER_SECS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

impl PreemptionConfig {
    /// Enabled preemption caching the version at `cache_path`
    pub fn new(cache_path: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            cache_path: cache_path.into(),
            ..Self::default()
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after_secs = stale_after.as_secs();
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Configuration for a [`LeaderElector`](crate::LeaderElector)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Coordination service path of the contested role
    pub leader_path: String,
    /// Lease length written on every campaign and renewal
    pub lease_timeout_us: u64,
    /// Period of both election loops
    pub loop_interval_us: u64,
    /// Candidacy identity allowing fast reacquisition of our own lease
    pub progress_key: Option<String>,
    /// Where the leader info record lives, `<leader_path>/leader_info` if unset
    pub leader_info_path: Option<String>,
    /// Cooldown after a self-check demotion, 0 to disable
    pub forbid_campaign_ms: u64,
    /// Version ledger preemption
    pub preemption: PreemptionConfig,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            leader_path: String::new(),
            lease_timeout_us: DEFAULT_LEASE_TIMEOUT_US,
            loop_interval_us: DEFAULT_LOOP_INTERVAL_US,
            progress_key: None,
            leader_info_path: None,
            forbid_campaign_ms: 0,
            preemption: PreemptionConfig::default(),
        }
    }
}

impl ElectionConfig {
    /// Default configuration for `leader_path`
    pub fn new(leader_path: impl Into<String>) -> Self {
        Self {
            leader_path: leader_path.into(),
            ..Self::default()
        }
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout_us = u64::try_from(lease_timeout.as_micros()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_loop_interval(mut self, loop_interval: Duration) -> Self {
        self.loop_interval_us = u64::try_from(loop_interval.as_micros()).unwrap_or(u64::MAX);
        self
    }

    /// Set the progress key; an empty key disables the feature
    pub fn with_progress_key(mut self, progress_key: impl Into<String>) -> Self {
        let key = progress_key.into();
        self.progress_key = (!key.is_empty()).then_some(key);
        self
    }

    pub fn with_leader_info_path(mut self, path: impl Into<String>) -> Self {
        self.leader_info_path = Some(path.into());
        self
    }

    pub fn with_forbid_campaign_time(mut self, cooldown: Duration) -> Self {
        self.forbid_campaign_ms = u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_preemption(mut self, preemption: PreemptionConfig) -> Self {
        self.preemption = preemption;
        self
    }

    /// Load configuration from defaults, an optional file and the environment
    ///
    /// The file format is chosen by extension (`toml`, `yaml`/`yml`, `json`).
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));

        if let Some(path) = file {
            debug!("Loading election config file {}", path.display());
            figment = match path.extension().and_then(|ext| ext.to_str()) {
                Some("toml") => figment.merge(Toml::file(path)),
                Some("yaml") | Some("yml") => figment.merge(Yaml::file(path)),
                Some("json") => figment.merge(Json::file(path)),
                other => {
                    return Err(ElectionError::invalid_config(format!(
                        "unsupported config file extension {:?}",
                        other
                    )))
                }
            };
        }

        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations under which the election cannot work
    pub fn validate(&self) -> Result<()> {
        if !self.leader_path.starts_with('/') || self.leader_path.trim_end_matches('/').is_empty()
        {
            return Err(ElectionError::invalid_config(format!(
                "leader_path must be an absolute non-root path, got {:?}",
                self.leader_path
            )));
        }
        if self.lease_timeout_us == 0 || self.lease_timeout_us > i64::MAX as u64 {
            return Err(ElectionError::invalid_config(
                "lease_timeout_us must be positive",
            ));
        }
        if self.loop_interval_us == 0 {
            return Err(ElectionError::invalid_config(
                "loop_interval_us must be positive",
            ));
        }
        // A leader renews once per interval and demotes itself at half a lease.
        if self.loop_interval_us >= self.lease_timeout_us / 2 {
            return Err(ElectionError::invalid_config(format!(
                "loop_interval_us ({}) must be less than half of lease_timeout_us ({})",
                self.loop_interval_us, self.lease_timeout_us
            )));
        }
        if self.preemption.enabled && self.preemption.cache_path.as_os_str().is_empty() {
            return Err(ElectionError::invalid_config(
                "preemption.cache_path must be set when preemption is enabled",
            ));
        }
        // A zero window makes every cache stale and registers a new version each iteration.
        if self.preemption.enabled && self.preemption.stale_after_secs == 0 {
            return Err(ElectionError::invalid_config(
                "preemption.stale_after_secs must be positive",
            ));
        }
        Ok(())
    }

    pub fn lease_timeout_us(&self) -> i64 {
        self.lease_timeout_us as i64
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_micros(self.loop_interval_us)
    }

    pub fn forbid_campaign_us(&self) -> i64 {
        millis_to_micros(self.forbid_campaign_ms)
    }

    pub fn progress_key(&self) -> Option<&str> {
        self.progress_key.as_deref().filter(|key| !key.is_empty())
    }

    fn base_path(&self) -> &str {
        self.leader_path.trim_end_matches('/')
    }

    pub fn lease_path(&self) -> String {
        join_path(self.base_path(), LEASE_NODE)
    }

    pub fn lock_path(&self) -> String {
        join_path(self.base_path(), LOCK_NODE)
    }

    pub fn version_dir(&self) -> String {
        join_path(self.base_path(), VERSION_DIR)
    }

    pub fn default_leader_info_path(&self) -> String {
        join_path(self.base_path(), LEADER_INFO_NODE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        let config = ElectionConfig::new("/cluster/master/");
        assert_eq!(config.lease_path(), "/cluster/master/leader_lease");
        assert_eq!(config.lock_path(), "/cluster/master/__lock__");
        assert_eq!(config.version_dir(), "/cluster/master/leader_version");
        assert_eq!(
            config.default_leader_info_path(),
            "/cluster/master/leader_info"
        );
    }

    #[test]
    fn test_builder() {
        let config = ElectionConfig::new("/svc")
            .with_lease_timeout(Duration::from_secs(1))
            .with_loop_interval(Duration::from_millis(100))
            .with_progress_key("p1")
            .with_forbid_campaign_time(Duration::from_millis(250))
            .with_preemption(PreemptionConfig::new("/tmp/version"));

        assert_eq!(config.lease_timeout_us(), 1_000_000);
        assert_eq!(config.loop_interval(), Duration::from_millis(100));
        assert_eq!(config.progress_key(), Some("p1"));
        assert_eq!(config.forbid_campaign_us(), 250_000);
        assert!(config.preemption.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_progress_key_is_disabled() {
        let config = ElectionConfig::new("/svc").with_progress_key("");
        assert_eq!(config.progress_key(), None);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(ElectionConfig::new("").validate().is_err());
        assert!(ElectionConfig::new("/").validate().is_err());
        assert!(ElectionConfig::new("relative").validate().is_err());
        assert!(ElectionConfig::new("/svc")
            .with_lease_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(ElectionConfig::new("/svc")
            .with_lease_timeout(Duration::from_secs(1))
            .with_loop_interval(Duration::from_millis(500))
            .validate()
            .is_err());
        assert!(ElectionConfig::new("/svc")
            .with_preemption(PreemptionConfig::new(""))
            .validate()
            .is_err());
        let never_fresh = PreemptionConfig::new("/tmp/version").with_stale_after(Duration::ZERO);
        assert!(ElectionConfig::new("/svc")
            .with_preemption(never_fresh)
            .validate()
            .is_err());
        // Disabled preemption ignores the cache settings.
        assert!(ElectionConfig::new("/svc")
            .with_preemption(PreemptionConfig {
                enabled: false,
                stale_after_secs: 0,
                ..PreemptionConfig::default()
            })
            .validate()
            .is_ok());
    }

    #[test]
    fn test_huge_cooldown_saturates() {
        let config = ElectionConfig::new("/svc").with_forbid_campaign_time(Duration::MAX);
        assert_eq!(config.forbid_campaign_us(), i64::MAX);
        assert_eq!(millis_to_micros(u64::MAX), i64::MAX);
        assert_eq!(millis_to_micros(9_223_372_036_854_775), 9_223_372_036_854_775_000);
        assert_eq!(millis_to_micros(9_223_372_036_854_776), i64::MAX);
    }

    #[test]
    fn test_load_file_and_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "election.toml",
                r#"
                leader_path = "/cluster/scheduler"
                lease_timeout_us = 2000000
                progress_key = "sched-1"

                [preemption]
                enabled = true
                cache_path = "/var/lib/scheduler/version"
                "#,
            )?;
            jail.set_env("SAH_ELECTION_LOOP_INTERVAL_US", "200000");
            jail.set_env("SAH_ELECTION_PREEMPTION__STALE_AFTER_SECS", "60");

            let config = ElectionConfig::load(Some(Path::new("election.toml")))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.leader_path, "/cluster/scheduler");
            assert_eq!(config.lease_timeout_us, 2_000_000);
            assert_eq!(config.loop_interval_us, 200_000);
            assert_eq!(config.progress_key(), Some("sched-1"));
            assert!(config.preemption.enabled);
            assert_eq!(config.preemption.stale_after_secs, 60);
            assert_eq!(
                config.preemption.shutdown_grace_ms,
                DEFAULT_SHUTDOWN_GRACE_MS
            );
            Ok(())
        });
    }

    #[test]
    fn test_load_validates() {
        figment::Jail::expect_with(|_jail| {
            let result = ElectionConfig::load(None);
            assert!(matches!(result, Err(ElectionError::InvalidConfig { .. })));
            Ok(())
        });
    }

    #[test]
    fn test_load_rejects_unknown_extension() {
        let result = ElectionConfig::load(Some(Path::new("election.ini")));
        assert!(matches!(result, Err(ElectionError::InvalidConfig { .. })));
    }
}
