//! Version ledger preemption
//!
//! Every instance running in preemptive mode registers an ephemeral, integer
//! named child under `<leader_path>/leader_version` and caches its number in a
//! local file. A restarted instance that finds a fresh cache file resumes its
//! old number instead of registering again. Whenever the largest registered
//! number is greater than ours, a newer instance has been scheduled for our
//! slot and we are preempted, permanently.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use tracing::{debug, info, warn};

use crate::config::PreemptionConfig;
use crate::coordination::{join_path, CoordinationClient};
use crate::error::{CoordinationError, ElectionError, Result};

/// Version of an instance that has not registered yet
pub const UNREGISTERED: i64 = -1;

/// Outcome of a ledger check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerStatus {
    /// Registered a new version during this check
    Registered(i64),
    /// Our version is the newest one
    Current(i64),
    /// A newer instance exists
    Preempted { local: i64, remote: i64 },
}

/// Local file holding this instance's registered version
///
/// The file's modification time tells how recently the owning instance was
/// alive; a file older than `stale_after` is ignored.
#[derive(Debug, Clone)]
pub struct LocalVersionCache {
    path: PathBuf,
    stale_after: Duration,
}

impl LocalVersionCache {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            path: path.into(),
            stale_after,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> ElectionError {
        ElectionError::CacheFile {
            path: self.path.clone(),
            source,
        }
    }

    fn age(mtime: SystemTime) -> Duration {
        SystemTime::now()
            .duration_since(mtime)
            .unwrap_or(Duration::ZERO)
    }

    /// Read the cached version and its modification time
    ///
    /// A missing, stale or unparsable file yields `None`.
    pub fn load(&self) -> Result<Option<(i64, SystemTime)>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        let mtime = fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .map_err(|e| self.io_error(e))?;

        if Self::age(mtime) > self.stale_after {
            info!(
                "Ignoring stale version cache {} (older than {:?})",
                self.path.display(),
                self.stale_after
            );
            return Ok(None);
        }

        match contents.trim().parse::<i64>() {
            Ok(version) if version >= 0 => Ok(Some((version, mtime))),
            _ => {
                warn!(
                    "Ignoring unparsable version cache {}: {:?}",
                    self.path.display(),
                    contents
                );
                Ok(None)
            }
        }
    }

    pub fn store(&self, version: i64) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        fs::write(&self.path, version.to_string()).map_err(|e| self.io_error(e))
    }

    /// Refresh the modification time when it is older than `interval`
    pub fn touch_if_older_than(&self, mtime: SystemTime, interval: Duration) -> Result<bool> {
        if Self::age(mtime) < interval {
            return Ok(false);
        }
        filetime::set_file_mtime(&self.path, FileTime::now()).map_err(|e| self.io_error(e))?;
        Ok(true)
    }

    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }
}

/// Registration and supersession check against the remote ledger
pub struct VersionLedger {
    client: Arc<dyn CoordinationClient>,
    dir: String,
    cache: LocalVersionCache,
    touch_interval: Duration,
    /// Sticky once set, there is no way back from preemption
    preempted: Mutex<Option<(i64, i64)>>,
    local_version: Mutex<i64>,
}

impl VersionLedger {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        dir: impl Into<String>,
        config: &PreemptionConfig,
    ) -> Self {
        let stale_after = config.stale_after();
        Self {
            client,
            dir: dir.into(),
            cache: LocalVersionCache::new(&config.cache_path, stale_after),
            touch_interval: stale_after / 10,
            preempted: Mutex::new(None),
            local_version: Mutex::new(UNREGISTERED),
        }
    }

    pub fn cache(&self) -> &LocalVersionCache {
        &self.cache
    }

    /// Last version seen by [`check`](Self::check)
    pub fn local_version(&self) -> i64 {
        *self
            .local_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_local_version(&self, version: i64) {
        *self
            .local_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = version;
    }

    /// `(local, remote)` versions once preempted
    pub fn preempted(&self) -> Option<(i64, i64)> {
        *self.preempted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn preempt(&self, local: i64, remote: i64) -> LedgerStatus {
        let mut preempted = self.preempted.lock().unwrap_or_else(PoisonError::into_inner);
        let (local, remote) = *preempted.get_or_insert((local, remote));
        LedgerStatus::Preempted { local, remote }
    }

    /// Largest integer-named child of the ledger directory, or [`UNREGISTERED`]
    async fn remote_max(&self) -> Result<i64> {
        self.client.create_path(&self.dir).await?;
        let children = self.client.list_children(&self.dir).await?;
        Ok(children
            .iter()
            .filter_map(|name| name.parse::<i64>().ok())
            .max()
            .unwrap_or(UNREGISTERED))
    }

    async fn register_node(&self, version: i64) -> Result<()> {
        let path = join_path(&self.dir, &version.to_string());
        self.client.create_node(&path, "", true).await?;
        Ok(())
    }

    /// Run one ledger check
    pub async fn check(&self) -> Result<LedgerStatus> {
        if let Some((local, remote)) = self.preempted() {
            return Ok(LedgerStatus::Preempted { local, remote });
        }

        let cached = self.cache.load()?;
        let remote_max = self.remote_max().await?;

        let Some((local, mtime)) = cached else {
            let version = remote_max + 1;
            self.register_node(version).await?;
            self.cache.store(version)?;
            self.set_local_version(version);
            info!("Registered version {} under {}", version, self.dir);
            return Ok(LedgerStatus::Registered(version));
        };
        self.set_local_version(local);

        if local < remote_max {
            return Ok(self.preempt(local, remote_max));
        }

        if local > remote_max {
            // Our ephemeral entry went away with an expired session.
            debug!("Version {} missing from {}, re-registering", local, self.dir);
            match self.register_node(local).await {
                Ok(())
                | Err(ElectionError::Coordination(CoordinationError::NodeExists { .. })) => {}
                Err(e) => return Err(e),
            }
        }

        if self.cache.touch_if_older_than(mtime, self.touch_interval)? {
            debug!("Refreshed version cache {}", self.cache.path().display());
        }
        Ok(LedgerStatus::Current(local))
    }

    /// Remove ledger entries older than our own version, best effort
    pub async fn remove_predecessors(&self) {
        let local = self.local_version();
        if local <= 0 {
            return;
        }
        let children = match self.client.list_children(&self.dir).await {
            Ok(children) => children,
            Err(e) => {
                warn!("Failed to list {} for cleanup: {}", self.dir, e);
                return;
            }
        };
        for name in children {
            if matches!(name.parse::<i64>(), Ok(version) if version < local) {
                let path = join_path(&self.dir, &name);
                if let Err(e) = self.client.remove(&path).await {
                    debug!("Failed to remove ledger entry {}: {}", path, e);
                }
            }
        }
    }
}
