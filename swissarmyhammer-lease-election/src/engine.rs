//! Campaign and hold against the lease record
//!
//! Every write to the lease record happens inside the lock node:
//!
//! 1. read the lease record and check eligibility (skipped when holding)
//! 2. create the ephemeral `__lock__` node, exclusively
//! 3. re-read and re-check, since a competitor may have won in between
//! 4. write `now + lease_timeout` with our progress key and lease info
//! 5. remove the lock node, whatever happened in 3 and 4
//!
//! Ordering between processes comes only from the exclusive create in step 2.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::ElectionConfig;
use crate::coordination::{parent_path, CoordinationClient};
use crate::error::{CoordinationError, ElectionError, Result};
use crate::lease::LeaseRecord;

/// Result of a campaign attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CampaignOutcome {
    /// The lease was written; we are leader until `expiration_us`
    Elected { expiration_us: i64 },
    /// Another holder's lease is still valid
    HeldElsewhere {
        expiration_us: i64,
        progress_key: Option<String>,
    },
}

/// Lease read-check-lock-recheck-write protocol
pub struct LeaseEngine {
    client: Arc<dyn CoordinationClient>,
    clock: Arc<dyn Clock>,
    leader_path: String,
    lease_path: String,
    lock_path: String,
    lease_timeout_us: i64,
    progress_key: Option<String>,
}

impl LeaseEngine {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        clock: Arc<dyn Clock>,
        config: &ElectionConfig,
    ) -> Self {
        Self {
            client,
            clock,
            leader_path: config.leader_path.trim_end_matches('/').to_string(),
            lease_path: config.lease_path(),
            lock_path: config.lock_path(),
            lease_timeout_us: config.lease_timeout_us(),
            progress_key: config.progress_key().map(str::to_string),
        }
    }

    pub fn client(&self) -> &Arc<dyn CoordinationClient> {
        &self.client
    }

    pub fn now_us(&self) -> i64 {
        self.clock.now_us()
    }

    /// Read and decode the lease record, `None` when there is none
    pub async fn read_lease(&self) -> Result<Option<LeaseRecord>> {
        match self.client.get_data(&self.lease_path).await {
            Ok(text) => LeaseRecord::decode(&text).map(Some),
            Err(CoordinationError::NoNode { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The record that makes us ineligible at `now_us`, if any
    fn blocking(&self, record: Option<LeaseRecord>, now_us: i64) -> Option<CampaignOutcome> {
        record
            .filter(|r| r.blocks(now_us, self.progress_key.as_deref()))
            .map(|r| CampaignOutcome::HeldElsewhere {
                expiration_us: r.expiration_us,
                progress_key: r.progress_key,
            })
    }

    /// Create the lock node
    ///
    /// Any failure forces the client to reconnect, so a half-open session is
    /// never reused for the next attempt.
    pub async fn lock(&self) -> Result<()> {
        let created = match self.client.create_path(&self.leader_path).await {
            Ok(()) => self.client.create_node(&self.lock_path, "", true).await,
            Err(e) => Err(e),
        };
        let Err(e) = created else {
            return Ok(());
        };

        warn!("Failed to create lock node {}: {}", self.lock_path, e);
        if let Err(reconnect_err) = self.client.reconnect().await {
            warn!("Reconnect after lock failure failed: {}", reconnect_err);
        }
        match e {
            CoordinationError::NodeExists { path } => Err(ElectionError::LockContended { path }),
            other => Err(other.into()),
        }
    }

    /// Remove the lock node, best effort
    pub async fn unlock(&self) {
        match self.client.remove(&self.lock_path).await {
            Ok(()) | Err(CoordinationError::NoNode { .. }) => {}
            Err(e) => warn!("Failed to remove lock node {}: {}", self.lock_path, e),
        }
    }

    async fn write_lease(&self, expiration_us: i64, payload: &str) -> Result<()> {
        let data = LeaseRecord::encode(expiration_us, self.progress_key.as_deref(), payload);
        match self.client.set_data(&self.lease_path, &data).await {
            Err(CoordinationError::NoNode { .. }) => {
                self.client.create_node(&self.lease_path, &data, false).await?;
                Ok(())
            }
            other => Ok(other?),
        }
    }

    /// Try to acquire the lease
    ///
    /// `payload` is the application's lease info, embedded after the first
    /// line. Errors mean the attempt could not be completed and nothing was
    /// written.
    pub async fn campaign(&self, payload: &str) -> Result<CampaignOutcome> {
        let now = self.clock.now_us();
        if let Some(held) = self.blocking(self.read_lease().await?, now) {
            return Ok(held);
        }

        self.lock().await?;
        let result = self.campaign_locked(payload).await;
        self.unlock().await;
        result
    }

    async fn campaign_locked(&self, payload: &str) -> Result<CampaignOutcome> {
        let now = self.clock.now_us();
        if let Some(held) = self.blocking(self.read_lease().await?, now) {
            debug!("Lease on {} was taken while acquiring the lock", self.leader_path);
            return Ok(held);
        }

        let expiration_us = now.saturating_add(self.lease_timeout_us);
        self.write_lease(expiration_us, payload).await?;
        Ok(CampaignOutcome::Elected { expiration_us })
    }

    /// Extend a lease we already hold, returning the new expiration
    pub async fn hold(&self, payload: &str) -> Result<i64> {
        self.lock().await?;
        let expiration_us = self.clock.now_us().saturating_add(self.lease_timeout_us);
        let result = self.write_lease(expiration_us, payload).await;
        self.unlock().await;
        result.map(|()| expiration_us)
    }

    /// Create or overwrite the leader info record
    pub async fn write_leader_info(&self, path: &str, info: &str) -> Result<()> {
        if let Some(parent) = parent_path(path).filter(|p| *p != "/") {
            self.client.create_path(parent).await?;
        }
        match self.client.set_data(path, info).await {
            Err(CoordinationError::NoNode { .. }) => {
                self.client.create_node(path, info, false).await?;
                Ok(())
            }
            other => Ok(other?),
        }
    }

    /// Delete a node inside its own lock/unlock pair
    pub async fn remove_locked(&self, path: &str) -> Result<()> {
        self.lock().await?;
        let result = match self.client.remove(path).await {
            Ok(()) | Err(CoordinationError::NoNode { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        };
        self.unlock().await;
        result
    }

    /// Delete the lease record
    pub async fn remove_lease(&self) -> Result<()> {
        self.remove_locked(&self.lease_path).await
    }
}
