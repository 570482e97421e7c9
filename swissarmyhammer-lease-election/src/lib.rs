//! Lease-based leader election over a hierarchical coordination service.
//!
//! Several processes contending for the same role agree on at most one leader
//! at a time. The shared truth lives in a ZooKeeper-style coordination service
//! reached through the [`CoordinationClient`] trait; this crate only adds
//! timing and versioning on top of it.
//!
//! # Overview
//!
//! - **Lease record**: `<leader_path>/leader_lease` holds the holder's
//!   expiration time, an optional progress key, and an application payload
//! - **Lock node**: every lease write happens inside the ephemeral
//!   `<leader_path>/__lock__` node, with the eligibility check repeated
//!   after the lock is taken
//! - **Half-lease margin**: a leader demotes itself as soon as less than half
//!   of its lease remains, whether or not it could renew
//! - **Progress key**: an instance presenting the same key as the current
//!   holder may take over the lease without waiting for it to expire
//! - **Preemption**: optionally, a version ledger detects a stale duplicate
//!   instance and terminates it
//!
//! Lease expirations use the local wall clock, so contending hosts must keep
//! their clock skew below half the lease timeout.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use swissarmyhammer_lease_election::{ElectionConfig, LeaderElector, MemoryCoordinator};
//!
//! let coordinator = MemoryCoordinator::new();
//! let config = ElectionConfig::new("/cluster/scheduler")
//!     .with_lease_timeout(Duration::from_secs(10))
//!     .with_loop_interval(Duration::from_secs(1));
//!
//! let elector = LeaderElector::new(config, Arc::new(coordinator.client()))?;
//! elector.set_leader_info("10.0.0.7:7000");
//! elector.on_become_leader(|| tracing::info!("now leading"));
//! elector.on_no_longer_leader(|| tracing::info!("stepped down"));
//! elector.start()?;
//!
//! // ... leader-only work guarded by elector.is_leader() ...
//!
//! elector.stop().await;
//! ```

mod clock;
mod config;
mod coordination;
mod elector;
mod engine;
mod error;
mod lease;
mod ledger;
mod memory;
mod state;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ElectionConfig, PreemptionConfig, DEFAULT_CACHE_STALE_AFTER_SECS, DEFAULT_LEASE_TIMEOUT_US,
    DEFAULT_LOOP_INTERVAL_US, DEFAULT_SHUTDOWN_GRACE_MS, ENV_PREFIX, LEADER_INFO_NODE, LEASE_NODE,
    LOCK_NODE, VERSION_DIR,
};
pub use coordination::{join_path, parent_path, CoordinationClient, CoordinationResult};
pub use elector::{ElectionCallback, LeaderElector};
pub use engine::{CampaignOutcome, LeaseEngine};
pub use error::{CoordinationError, ElectionError, Result};
pub use lease::{LeaseRecord, PROGRESS_KEY_SEPARATOR};
pub use ledger::{LedgerStatus, LocalVersionCache, VersionLedger, UNREGISTERED};
pub use memory::{MemoryClient, MemoryCoordinator};
pub use state::{ElectionState, SelfCheck};
