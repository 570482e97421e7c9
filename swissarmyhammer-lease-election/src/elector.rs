//! Leader elector facade and election loops
//!
//! [`LeaderElector::start`] spawns two independent tokio tasks on the same
//! interval:
//!
//! - **try-lock**: version ledger check (preemptive mode only), reconnect if
//!   needed, then campaign as follower or self-check and renew as leader.
//! - **check-leader**: self-check only, so a try-lock iteration stuck on a slow
//!   coordinator cannot delay self-demotion.
//!
//! Applications learn about transitions only through the registered callbacks
//! and [`LeaderElector::is_leader`]; coordination errors are logged, never
//! returned.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{millis_to_micros, ElectionConfig};
use crate::coordination::CoordinationClient;
use crate::engine::{CampaignOutcome, LeaseEngine};
use crate::error::{ElectionError, Result};
use crate::ledger::{LedgerStatus, VersionLedger};
use crate::state::{ElectionState, SelfCheck};

/// Callback fired on an election transition
pub type ElectionCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default, Clone)]
struct Callbacks {
    become_leader: Option<ElectionCallback>,
    no_longer_leader: Option<ElectionCallback>,
    preempted: Option<ElectionCallback>,
}

/// Strings set by the application at any time
struct AuxInfo {
    leader_info: String,
    lease_info: String,
    leader_info_path: String,
}

struct Inner {
    config: ElectionConfig,
    engine: LeaseEngine,
    ledger: Option<VersionLedger>,
    state: ElectionState,
    info: Mutex<AuxInfo>,
    callbacks: RwLock<Callbacks>,
    forbid_campaign_us: AtomicI64,
    preempted: AtomicBool,
}

struct Loops {
    cancel: CancellationToken,
    try_lock: JoinHandle<()>,
    check_leader: JoinHandle<()>,
}

/// Lease-based leader election for one role
///
/// ```ignore
/// use std::sync::Arc;
/// use swissarmyhammer_lease_election::{ElectionConfig, LeaderElector, MemoryCoordinator};
///
/// let coordinator = MemoryCoordinator::new();
/// let elector = LeaderElector::new(
///     ElectionConfig::new("/cluster/scheduler"),
///     Arc::new(coordinator.client()),
/// )?;
/// elector.set_leader_info("10.0.0.7:7000");
/// elector.on_become_leader(|| println!("leading"));
/// elector.on_no_longer_leader(|| println!("following"));
/// elector.start()?;
/// // ...
/// elector.stop().await;
/// ```
pub struct LeaderElector {
    inner: Arc<Inner>,
    loops: Mutex<Option<Loops>>,
}

impl LeaderElector {
    /// Create an elector using the system clock
    pub fn new(config: ElectionConfig, client: Arc<dyn CoordinationClient>) -> Result<Self> {
        Self::with_clock(config, client, Arc::new(SystemClock))
    }

    /// Create an elector with an explicit clock
    pub fn with_clock(
        config: ElectionConfig,
        client: Arc<dyn CoordinationClient>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let engine = LeaseEngine::new(client.clone(), clock, &config);
        let ledger = config
            .preemption
            .enabled
            .then(|| VersionLedger::new(client, config.version_dir(), &config.preemption));
        let leader_info_path = config
            .leader_info_path
            .clone()
            .unwrap_or_else(|| config.default_leader_info_path());

        Ok(Self {
            inner: Arc::new(Inner {
                forbid_campaign_us: AtomicI64::new(config.forbid_campaign_us()),
                config,
                engine,
                ledger,
                state: ElectionState::new(),
                info: Mutex::new(AuxInfo {
                    leader_info: String::new(),
                    lease_info: String::new(),
                    leader_info_path,
                }),
                callbacks: RwLock::new(Callbacks::default()),
                preempted: AtomicBool::new(false),
            }),
            loops: Mutex::new(None),
        })
    }

    fn loops(&self) -> MutexGuard<'_, Option<Loops>> {
        self.loops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.inner.config
    }

    /// Spawn the election loops
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut loops = self.loops();
        if loops.is_some() {
            return Err(ElectionError::AlreadyRunning);
        }
        if let Some((local, remote)) = self.inner.ledger.as_ref().and_then(|l| l.preempted()) {
            return Err(ElectionError::Preempted { local, remote });
        }

        info!(
            "Starting leader election on {} (lease {}us, interval {}us)",
            self.inner.config.leader_path,
            self.inner.config.lease_timeout_us,
            self.inner.config.loop_interval_us
        );

        let cancel = CancellationToken::new();
        let try_lock = tokio::spawn(run_loop(
            self.inner.clone(),
            cancel.clone(),
            LoopKind::TryLock,
        ));
        let check_leader = tokio::spawn(run_loop(
            self.inner.clone(),
            cancel.clone(),
            LoopKind::CheckLeader,
        ));
        *loops = Some(Loops {
            cancel,
            try_lock,
            check_leader,
        });
        Ok(())
    }

    /// Stop the loops and give up leadership
    ///
    /// Both loops finish their current iteration before cleanup starts. A
    /// leader demotes itself without firing `on_no_longer_leader` and removes
    /// the lease and leader info records. In preemptive mode, a graceful stop
    /// also deletes the local version cache and waits out the shutdown grace
    /// period.
    pub async fn stop(&self) {
        let Some(loops) = self.loops().take() else {
            return;
        };
        loops.cancel.cancel();
        for (name, handle) in [("try-lock", loops.try_lock), ("check-leader", loops.check_leader)] {
            if let Err(e) = handle.await {
                error!("Election {} loop ended abnormally: {}", name, e);
            }
        }

        let inner = &self.inner;
        if inner.state.resign() {
            info!("Resigning leadership of {}", inner.config.leader_path);
            // Leader info goes first so a successor's record is never removed.
            let info_path = inner.info().leader_info_path.clone();
            if let Err(e) = inner.engine.remove_locked(&info_path).await {
                warn!("Failed to remove leader info {}: {}", info_path, e);
            }
            if let Err(e) = inner.engine.remove_lease().await {
                warn!("Failed to remove lease record: {}", e);
            }
        }

        if let Some(ledger) = &inner.ledger {
            if !self.is_preempted() {
                ledger.remove_predecessors().await;
                if let Err(e) = ledger.cache().remove() {
                    warn!("Failed to remove version cache: {}", e);
                }
                tokio::time::sleep(inner.config.preemption.shutdown_grace()).await;
            }
        }
        info!("Stopped leader election on {}", inner.config.leader_path);
    }

    /// Whether the loops are running
    pub fn is_running(&self) -> bool {
        self.loops()
            .as_ref()
            .is_some_and(|loops| !loops.cancel.is_cancelled())
    }

    pub fn is_leader(&self) -> bool {
        self.inner.state.is_leader()
    }

    /// Wall-clock microseconds until which this instance holds the lease
    pub fn lease_expiration_us(&self) -> i64 {
        self.inner.state.lease_expiration_us()
    }

    pub fn is_preempted(&self) -> bool {
        self.inner.preempted.load(Ordering::SeqCst)
    }

    /// Set the payload embedded in the lease record on every write
    pub fn set_lease_info(&self, info: impl Into<String>) {
        self.inner.info().lease_info = info.into();
    }

    /// Set the record written to the leader info path on promotion
    pub fn set_leader_info(&self, info: impl Into<String>) {
        self.inner.info().leader_info = info.into();
    }

    pub fn set_leader_info_path(&self, path: impl Into<String>) {
        self.inner.info().leader_info_path = path.into();
    }

    /// Cooldown after a self-check demotion before campaigning again
    pub fn set_forbid_campaign_leader_time(&self, ms: u64) {
        self.inner.forbid_campaign_us.store(millis_to_micros(ms), Ordering::SeqCst);
    }

    pub fn on_become_leader<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.callbacks_mut().become_leader = Some(Arc::new(callback));
    }

    pub fn on_no_longer_leader<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.callbacks_mut().no_longer_leader = Some(Arc::new(callback));
    }

    /// Handle preemption instead of exiting the process
    pub fn on_preempted<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.callbacks_mut().preempted = Some(Arc::new(callback));
    }
}

#[derive(Debug, Clone, Copy)]
enum LoopKind {
    TryLock,
    CheckLeader,
}

async fn run_loop(inner: Arc<Inner>, cancel: CancellationToken, kind: LoopKind) {
    let mut ticker = tokio::time::interval(inner.config.loop_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match kind {
            LoopKind::TryLock => {
                if inner.try_lock().await.is_break() {
                    cancel.cancel();
                    break;
                }
            }
            LoopKind::CheckLeader => {
                inner.check_leader();
            }
        }
    }
    debug!("Election {:?} loop exited", kind);
}

impl Inner {
    fn info(&self) -> MutexGuard<'_, AuxInfo> {
        self.info.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn callbacks(&self) -> Callbacks {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn callbacks_mut(&self) -> std::sync::RwLockWriteGuard<'_, Callbacks> {
        self.callbacks.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// One try-lock iteration; `Break` ends the loop for good
    async fn try_lock(&self) -> ControlFlow<()> {
        if let Some(ledger) = &self.ledger {
            match ledger.check().await {
                Ok(LedgerStatus::Preempted { local, remote }) => {
                    self.preempt(local, remote);
                    return ControlFlow::Break(());
                }
                Ok(status) => debug!("Version ledger status: {:?}", status),
                Err(e) => {
                    warn!("Version ledger check failed: {}", e);
                    self.check_leader();
                    return ControlFlow::Continue(());
                }
            }
        }

        let client = self.engine.client();
        if !client.is_connected() {
            if let Err(e) = client.reconnect().await {
                warn!("Coordination service unavailable: {}", e);
                self.check_leader();
                return ControlFlow::Continue(());
            }
            info!("Reconnected to coordination service");
        }

        if self.state.is_leader() {
            if self.check_leader() == SelfCheck::Safe {
                self.renew().await;
            }
        } else {
            self.campaign().await;
        }
        ControlFlow::Continue(())
    }

    async fn campaign(&self) {
        if !self.state.may_campaign(self.engine.now_us()) {
            debug!("Campaign forbidden during cooldown");
            return;
        }

        let lease_info = self.info().lease_info.clone();
        match self.engine.campaign(&lease_info).await {
            Ok(CampaignOutcome::Elected { expiration_us }) => {
                if !self.state.promote(expiration_us) {
                    return;
                }
                info!(
                    "Became leader of {} until {}",
                    self.config.leader_path, expiration_us
                );
                let (path, leader_info) = {
                    let info = self.info();
                    (info.leader_info_path.clone(), info.leader_info.clone())
                };
                if let Err(e) = self.engine.write_leader_info(&path, &leader_info).await {
                    warn!("Failed to write leader info {}: {}", path, e);
                }
                if let Some(callback) = self.callbacks().become_leader {
                    callback();
                }
            }
            Ok(CampaignOutcome::HeldElsewhere {
                expiration_us,
                progress_key,
            }) => {
                debug!(
                    "Lease held elsewhere until {} (progress key {:?})",
                    expiration_us, progress_key
                );
            }
            Err(ElectionError::LockContended { path }) => {
                debug!("Lock {} contended, campaign aborted", path);
            }
            Err(e) => warn!("Campaign failed: {}", e),
        }
    }

    async fn renew(&self) {
        let lease_info = self.info().lease_info.clone();
        match self.engine.hold(&lease_info).await {
            Ok(expiration_us) => {
                if !self.state.renew(expiration_us) {
                    debug!("Demoted while renewing, renewal ignored");
                }
            }
            Err(e) => warn!("Failed to renew lease: {}", e),
        }
    }

    /// Demote when less than half a lease remains
    fn check_leader(&self) -> SelfCheck {
        let now = self.engine.now_us();
        let result = self.state.self_check(
            now,
            self.config.lease_timeout_us(),
            self.forbid_campaign_us.load(Ordering::SeqCst),
        );
        if result == SelfCheck::Demoted {
            warn!(
                "No longer leader of {}: lease expires at {}, now {}",
                self.config.leader_path,
                self.state.lease_expiration_us(),
                now
            );
            if let Some(callback) = self.callbacks().no_longer_leader {
                callback();
            }
        }
        result
    }

    fn preempt(&self, local: i64, remote: i64) {
        if self.preempted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.resign();
        error!(
            "Preempted on {}: local version {} is behind {}",
            self.config.leader_path, local, remote
        );
        match self.callbacks().preempted {
            Some(callback) => callback(),
            None => exit_on_preemption(),
        }
    }
}

/// Termination policy used when no preemption handler is registered
fn exit_on_preemption() {
    error!("No preemption handler registered, exiting");
    std::process::exit(1);
}
