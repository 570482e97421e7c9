//! Integration tests for lease election
//!
//! These tests run real electors against the in-memory coordinator with the
//! system clock, so they are timing based and run serially:
//! - Two-instance campaign, renewal and handover
//! - Fast reacquisition through the progress key
//! - Self-demotion when the coordinator becomes unreachable
//! - Version ledger preemption

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serial_test::serial;
use tempfile::TempDir;

use swissarmyhammer_lease_election::{
    Clock, CoordinationClient, ElectionConfig, LeaderElector, LeaseRecord, MemoryClient,
    MemoryCoordinator, PreemptionConfig, SystemClock,
};

// =============================================================================
// Test Constants
// =============================================================================

const LEADER_PATH: &str = "/cluster/scheduler";

/// Lease timeout used by every elector in these tests.
const LEASE_TIMEOUT: Duration = Duration::from_secs(1);

/// Loop interval used by every elector in these tests.
const LOOP_INTERVAL: Duration = Duration::from_millis(100);

/// Polling step while waiting for a condition.
const POLL_STEP: Duration = Duration::from_millis(10);

// =============================================================================
// Test Helpers
// =============================================================================

fn config() -> ElectionConfig {
    ElectionConfig::new(LEADER_PATH)
        .with_lease_timeout(LEASE_TIMEOUT)
        .with_loop_interval(LOOP_INTERVAL)
}

fn preemptive_config(cache_path: &Path) -> ElectionConfig {
    config().with_preemption(
        PreemptionConfig::new(cache_path).with_shutdown_grace(Duration::from_millis(50)),
    )
}

fn elector(config: ElectionConfig, client: &MemoryClient) -> LeaderElector {
    LeaderElector::new(config, Arc::new(client.clone())).unwrap()
}

/// Register a callback counting its invocations.
fn count_calls(register: impl FnOnce(Box<dyn Fn() + Send + Sync>)) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let handle = count.clone();
    register(Box::new(move || {
        handle.fetch_add(1, Ordering::SeqCst);
    }));
    count
}

/// Poll `condition` until it holds or `timeout` passes.
async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(POLL_STEP).await;
    }
    condition()
}

// =============================================================================
// Tests
// =============================================================================

#[test_log::test(tokio::test)]
#[serial]
async fn test_two_electors_campaign_hold_and_handover() {
    let coordinator = MemoryCoordinator::new();
    let client_a = coordinator.client();
    let client_b = coordinator.client();
    let a = elector(config(), &client_a);
    let b = elector(config(), &client_b);
    a.set_leader_info("a:7000");
    b.set_leader_info("b:7000");

    a.start().unwrap();
    assert!(wait_until(2 * LOOP_INTERVAL + POLL_STEP * 5, || a.is_leader()).await);

    b.start().unwrap();
    let mut last_expiration = a.lease_expiration_us();
    let observe_until = Instant::now() + Duration::from_millis(1_500);
    while Instant::now() < observe_until {
        assert!(!(a.is_leader() && b.is_leader()), "both electors are leader");
        assert!(a.is_leader(), "leader lost its lease while renewing");
        let expiration = a.lease_expiration_us();
        assert!(expiration >= last_expiration);
        last_expiration = expiration;
        tokio::time::sleep(POLL_STEP).await;
    }
    // B never got past the eligibility check: no lock node, no lease write.
    assert_eq!(client_b.write_count(), 0);
    assert_eq!(
        coordinator.get(&format!("{}/leader_info", LEADER_PATH)).as_deref(),
        Some("a:7000")
    );

    a.stop().await;
    assert!(!a.is_leader());
    let stopped_at = Instant::now();
    assert!(
        wait_until(2 * LOOP_INTERVAL + POLL_STEP * 5, || b.is_leader()).await,
        "follower did not take over"
    );
    assert!(stopped_at.elapsed() <= 2 * LOOP_INTERVAL + POLL_STEP * 5);
    assert!(!a.is_leader());
    assert_eq!(
        coordinator.get(&format!("{}/leader_info", LEADER_PATH)).as_deref(),
        Some("b:7000")
    );

    b.stop().await;
    assert!(!coordinator.contains(&format!("{}/leader_lease", LEADER_PATH)));
    assert!(!coordinator.contains(&format!("{}/leader_info", LEADER_PATH)));
}

#[test_log::test(tokio::test)]
#[serial]
async fn test_progress_key_reacquires_unexpired_lease() {
    let coordinator = MemoryCoordinator::new();
    coordinator.put("/cluster", "");
    coordinator.put(LEADER_PATH, "");
    let expiration = SystemClock.now_us() + 60_000_000;
    coordinator.put(
        &format!("{}/leader_lease", LEADER_PATH),
        &LeaseRecord::encode(expiration, Some("p1"), "previous incarnation"),
    );

    let stranger = elector(config().with_progress_key("p2"), &coordinator.client());
    let same = elector(config().with_progress_key("p1"), &coordinator.client());
    same.set_lease_info("restarted");

    stranger.start().unwrap();
    same.start().unwrap();
    assert!(wait_until(2 * LOOP_INTERVAL + POLL_STEP * 5, || same.is_leader()).await);
    assert!(same.lease_expiration_us() < expiration);

    tokio::time::sleep(3 * LOOP_INTERVAL).await;
    assert!(!stranger.is_leader());

    let record = LeaseRecord::decode(
        &coordinator
            .get(&format!("{}/leader_lease", LEADER_PATH))
            .unwrap(),
    )
    .unwrap();
    assert_eq!(record.progress_key.as_deref(), Some("p1"));
    assert_eq!(record.payload, "restarted");

    stranger.stop().await;
    same.stop().await;
}

#[test_log::test(tokio::test)]
#[serial]
async fn test_outage_demotes_once_without_further_writes() {
    let coordinator = MemoryCoordinator::new();
    let client = coordinator.client();
    let leader = elector(config(), &client);
    let lost = count_calls(|f| leader.on_no_longer_leader(f));
    let won = count_calls(|f| leader.on_become_leader(f));

    leader.start().unwrap();
    assert!(wait_until(2 * LOOP_INTERVAL + POLL_STEP * 5, || leader.is_leader()).await);

    client.partition();
    let writes_at_outage = client.write_count();
    let lease_at_outage = leader.lease_expiration_us();

    // Demotion happens once less than half a lease remains.
    assert!(wait_until(LEASE_TIMEOUT, || !leader.is_leader()).await);
    assert!(SystemClock.now_us() < lease_at_outage);
    tokio::time::sleep(3 * LOOP_INTERVAL).await;

    assert_eq!(lost.load(Ordering::SeqCst), 1);
    assert_eq!(won.load(Ordering::SeqCst), 1);
    assert_eq!(client.write_count(), writes_at_outage);
    assert!(!leader.is_leader());

    // Once the coordinator is back and the old lease has lapsed, we win again.
    client.heal();
    assert!(wait_until(LEASE_TIMEOUT * 2, || leader.is_leader()).await);
    assert_eq!(won.load(Ordering::SeqCst), 2);
    assert_eq!(lost.load(Ordering::SeqCst), 1);

    leader.stop().await;
}

#[test_log::test(tokio::test)]
#[serial]
async fn test_stale_version_is_preempted_on_first_iteration() {
    let dir = TempDir::new().unwrap();
    let cache_path = dir.path().join("version");
    std::fs::write(&cache_path, "0").unwrap();

    let coordinator = MemoryCoordinator::new();
    let registrar = coordinator.client();
    registrar
        .create_path(&format!("{}/leader_version", LEADER_PATH))
        .await
        .unwrap();
    registrar
        .create_node(&format!("{}/leader_version/1", LEADER_PATH), "", true)
        .await
        .unwrap();

    let stale = elector(preemptive_config(&cache_path), &coordinator.client());
    let preempted = count_calls(|f| stale.on_preempted(f));
    let won = count_calls(|f| stale.on_become_leader(f));

    stale.start().unwrap();
    assert!(wait_until(LOOP_INTERVAL, || preempted.load(Ordering::SeqCst) == 1).await);
    assert!(stale.is_preempted());
    assert!(!stale.is_running());

    tokio::time::sleep(3 * LOOP_INTERVAL).await;
    assert_eq!(preempted.load(Ordering::SeqCst), 1);
    assert_eq!(won.load(Ordering::SeqCst), 0);
    assert!(!stale.is_leader());
    assert!(!coordinator.contains(&format!("{}/leader_lease", LEADER_PATH)));

    // A preempted shutdown keeps the cache file and cannot be restarted.
    stale.stop().await;
    assert!(cache_path.exists());
    assert!(stale.start().is_err());
}

#[test_log::test(tokio::test)]
#[serial]
async fn test_replacement_instance_preempts_running_leader() {
    let old_dir = TempDir::new().unwrap();
    let new_dir = TempDir::new().unwrap();
    let coordinator = MemoryCoordinator::new();

    let old = elector(preemptive_config(&old_dir.path().join("version")), &coordinator.client());
    let preempted = count_calls(|f| old.on_preempted(f));
    old.start().unwrap();
    assert!(wait_until(2 * LOOP_INTERVAL + POLL_STEP * 5, || old.is_leader()).await);

    let new = elector(preemptive_config(&new_dir.path().join("version")), &coordinator.client());
    new.start().unwrap();

    assert!(wait_until(3 * LOOP_INTERVAL, || preempted.load(Ordering::SeqCst) == 1).await);
    assert!(!old.is_leader());

    // The old lease is left to expire; the replacement then takes over.
    assert!(wait_until(LEASE_TIMEOUT * 2, || new.is_leader()).await);
    assert!(!old.is_leader());

    old.stop().await;
    new.stop().await;
    assert!(!new_dir.path().join("version").exists());
}

#[test_log::test(tokio::test)]
#[serial]
async fn test_graceful_preemptive_stop_cleans_up() {
    let dir = TempDir::new().unwrap();
    let cache_path = dir.path().join("version");
    let coordinator = MemoryCoordinator::new();
    coordinator.put("/cluster", "");
    coordinator.put(LEADER_PATH, "");
    coordinator.put(&format!("{}/leader_version", LEADER_PATH), "");
    coordinator.put(&format!("{}/leader_version/0", LEADER_PATH), "");

    let leader = elector(preemptive_config(&cache_path), &coordinator.client());
    leader.start().unwrap();
    assert!(wait_until(2 * LOOP_INTERVAL + POLL_STEP * 5, || leader.is_leader()).await);
    assert_eq!(std::fs::read_to_string(&cache_path).unwrap(), "1");

    let started = Instant::now();
    leader.stop().await;
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(!cache_path.exists());
    assert!(!leader.is_leader());
    assert!(!coordinator.contains(&format!("{}/leader_lease", LEADER_PATH)));
    // Predecessor entries are cleaned up, our own remains until the session ends.
    assert_eq!(
        coordinator.children(&format!("{}/leader_version", LEADER_PATH)),
        vec!["1".to_string()]
    );
}
