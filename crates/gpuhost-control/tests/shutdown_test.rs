//! Shutdown must finish in bounded time however slow or stuck individual cleanups are
mod common;

use async_trait::async_trait;
use common::*;
use gpuhost_control::ShutdownCoordinator;
use gpuhost_remote::{Credentials, HostTarget, RemoteExecutor};
use gpuhost_session::{Session, SessionRegistry, SessionTeardown};
use gpuhost_tunnel::{PortRange, TunnelManager};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Cleanup that takes a fixed time per session and tracks how many run at once
#[derive(Default)]
struct TimedTeardown {
    delays: Mutex<HashMap<String, Duration>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    finished: AtomicUsize,
}

#[async_trait]
impl SessionTeardown for TimedTeardown {
    async fn teardown(&self, session: Arc<Session>) {
        let delay = self
            .delays
            .lock()
            .unwrap()
            .get(session.id())
            .copied()
            .unwrap_or_default();
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

struct Fixture {
    registry: Arc<SessionRegistry>,
    teardown: Arc<TimedTeardown>,
    reclaimer: Arc<FakeReclaimer>,
    coordinator: ShutdownCoordinator,
}

async fn fixture(delays: &[u64], pool_size: usize, task_timeout: Duration, deadline: Duration) -> Fixture {
    let teardown = Arc::new(TimedTeardown::default());
    let registry = Arc::new(SessionRegistry::new(teardown.clone()));
    let executor = MockExecutor::new(vec![]);
    let target = HostTarget::new("gpu-host", 22, "alice");

    for (i, millis) in delays.iter().enumerate() {
        let id = format!("session-{}", i);
        teardown
            .delays
            .lock()
            .unwrap()
            .insert(id.clone(), Duration::from_millis(*millis));
        let control = executor.connect(&target, &Credentials::Agent).await.unwrap();
        registry
            .create(Session::with_id(id, "alice", Credentials::Agent, control))
            .unwrap();
    }

    let reclaimer = Arc::new(FakeReclaimer::default());
    let tunnels = Arc::new(TunnelManager::new(
        reclaimer.clone(),
        Arc::new(FakeLauncher::new()),
    ));
    let coordinator = ShutdownCoordinator::new(
        registry.clone(),
        teardown.clone(),
        tunnels,
        PortRange::new(9000, 9009).unwrap(),
    )
    .with_pool_size(pool_size)
    .with_task_timeout(task_timeout)
    .with_deadline(deadline);

    Fixture {
        registry,
        teardown,
        reclaimer,
        coordinator,
    }
}

/// Deterministic cleanup durations between 500ms and 2000ms
fn spread_delays(count: usize) -> Vec<u64> {
    let mut state: u64 = 0x2545_f491;
    (0..count)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            500 + (state >> 33) % 1501
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_ten_sessions_drain_within_pool_bound() {
    let delays = spread_delays(10);
    assert!(delays.iter().all(|d| (500..=2000).contains(d)));
    let f = fixture(&delays, 5, Duration::from_secs(5), Duration::from_secs(30)).await;

    let report = f.coordinator.shutdown().await;

    assert_eq!(report.cleaned.len(), 10);
    assert!(report.abandoned.is_empty());
    assert!(!report.deadline_exceeded);
    assert_eq!(f.registry.count(), 0);
    assert_eq!(f.teardown.finished.load(Ordering::SeqCst), 10);
    // ceil(10 / 5) rounds of at most the task timeout each
    assert!(report.elapsed_millis <= 2 * 5_000);
    // and in practice no longer than two of the slowest cleanups
    assert!(report.elapsed_millis <= 2 * 2_000);
    assert_eq!(f.teardown.peak.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn test_hung_cleanups_are_abandoned_after_task_timeout() {
    let f = fixture(
        &[3_600_000, 200, 3_600_000, 300],
        5,
        Duration::from_secs(2),
        Duration::from_secs(30),
    )
    .await;

    let report = f.coordinator.shutdown().await;

    let mut abandoned = report.abandoned.clone();
    abandoned.sort();
    assert_eq!(abandoned, vec!["session-0", "session-2"]);
    assert_eq!(report.cleaned.len(), 2);
    assert!(!report.deadline_exceeded);
    assert!(report.elapsed_millis <= 2_100);
    assert_eq!(f.registry.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_caps_total_time() {
    let f = fixture(
        &[10_000; 5],
        1,
        Duration::from_secs(20),
        Duration::from_secs(15),
    )
    .await;

    let report = f.coordinator.shutdown().await;

    assert!(report.deadline_exceeded);
    assert_eq!(report.cleaned.len(), 1);
    assert!(report.elapsed_millis <= 15_100);
    assert!(report.swept_ports.is_empty());
    // Sessions are taken out up front, so nothing is left registered
    assert_eq!(f.registry.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_range_is_swept_after_drain() {
    let f = fixture(&[100, 100], 5, Duration::from_secs(5), Duration::from_secs(30)).await;
    f.reclaimer.occupy(9003, 4242);
    f.reclaimer.occupy(9100, 4343);

    let report = f.coordinator.shutdown().await;

    assert_eq!(report.swept_ports, vec![9003]);
    assert!(f.reclaimer.holders.lock().unwrap().contains_key(&9100));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_with_no_sessions_only_sweeps() {
    let f = fixture(&[], 5, Duration::from_secs(5), Duration::from_secs(30)).await;

    let report = f.coordinator.shutdown().await;

    assert!(report.cleaned.is_empty());
    assert!(report.abandoned.is_empty());
    assert_eq!(report.elapsed_millis, 0);
    assert_eq!(f.reclaimer.released.lock().unwrap().len(), 10);
}
