//! Registry semantics: id uniqueness, idempotent removal, expiry sweeps and
//! teardown running outside the registry lock.
use async_trait::async_trait;
use gpuhost_remote::{
    CommandOutput, ControlConnection, Credentials, HostTarget, RemoteError, ShellChannel,
};
use gpuhost_session::{Session, SessionError, SessionRegistry, SessionTeardown};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

struct NullConnection {
    target: HostTarget,
}

#[async_trait]
impl ControlConnection for NullConnection {
    fn target(&self) -> &HostTarget {
        &self.target
    }

    async fn execute(
        &self,
        _command: &str,
        _timeout: Duration,
        _input: Option<&str>,
    ) -> Result<CommandOutput, RemoteError> {
        Ok(CommandOutput::ok(""))
    }

    async fn open_shell(&self, _command: Option<&str>) -> Result<ShellChannel, RemoteError> {
        Err(RemoteError::ShellClosed)
    }

    async fn close(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}

fn generated(owner: &str) -> Session {
    Session::new(
        owner,
        Credentials::Agent,
        Box::new(NullConnection {
            target: HostTarget::new("gpu", 22, owner),
        }),
    )
}

fn session(id: &str, owner: &str) -> Session {
    Session::with_id(
        id,
        owner,
        Credentials::Agent,
        Box::new(NullConnection {
            target: HostTarget::new("gpu", 22, owner),
        }),
    )
}

/// Records torn-down ids; optionally blocks until released
#[derive(Default)]
struct RecordingTeardown {
    seen: Mutex<Vec<String>>,
    calls: AtomicUsize,
    gate: Option<Arc<Notify>>,
    delay: Option<Duration>,
}

#[async_trait]
impl SessionTeardown for RecordingTeardown {
    async fn teardown(&self, session: Arc<Session>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.seen.lock().unwrap().push(session.id().to_string());
    }
}

#[tokio::test]
async fn test_remove_is_idempotent() {
    let teardown = Arc::new(RecordingTeardown::default());
    let registry = SessionRegistry::new(teardown.clone());
    registry.create(session("s1", "alice")).unwrap();

    assert!(registry.get("s1").is_some());
    assert!(registry.remove_and_wait("s1").await);
    assert!(registry.get("s1").is_none());
    assert!(!registry.remove("s1"));
    assert!(!registry.remove_and_wait("s1").await);

    assert_eq!(teardown.calls.load(Ordering::SeqCst), 1);
    assert_eq!(*teardown.seen.lock().unwrap(), vec!["s1".to_string()]);
}

#[tokio::test]
async fn test_ids_are_never_reused() {
    let registry = SessionRegistry::new(Arc::new(RecordingTeardown::default()));
    registry.create(session("s1", "alice")).unwrap();
    assert_eq!(
        registry.create(session("s1", "bob")).unwrap_err(),
        SessionError::Duplicate("s1".to_string())
    );

    registry.remove_and_wait("s1").await;
    assert_eq!(
        registry.create(session("s1", "alice")).unwrap_err(),
        SessionError::Duplicate("s1".to_string())
    );
}

#[tokio::test]
async fn test_generated_ids_are_unique() {
    let registry = SessionRegistry::new(Arc::new(RecordingTeardown::default()));
    for _ in 0..50 {
        let s = Session::new(
            "alice",
            Credentials::Agent,
            Box::new(NullConnection {
                target: HostTarget::new("gpu", 22, "alice"),
            }),
        );
        registry.create(s).unwrap();
    }
    assert_eq!(registry.count(), 50);
}

#[tokio::test]
async fn test_only_caller_ids_stay_reserved() {
    let registry = SessionRegistry::new(Arc::new(RecordingTeardown::default()));
    let mut ids = Vec::new();
    for _ in 0..20 {
        ids.push(registry.create(generated("alice")).unwrap().id().to_string());
    }
    registry.create(session("fixed", "bob")).unwrap();

    for id in &ids {
        assert!(registry.remove_and_wait(id).await);
    }
    registry.remove_and_wait("fixed").await;

    assert_eq!(registry.count(), 0);
    assert_eq!(registry.retired_count(), 1);
    assert!(registry.create(session("fixed", "bob")).is_err());
}

#[tokio::test]
async fn test_owner_limit() {
    let registry =
        SessionRegistry::new(Arc::new(RecordingTeardown::default())).with_max_per_owner(2);
    registry.create(session("a1", "alice")).unwrap();
    registry.create(session("a2", "alice")).unwrap();
    registry.create(session("b1", "bob")).unwrap();

    assert_eq!(
        registry.create(session("a3", "alice")).unwrap_err(),
        SessionError::LimitReached {
            owner: "alice".to_string(),
            limit: 2
        }
    );
    assert_eq!(registry.count_for_owner("alice"), 2);

    registry.remove("a1");
    registry.create(session("a3", "alice")).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_sweep_expired_removes_only_idle_sessions() {
    let teardown = Arc::new(RecordingTeardown::default());
    let registry = SessionRegistry::new(teardown.clone());
    for id in ["a", "b", "c", "d"] {
        registry.create(session(id, "alice")).unwrap();
    }

    tokio::time::advance(Duration::from_secs(30)).await;
    registry.get("b");
    registry.get("d");
    tokio::time::advance(Duration::from_secs(40)).await;

    // a, c idle 70s; b, d idle 40s
    let mut expired = registry.sweep_expired(Duration::from_secs(60));
    expired.sort();
    assert_eq!(expired, vec!["a".to_string(), "c".to_string()]);
    assert!(registry.get("b").is_some());
    assert!(registry.get("d").is_some());
    assert_eq!(registry.count(), 2);

    // Running it again with nothing stale changes nothing
    assert!(registry.sweep_expired(Duration::from_secs(60)).is_empty());

    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(teardown.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_slow_teardown_does_not_block_registry() {
    let gate = Arc::new(Notify::new());
    let teardown = Arc::new(RecordingTeardown {
        gate: Some(gate.clone()),
        ..Default::default()
    });
    let registry = Arc::new(SessionRegistry::new(teardown.clone()));
    registry.create(session("stuck", "alice")).unwrap();
    registry.create(session("other", "bob")).unwrap();

    assert!(registry.remove("stuck"));

    // Teardown of "stuck" is parked on the gate; the registry keeps serving
    registry.create(session("fresh", "carol")).unwrap();
    assert!(registry.get("other").is_some());
    assert_eq!(registry.count(), 2);

    gate.notify_one();
    tokio::time::timeout(Duration::from_secs(5), async {
        while teardown.seen.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(*teardown.seen.lock().unwrap(), vec!["stuck".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_hung_teardown_is_abandoned() {
    let teardown = Arc::new(RecordingTeardown {
        delay: Some(Duration::from_secs(3600)),
        ..Default::default()
    });
    let registry =
        SessionRegistry::new(teardown.clone()).with_cleanup_timeout(Duration::from_secs(2));
    registry.create(session("hung", "alice")).unwrap();

    let started = tokio::time::Instant::now();
    assert!(registry.remove_and_wait("hung").await);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(teardown.seen.lock().unwrap().is_empty());
    assert_eq!(registry.count(), 0);
}

#[tokio::test]
async fn test_list_is_a_snapshot() {
    let registry = SessionRegistry::new(Arc::new(RecordingTeardown::default()));
    registry.create(session("s1", "alice")).unwrap();
    registry.create(session("s2", "bob")).unwrap();

    let views = registry.list();
    assert_eq!(views.len(), 2);
    registry.remove("s1");
    assert_eq!(views.len(), 2);
    assert_eq!(registry.list().len(), 1);

    let view = registry.view("s2").unwrap();
    assert_eq!(view.owner, "bob");
    assert_eq!(view.host, "bob@gpu:22");
    assert!(view.forwarding.is_none());
    assert!(!view.shell_open);
    let json = serde_json::to_value(&view).unwrap();
    assert_eq!(json["id"], "s2");
}
