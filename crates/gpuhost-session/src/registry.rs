//! The authoritative table of live sessions
//!
//! One mutex guards the map and is held only while the map itself changes.
//! Removal takes the session out under the lock and runs its teardown on a
//! separate task with a timeout, so a slow remote never blocks `get`/`create`
//! for anybody else.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::session::{Session, SessionView};

/// Releases everything a removed session owns. Must not fail.
#[async_trait]
pub trait SessionTeardown: Send + Sync {
    async fn teardown(&self, session: Arc<Session>);
}

struct Entry {
    session: Arc<Session>,
    last_activity: Instant,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Entry>,
    /// Removed caller-chosen ids. Generated ids are fresh v4 UUIDs and are not
    /// kept, so this only grows with ids handed in through `Session::with_id`.
    retired: HashSet<String>,
}

impl Inner {
    fn retire(&mut self, id: &str) -> Option<Arc<Session>> {
        let entry = self.sessions.remove(id)?;
        if entry.session.has_caller_id() {
            self.retired.insert(id.to_string());
        }
        Some(entry.session)
    }
}

pub struct SessionRegistry {
    inner: Mutex<Inner>,
    teardown: Arc<dyn SessionTeardown>,
    cleanup_timeout: Duration,
    max_per_owner: Option<usize>,
}

impl SessionRegistry {
    pub fn new(teardown: Arc<dyn SessionTeardown>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            teardown,
            cleanup_timeout: Duration::from_secs(10),
            max_per_owner: None,
        }
    }

    /// Upper bound on one removed session's teardown before it is abandoned
    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    pub fn with_max_per_owner(mut self, limit: usize) -> Self {
        self.max_per_owner = Some(limit);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `session` under its id
    pub fn create(&self, session: Session) -> Result<Arc<Session>, SessionError> {
        let id = session.id().to_string();
        let mut inner = self.lock();

        if inner.sessions.contains_key(&id) || inner.retired.contains(&id) {
            return Err(SessionError::Duplicate(id));
        }
        if let Some(limit) = self.max_per_owner {
            let held = inner
                .sessions
                .values()
                .filter(|e| e.session.owner() == session.owner())
                .count();
            if held >= limit {
                return Err(SessionError::LimitReached {
                    owner: session.owner().to_string(),
                    limit,
                });
            }
        }

        let session = Arc::new(session);
        inner.sessions.insert(
            id.clone(),
            Entry {
                session: session.clone(),
                last_activity: Instant::now(),
            },
        );
        info!(session_id = %id, owner = %session.owner(), total = inner.sessions.len(), "Session created");
        Ok(session)
    }

    /// Look up a session and mark it active
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let mut inner = self.lock();
        let entry = inner.sessions.get_mut(id)?;
        entry.last_activity = Instant::now();
        Some(entry.session.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().sessions.contains_key(id)
    }

    /// Remove and tear down in the background. Returns false when nothing was removed.
    pub fn remove(&self, id: &str) -> bool {
        match self.take(id) {
            Some(session) => {
                self.dispatch(session);
                true
            }
            None => false,
        }
    }

    /// Remove and wait for the teardown (bounded by the cleanup timeout)
    pub async fn remove_and_wait(&self, id: &str) -> bool {
        match self.take(id) {
            Some(session) => {
                if let Some(handle) = self.dispatch(session) {
                    if let Err(e) = handle.await {
                        warn!(session_id = %id, "Teardown task failed: {}", e);
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Remove without tearing down; the caller owns cleanup
    pub fn take(&self, id: &str) -> Option<Arc<Session>> {
        let mut inner = self.lock();
        let session = inner.retire(id)?;
        debug!(session_id = %id, remaining = inner.sessions.len(), "Session removed from registry");
        Some(session)
    }

    pub fn list(&self) -> Vec<SessionView> {
        let sessions: Vec<(Arc<Session>, Instant)> = self
            .lock()
            .sessions
            .values()
            .map(|e| (e.session.clone(), e.last_activity))
            .collect();
        let mut views: Vec<SessionView> = sessions
            .iter()
            .map(|(session, last)| session.view(last.elapsed()))
            .collect();
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        views
    }

    pub fn view(&self, id: &str) -> Option<SessionView> {
        let (session, last) = {
            let inner = self.lock();
            let entry = inner.sessions.get(id)?;
            (entry.session.clone(), entry.last_activity)
        };
        Some(session.view(last.elapsed()))
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().sessions.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Caller-chosen ids that stay reserved after removal
    pub fn retired_count(&self) -> usize {
        self.lock().retired.len()
    }

    pub fn count_for_owner(&self, owner: &str) -> usize {
        self.lock()
            .sessions
            .values()
            .filter(|e| e.session.owner() == owner)
            .count()
    }

    /// Remove every session idle for longer than `max_age`; returns their ids
    pub fn sweep_expired(&self, max_age: Duration) -> Vec<String> {
        let expired: Vec<Arc<Session>> = {
            let mut inner = self.lock();
            let ids: Vec<String> = inner
                .sessions
                .iter()
                .filter(|(_, e)| e.last_activity.elapsed() > max_age)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| inner.retire(id))
                .collect()
        };

        let ids: Vec<String> = expired.iter().map(|s| s.id().to_string()).collect();
        if !ids.is_empty() {
            info!(count = ids.len(), "Expired idle sessions");
        }
        for session in expired {
            self.dispatch(session);
        }
        ids
    }

    fn dispatch(&self, session: Arc<Session>) -> Option<JoinHandle<()>> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(session_id = %session.id(), "No runtime for teardown, dropping session");
                return None;
            }
        };

        let teardown = self.teardown.clone();
        let timeout = self.cleanup_timeout;
        Some(runtime.spawn(async move {
            let id = session.id().to_string();
            if tokio::time::timeout(timeout, teardown.teardown(session))
                .await
                .is_err()
            {
                warn!(session_id = %id, timeout = ?timeout, "Session teardown abandoned");
            }
        }))
    }
}
