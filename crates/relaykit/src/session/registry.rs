//! Keyed registry of live sessions

use std::{
    collections::{HashMap, hash_map::Entry},
    fmt::Debug,
    hash::Hash,
    sync::Arc,
};

use log::trace;
use tokio::sync::Mutex;

/// An entry of a [`SessionRegistry`]
///
/// A session only knows its own key, the registry owns the shared handle.
pub trait Session: Send + Sync {
    type Key: Hash + Eq + Clone + Debug + Send + Sync;

    fn key(&self) -> Self::Key;
}

/// Concurrency-safe map of live sessions
///
/// Coarse-grained, single critical section, not a sharded map: every operation takes the same async lock, so they
/// are totally ordered but never run in parallel. Waiters are not served in any guaranteed order.
pub struct SessionRegistry<S: Session> {
    sessions: Mutex<HashMap<S::Key, Arc<S>>>,
}

impl<S: Session> Default for SessionRegistry<S> {
    fn default() -> Self {
        SessionRegistry {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl<S: Session> SessionRegistry<S> {
    pub fn new() -> SessionRegistry<S> {
        SessionRegistry::default()
    }

    /// Inserts `session` under its key, `false` if the key is already taken
    pub async fn emplace(&self, session: Arc<S>) -> bool {
        let key = session.key();
        match self.sessions.lock().await.entry(key) {
            Entry::Occupied(occ) => {
                trace!("session {:?} already registered", occ.key());
                false
            }
            Entry::Vacant(vac) => {
                trace!("session {:?} registered", vac.key());
                vac.insert(session);
                true
            }
        }
    }

    /// Removes the session under `key`, `false` if there was none
    pub async fn erase(&self, key: &S::Key) -> bool {
        let erased = self.sessions.lock().await.remove(key).is_some();
        if erased {
            trace!("session {:?} unregistered", key);
        }
        erased
    }

    pub async fn find(&self, key: &S::Key) -> Option<Arc<S>> {
        self.sessions.lock().await.get(key).cloned()
    }

    /// Calls `visitor` once for every session registered when the lock is taken
    ///
    /// The lock is held for the whole walk, `visitor` must not call back into the registry.
    pub async fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&Arc<S>),
    {
        let sessions = self.sessions.lock().await;
        for session in sessions.values() {
            visitor(session);
        }
    }

    /// Handles of every live session, for work that has to await per session
    pub async fn snapshot(&self) -> Vec<Arc<S>> {
        self.sessions.lock().await.values().cloned().collect()
    }

    /// Removes and returns every session
    pub async fn drain(&self) -> Vec<Arc<S>> {
        self.sessions.lock().await.drain().map(|(_, s)| s).collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Registers `session`, runs `fut` and unregisters the session again, however `fut` finished
    ///
    /// Returns `None` without polling `fut` if the key is already taken.
    pub async fn run_scoped<F>(&self, session: Arc<S>, fut: F) -> Option<F::Output>
    where
        F: Future,
    {
        let key = session.key();
        if !self.emplace(session).await {
            return None;
        }
        let output = fut.await;
        self.erase(&key).await;
        Some(output)
    }
}
