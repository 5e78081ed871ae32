use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use tokio::sync::mpsc;
use tracing::info;

use crate::session::{Session, SessionId};

type CloseHook = dyn Fn(&SessionId) + Send + Sync;

/// Process-wide mapping of session id to [`Session`].
///
/// The registry is the only authority on session existence; every other
/// component (the subscription index, the router) holds session ids and
/// consults the registry rather than owning `Session`s itself, avoiding a
/// cyclic ownership graph.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    close_hook: OnceLock<Arc<CloseHook>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            sessions: RwLock::new(HashMap::new()),
            close_hook: OnceLock::new(),
        }
    }

    /// Wires the hook invoked exactly once when a session closes. Intended
    /// to be called once during startup wiring, before any session opens.
    pub fn on_close(&self, hook: impl Fn(&SessionId) + Send + Sync + 'static) {
        let _ = self.close_hook.set(Arc::new(hook));
    }

    /// Allocates a fresh session id and installs the session. Returns the
    /// session handle and the receiving half of its outbox, from which the
    /// caller builds the client-facing SSE stream.
    pub fn open(&self) -> (Arc<Session>, mpsc::Receiver<String>) {
        let id = nanoid::nanoid!();
        let (session, rx) = Session::new(id.clone());
        let session = Arc::new(session);

        self.sessions
            .write()
            .expect("session registry lock poisoned")
            .insert(id.clone(), session.clone());

        info!(session_id = %id, "session opened");
        (session, rx)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .expect("session registry lock poisoned")
            .get(id)
            .cloned()
    }

    /// Removes the session and runs the close hook exactly once, after the
    /// registry lock is released (the hook typically needs to take the
    /// subscription index's own lock, so holding both at once would be an
    /// avoidable lock-ordering hazard).
    pub fn close(&self, id: &str) {
        let removed = self
            .sessions
            .write()
            .expect("session registry lock poisoned")
            .remove(id);

        if removed.is_some() {
            info!(session_id = %id, "session closed");
            if let Some(hook) = self.close_hook.get() {
                hook(&id.to_string());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .expect("session registry lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn open_installs_and_get_finds_it() {
        let registry = SessionRegistry::new();
        let (session, _rx) = registry.open();
        assert!(registry.get(session.id()).is_some());
        assert_eq!(registry.len(), 1);
        assert!(session.id().len() >= 21);
    }

    #[test]
    fn close_removes_and_fires_hook_once() {
        let registry = SessionRegistry::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        registry.on_close(move |_id| {
            fired_clone.store(true, Ordering::SeqCst);
        });

        let (session, _rx) = registry.open();
        let id = session.id().to_string();
        registry.close(&id);

        assert!(registry.get(&id).is_none());
        assert!(fired.load(Ordering::SeqCst));

        // Closing an already-absent id must not re-fire the hook.
        fired.store(false, Ordering::SeqCst);
        registry.close(&id);
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn get_on_unknown_id_is_none() {
        let registry = SessionRegistry::new();
        assert!(registry.get("does-not-exist").is_none());
    }
}
