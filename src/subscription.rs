use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::registry::SessionRegistry;
use crate::session::SessionId;
use crate::topic::{TopicFilter, TopicName};

type FilterSet = HashMap<String, TopicFilter>;

#[derive(Default)]
struct Inner {
    /// user_id -> session_id -> filter_value -> TopicFilter
    by_user: HashMap<String, HashMap<SessionId, FilterSet>>,
    /// session_id -> user_id, for rebind and close-hook compaction.
    user_of_session: HashMap<SessionId, String>,
}

impl Inner {
    /// Drops `session_id` from whichever user it's currently bound to,
    /// compacting empty maps, and clears the inverse entry. Used both by
    /// rebind (subscribe to a different user) and by session close.
    fn detach_session(&mut self, session_id: &str) {
        if let Some(user_id) = self.user_of_session.remove(session_id) {
            if let Some(sessions) = self.by_user.get_mut(&user_id) {
                sessions.remove(session_id);
                if sessions.is_empty() {
                    self.by_user.remove(&user_id);
                }
            }
        }
    }
}

/// The three-level user -> session -> filter-set index used for dispatch
///. Holds weak references (ids) to sessions, never
/// ownership; the registry is consulted to resolve them.
pub struct SubscriptionIndex {
    registry: Arc<SessionRegistry>,
    inner: RwLock<Inner>,
}

impl SubscriptionIndex {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        SubscriptionIndex {
            registry,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Adds `filter` under `(user_id, session_id)`. A no-op if `session_id`
    /// isn't a live session.
    pub fn subscribe(&self, user_id: &str, session_id: &str, filter: TopicFilter) {
        if self.registry.get(session_id).is_none() {
            return;
        }

        let mut inner = self.inner.write().expect("subscription index lock poisoned");

        let already_bound = inner.user_of_session.get(session_id).map(String::as_str) == Some(user_id);
        if !already_bound {
            inner.detach_session(session_id);
            inner
                .user_of_session
                .insert(session_id.to_string(), user_id.to_string());
        }

        inner
            .by_user
            .entry(user_id.to_string())
            .or_default()
            .entry(session_id.to_string())
            .or_default()
            .insert(filter.as_str().to_string(), filter);
    }

    /// Removes `filter` from `(user_id, session_id)`. A no-op if
    /// `session_id` isn't a live session, or if `(user_id, session_id)` has
    /// no entry (including a mismatched user — it silently cannot affect
    /// another user's subs).
    pub fn unsubscribe(&self, user_id: &str, session_id: &str, filter: &TopicFilter) {
        if self.registry.get(session_id).is_none() {
            return;
        }

        let mut inner = self.inner.write().expect("subscription index lock poisoned");

        let Some(sessions) = inner.by_user.get_mut(user_id) else {
            return;
        };
        let Some(filters) = sessions.get_mut(session_id) else {
            return;
        };

        filters.remove(filter.as_str());
        if filters.is_empty() {
            sessions.remove(session_id);
            inner.user_of_session.remove(session_id);
            if sessions.is_empty() {
                inner.by_user.remove(user_id);
            }
        }
    }

    /// Called from the registry's close hook: removes every reference to
    /// `session_id` across the index, under whichever user it was bound
    /// to.
    pub fn handle_session_closed(&self, session_id: &str) {
        let mut inner = self.inner.write().expect("subscription index lock poisoned");
        inner.detach_session(session_id);
    }

    /// The session ids, under `user_id`, with at least one filter matching
    /// `topic` — the read path used by the router. Returns a
    /// snapshot so the caller can dispatch without holding this lock.
    pub fn matching_session_ids(&self, user_id: &str, topic: &TopicName) -> Vec<SessionId> {
        let inner = self.inner.read().expect("subscription index lock poisoned");
        let Some(sessions) = inner.by_user.get(user_id) else {
            return Vec::new();
        };
        sessions
            .iter()
            .filter(|(_, filters)| filters.values().any(|f| f.matches(topic)))
            .map(|(session_id, _)| session_id.clone())
            .collect()
    }

    #[cfg(test)]
    fn filter_count(&self, user_id: &str, session_id: &str) -> usize {
        self.inner
            .read()
            .unwrap()
            .by_user
            .get(user_id)
            .and_then(|s| s.get(session_id))
            .map(HashMap::len)
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn has_user(&self, user_id: &str) -> bool {
        self.inner.read().unwrap().by_user.contains_key(user_id)
    }
}
