use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use crate::event::{Event, SYS_SESSION_SUBSCRIBED, SYS_SESSION_TOPIC, SYS_SESSION_UNSUBSCRIBED};
use crate::registry::SessionRegistry;
use crate::subscription::SubscriptionIndex;
use crate::topic::TopicFilter;

/// `data` payload of a `$SYS/session` `Subscribed`/`Unsubscribed` control
/// event, as published by a node forwarding a subscription
/// change through a broker.
#[derive(Deserialize)]
struct SysSessionPayload {
    session_id: String,
    filter: String,
}

/// Resolves an event's target user, evaluates filters, and hands matches
/// to sessions.
///
/// `$SYS/session` `Subscribed`/`Unsubscribed` events are intercepted before
/// filter evaluation and translated into subscription-index mutations
/// rather than delivered — this is how broker fan-in distributes
/// subscribe/unsubscribe the same way it distributes data events. Every
/// other event, `$SYS`-prefixed or not, goes through the ordinary
/// match-and-deliver path; the matcher rules already keep a `#`/`+` first
/// segment from matching a `$`-prefixed name, so no further special-casing
/// is needed to keep `$SYS` traffic out of ordinary subscriptions.
pub struct EventRouter {
    registry: Arc<SessionRegistry>,
    subscriptions: Arc<SubscriptionIndex>,
}

impl EventRouter {
    pub fn new(registry: Arc<SessionRegistry>, subscriptions: Arc<SubscriptionIndex>) -> Self {
        EventRouter {
            registry,
            subscriptions,
        }
    }

    pub fn dispatch(&self, event: Event) {
        if event.topic.as_str() == SYS_SESSION_TOPIC
            && (event.name == SYS_SESSION_SUBSCRIBED || event.name == SYS_SESSION_UNSUBSCRIBED)
        {
            self.apply_session_control(&event);
            return;
        }

        let session_ids = self
            .subscriptions
            .matching_session_ids(&event.user_id, &event.topic);
        if session_ids.is_empty() {
            return;
        }

        let frame = event.to_sse_payload();
        for session_id in session_ids {
            if let Some(session) = self.registry.get(&session_id) {
                session.send_frame(frame.clone());
            }
        }
    }

    fn apply_session_control(&self, event: &Event) {
        let payload: SysSessionPayload = match serde_json::from_value(event.data.clone()) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%error, name = %event.name, "malformed $SYS/session control payload, dropping");
                return;
            }
        };

        let filter = match TopicFilter::new(payload.filter) {
            Ok(filter) => filter,
            Err(error) => {
                warn!(%error, "malformed filter in $SYS/session control payload, dropping");
                return;
            }
        };

        if event.name == SYS_SESSION_SUBSCRIBED {
            self.subscriptions
                .subscribe(&event.user_id, &payload.session_id, filter);
        } else {
            self.subscriptions
                .unsubscribe(&event.user_id, &payload.session_id, &filter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::TopicName;
    use serde_json::json;

    fn router() -> (EventRouter, Arc<SessionRegistry>, Arc<SubscriptionIndex>) {
        let registry = Arc::new(SessionRegistry::new());
        let subscriptions = Arc::new(SubscriptionIndex::new(registry.clone()));
        let router = EventRouter::new(registry.clone(), subscriptions.clone());
        (router, registry, subscriptions)
    }

    #[test]
    fn dispatch_drops_events_for_unknown_user() {
        let (router, _registry, _subs) = router();
        router.dispatch(Event {
            user_id: "ghost".to_string(),
            topic: TopicName::new("todos/1").unwrap(),
            name: "Created".to_string(),
            data: json!(null),
            metadata: json!(null),
        });
        // No panic, no delivery -- nothing to assert beyond "it returns".
    }

    #[test]
    fn dispatch_delivers_to_matching_session_only_once() {
        let (router, registry, subs) = router();
        let (session, mut rx) = registry.open();
        subs.subscribe("u1", session.id(), TopicFilter::new("sport/+/player1").unwrap());
        subs.subscribe("u1", session.id(), TopicFilter::new("sport/tennis/#").unwrap());

        router.dispatch(Event {
            user_id: "u1".to_string(),
            topic: TopicName::new("sport/tennis/player1").unwrap(),
            name: "Scored".to_string(),
            data: json!({"points": 1}),
            metadata: json!(null),
        });

        rx.try_recv().expect("one frame delivered");
        assert!(rx.try_recv().is_err(), "must not deliver twice");
    }

    #[test]
    fn sys_subscribed_control_event_mutates_index_instead_of_delivering() {
        let (router, registry, subs) = router();
        let (session, mut rx) = registry.open();

        router.dispatch(Event {
            user_id: "u1".to_string(),
            topic: TopicName::new("$SYS/session").unwrap(),
            name: SYS_SESSION_SUBSCRIBED.to_string(),
            data: json!({"session_id": session.id(), "filter": "a/b"}),
            metadata: json!(null),
        });

        assert!(rx.try_recv().is_err(), "control event is not delivered");

        router.dispatch(Event {
            user_id: "u1".to_string(),
            topic: TopicName::new("a/b").unwrap(),
            name: "Created".to_string(),
            data: json!(1),
            metadata: json!(null),
        });
        rx.try_recv().expect("subscription installed by control event");

        let _ = subs;
    }

    #[test]
    fn dollar_sys_events_still_flow_through_normal_matching() {
        let (router, registry, subs) = router();
        let (session, mut rx) = registry.open();
        subs.subscribe("u1", session.id(), TopicFilter::new("$SYS/#").unwrap());

        router.dispatch(Event {
            user_id: "u1".to_string(),
            topic: TopicName::new("$SYS/monitor/Clients").unwrap(),
            name: "Info".to_string(),
            data: json!(null),
            metadata: json!(null),
        });

        rx.try_recv().expect("matched via $SYS/# filter");
    }
}
