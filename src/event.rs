use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::topic::TopicName;

/// Reserved topic prefix for server-emitted control events.
pub const SYS_PREFIX: &str = "$SYS";
/// The single reserved topic used for session lifecycle control events.
pub const SYS_SESSION_TOPIC: &str = "$SYS/session";

pub const SYS_SESSION_CREATED: &str = "Created";
pub const SYS_SESSION_SUBSCRIBED: &str = "Subscribed";
pub const SYS_SESSION_UNSUBSCRIBED: &str = "Unsubscribed";

/// An event tagged by user and topic, as accepted by the router.
///
/// `data` and `metadata` are opaque, schemaless payloads preserved verbatim
/// through (de)serialization.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub user_id: String,
    pub topic: TopicName,
    pub name: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub metadata: Value,
}

impl Event {
    pub fn is_system(&self) -> bool {
        self.topic.is_server_specific()
    }
}

/// Wire shape for publish/broker payloads: `{"topic":{"value":"…"},…}`
///, distinct from the flattened shape sent down the SSE wire.
#[derive(Serialize, Deserialize)]
pub struct WireEvent {
    pub user_id: String,
    pub topic: WireTopic,
    pub name: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Serialize, Deserialize)]
pub struct WireTopic {
    pub value: String,
}

impl TryFrom<WireEvent> for Event {
    type Error = crate::topic::TopicError;

    fn try_from(wire: WireEvent) -> Result<Self, Self::Error> {
        Ok(Event {
            user_id: wire.user_id,
            topic: TopicName::new(wire.topic.value)?,
            name: wire.name,
            data: wire.data,
            metadata: wire.metadata,
        })
    }
}

/// The flattened `{"topic":"…","name":"…","data":…,"metadata":…}` shape
/// delivered to browsers inside an SSE `data:` frame.
#[derive(Serialize)]
pub struct ClientEvent<'a> {
    pub topic: &'a str,
    pub name: &'a str,
    pub data: &'a Value,
    pub metadata: &'a Value,
}

impl Event {
    /// The JSON body of this event's `data:` SSE field. The
    /// framing itself (`data: …\n\n`) is warp's job at the ingress layer,
    /// not this type's — this only owns the payload shape.
    pub fn to_sse_payload(&self) -> String {
        let payload = ClientEvent {
            topic: self.topic.as_str(),
            name: &self.name,
            data: &self.data,
            metadata: &self.metadata,
        };
        serde_json::to_string(&payload).unwrap_or_else(|_| "null".to_string())
    }

    pub fn system(name: &str, data: Value) -> Self {
        Event {
            user_id: String::new(),
            topic: TopicName::new(SYS_SESSION_TOPIC).expect("constant topic is valid"),
            name: name.to_string(),
            data,
            metadata: Value::Null,
        }
    }

    /// A `$SYS/session` `Subscribed`/`Unsubscribed` control event carrying
    /// the session id and filter a broker consumer applies on the other
    /// side, so a subscribe/unsubscribe made on one node reaches every
    /// other node's subscription index.
    pub fn session_control(user_id: &str, name: &str, session_id: &str, filter: &str) -> Self {
        Event {
            user_id: user_id.to_string(),
            topic: TopicName::new(SYS_SESSION_TOPIC).expect("constant topic is valid"),
            name: name.to_string(),
            data: serde_json::json!({ "session_id": session_id, "filter": filter }),
            metadata: Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_event_round_trips_topic_shape() {
        let json = serde_json::json!({
            "user_id": "u1",
            "topic": {"value": "todos/42"},
            "name": "Created",
            "data": {"x": 1},
            "metadata": null,
        });
        let wire: WireEvent = serde_json::from_value(json).unwrap();
        let event = Event::try_from(wire).unwrap();
        assert_eq!(event.topic.as_str(), "todos/42");
        assert_eq!(event.user_id, "u1");
    }

    #[test]
    fn sse_payload_matches_client_shape() {
        let event = Event {
            user_id: "u1".to_string(),
            topic: TopicName::new("todos/42").unwrap(),
            name: "Created".to_string(),
            data: serde_json::json!({"x": 1}),
            metadata: Value::Null,
        };
        let payload = event.to_sse_payload();
        assert_eq!(
            payload,
            "{\"topic\":\"todos/42\",\"name\":\"Created\",\"data\":{\"x\":1},\"metadata\":null}"
        );
    }

    #[test]
    fn system_event_flags_as_system() {
        let event = Event::system(SYS_SESSION_CREATED, Value::String("abc".into()));
        assert!(event.is_system());
    }
}
