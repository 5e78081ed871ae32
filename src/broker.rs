use std::sync::Arc;

use async_nats::jetstream;
use futures::StreamExt;
use tracing::{info, warn};

use crate::error::PikavError;
use crate::event::{Event, WireEvent};
use crate::router::EventRouter;

const MAX_BIND_ATTEMPTS: u32 = 15;

/// Fan-in side of the broker deployment shape: a single
/// consumer per node replays every event published on the shared subject
/// through the router module, including `$SYS/session` control events used
/// to propagate subscribe/unsubscribe across the cluster.
///
/// Binding is keyed by node id purely to guard against two processes
/// accidentally reusing the same id — not to load-balance, since every node
/// needs the full event stream to serve the sessions it owns. JetStream
/// durable consumer binding enforces that guard: binding a durable name
/// already held by another connection fails, so on conflict this retries
/// with a numeric suffix.
pub struct BrokerConsumer {
    jetstream: jetstream::Context,
    subject: String,
}

impl BrokerConsumer {
    pub async fn connect(url: &str, subject: impl Into<String>) -> Result<Self, PikavError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|error| PikavError::Fatal(format!("failed to connect to broker at {url}: {error}")))?;
        Ok(BrokerConsumer {
            jetstream: jetstream::new(client),
            subject: subject.into(),
        })
    }

    /// Binds a durable consumer named after `node_id` and runs the receive
    /// loop until a hard error occurs. Unmarshal errors are logged and
    /// skipped; a receive error on the subscription is fatal.
    pub async fn run(&self, node_id: &str, router: Arc<EventRouter>) -> Result<(), PikavError> {
        let mut messages = self.bind_with_retries(node_id).await?;

        loop {
            let message = messages
                .next()
                .await
                .ok_or_else(|| PikavError::Fatal("broker subscription ended unexpectedly".to_string()))?
                .map_err(|error| PikavError::Fatal(format!("broker receive error: {error}")))?;

            match serde_json::from_slice::<WireEvent>(&message.payload) {
                Ok(wire) => match Event::try_from(wire) {
                    Ok(event) => router.dispatch(event),
                    Err(error) => warn!(%error, "dropping broker message with invalid topic"),
                },
                Err(error) => warn!(%error, "dropping malformed broker message"),
            }

            if let Err(error) = message.ack().await {
                warn!(%error, "failed to ack broker message");
            }
        }
    }

    async fn bind_with_retries(
        &self,
        node_id: &str,
    ) -> Result<jetstream::consumer::pull::Stream, PikavError> {
        let stream = self
            .jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: "pikav".to_string(),
                subjects: vec![self.subject.clone()],
                ..Default::default()
            })
            .await
            .map_err(|error| PikavError::Fatal(format!("failed to ensure broker stream: {error}")))?;

        for attempt in 0..MAX_BIND_ATTEMPTS {
            let durable_name = if attempt == 0 {
                node_id.to_string()
            } else {
                format!("{node_id}-{attempt}")
            };

            match stream
                .create_consumer(jetstream::consumer::pull::Config {
                    durable_name: Some(durable_name.clone()),
                    ..Default::default()
                })
                .await
            {
                Ok(consumer) => {
                    info!(durable_name, "broker consumer bound");
                    return consumer
                        .messages()
                        .await
                        .map_err(|error| PikavError::Fatal(format!("failed to open message stream: {error}")));
                }
                Err(error) => {
                    warn!(%error, durable_name, "durable name already bound, retrying with suffix");
                }
            }
        }

        Err(PikavError::Fatal(format!(
            "exhausted {MAX_BIND_ATTEMPTS} attempts binding a broker consumer for node `{node_id}`"
        )))
    }

    /// Publishes a `$SYS/session` control event so every node's consumer
    /// applies the same subscribe/unsubscribe the originating node just
    /// applied locally.
    pub async fn publish(&self, event: &Event) -> Result<(), PikavError> {
        let wire = WireEvent {
            user_id: event.user_id.clone(),
            topic: crate::event::WireTopic {
                value: event.topic.as_str().to_string(),
            },
            name: event.name.clone(),
            data: event.data.clone(),
            metadata: event.metadata.clone(),
        };
        let payload = serde_json::to_vec(&wire)?;
        self.jetstream
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|error| PikavError::Fatal(format!("failed to publish to broker: {error}")))?;
        Ok(())
    }
}
