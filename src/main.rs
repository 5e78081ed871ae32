use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use pikav::auth::Auth;
use pikav::broker::BrokerConsumer;
use pikav::config::Config;
use pikav::handlers::{self, AppState};
use pikav::peer::PeerForwarder;
use pikav::registry::SessionRegistry;
use pikav::router::EventRouter;
use pikav::subscription::SubscriptionIndex;

const CONFIG_PATH: &str = "config.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::load(CONFIG_PATH).context("error constructing config")?;
    info!(node_id = %config.id, addr = %config.addr, "configuration loaded");

    run(config).await
}

async fn run(config: Config) -> Result<()> {
    let registry = Arc::new(SessionRegistry::new());
    let subscriptions = Arc::new(SubscriptionIndex::new(registry.clone()));
    let router = Arc::new(EventRouter::new(registry.clone(), subscriptions.clone()));

    // The close hook is the only path that keeps the subscription index in
    // sync with sessions the registry has already forgotten; it must be
    // wired before any session can open.
    let subscriptions_for_hook = subscriptions.clone();
    registry.on_close(move |id| subscriptions_for_hook.handle_session_closed(id));

    let auth = Arc::new(
        Auth::new(config.jwks_url.clone())
            .await
            .context("error bootstrapping JWKS key set")?,
    );
    auth.spawn_periodic_refresh();

    let peers = match &config.nodes {
        Some(nodes) if !nodes.is_empty() => {
            info!(count = nodes.len(), "peer mesh forwarding enabled");
            Some(Arc::new(PeerForwarder::new(nodes.clone(), config.id.clone())))
        }
        _ => None,
    };

    let broker = match &config.broker {
        Some(broker_config) => {
            info!(url = %broker_config.url, "broker fan-in enabled");
            Some(Arc::new(
                BrokerConsumer::connect(&broker_config.url, broker_config.topic.clone())
                    .await
                    .context("error connecting to broker")?,
            ))
        }
        None => None,
    };

    let state = AppState {
        registry: registry.clone(),
        subscriptions,
        router: router.clone(),
        auth,
        peers,
        broker: broker.clone(),
    };

    let addr: std::net::SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid bind address `{}`", config.addr))?;

    let server = warp::serve(handlers::routes(state)).run(addr);
    info!(%addr, "listening");

    match broker {
        Some(consumer) => {
            let node_id = config.id.clone();
            tokio::select! {
                _ = server => {
                    info!("HTTP server stopped");
                }
                result = consumer.run(&node_id, router) => {
                    result.context("broker consumer terminated")?;
                }
            }
        }
        None => server.await,
    }

    Ok(())
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use eventsource_stream::Eventsource;
    use serde_json::json;
    use serial_test::serial;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    fn test_config(addr: &str) -> Config {
        Config {
            addr: addr.to_string(),
            jwks_url: "http://127.0.0.1:0/jwks.json".to_string(),
            id: "test-node".to_string(),
            broker: None,
            nodes: None,
        }
    }

    /// Exercises the full open/subscribe/publish/deliver path over a real
    /// HTTP+SSE connection. Ignored by default since it binds a real socket
    /// and needs a reachable JWKS endpoint to mint a valid bearer token.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[serial]
    #[ignore]
    async fn create_subscribe_publish_deliver() {
        let config = test_config("127.0.0.1:19080");
        tokio::spawn(run(config));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut stream = reqwest::Client::new()
            .get("http://127.0.0.1:19080/sse")
            .send()
            .await
            .expect("sse connection")
            .bytes_stream()
            .eventsource();

        let created = stream
            .next()
            .await
            .expect("created frame")
            .expect("valid sse frame");
        let envelope: serde_json::Value = serde_json::from_str(&created.data).unwrap();
        let session_id = envelope["data"].as_str().expect("session id").to_string();

        let client = reqwest::Client::new();
        client
            .put("http://127.0.0.1:19080/sub/todos/%23")
            .header("X-Pikav-Session-ID", &session_id)
            .header("Authorization", "Bearer test-token")
            .send()
            .await
            .expect("subscribe request");

        client
            .post("http://127.0.0.1:19080/pub")
            .json(&json!({
                "user_id": "u1",
                "topic": {"value": "todos/42"},
                "name": "Created",
                "data": {"x": 1},
                "metadata": null,
            }))
            .send()
            .await
            .expect("publish request");

        let delivered = stream
            .next()
            .await
            .expect("delivered frame")
            .expect("valid sse frame");
        assert!(delivered.data.contains("todos/42"));
    }
}
