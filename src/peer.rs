use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

use crate::config::NodeConfig;

const FORWARD_TIMEOUT: Duration = Duration::from_secs(20);

/// Header carried on a forwarded request so the receiving node processes
/// it locally but never re-forwards it, preventing forwarding loops.
pub const FORWARDED_BY_HEADER: &str = "x-pikav-forwarded-by";

/// Hop-by-hop headers stripped before forwarding.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
];

/// Mirrors a completed subscribe/unsubscribe/publish request to every
/// configured peer. Forwarding is fire-and-forget:
/// failures are logged and discarded, never surfaced to the original
/// caller.
pub struct PeerForwarder {
    http: reqwest::Client,
    peers: Vec<NodeConfig>,
    zone: String,
}

impl PeerForwarder {
    pub fn new(peers: Vec<NodeConfig>, zone: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(FORWARD_TIMEOUT)
            .build()
            .expect("reqwest client builds with a static config");
        PeerForwarder { http, peers, zone }
    }

    /// Fires the forward to every peer and returns immediately; callers
    /// should `tokio::spawn` this rather than await it inline, so a slow
    /// or unreachable peer never delays the originating response.
    pub async fn forward(
        &self,
        method: reqwest::Method,
        path_and_query: &str,
        body: Vec<u8>,
        mut headers: HeaderMap,
        forwarded_for: Option<String>,
    ) {
        if self.peers.is_empty() {
            return;
        }

        for header in HOP_BY_HOP {
            headers.remove(*header);
        }
        if let Ok(value) = HeaderValue::from_str(&self.zone) {
            headers.insert(HeaderName::from_static("x-pikav-forwarded-by"), value);
        }
        if let Some(chain) = &forwarded_for {
            if let Ok(value) = HeaderValue::from_str(chain) {
                headers.insert(HeaderName::from_static("x-forwarded-for"), value);
            }
        }

        for peer in &self.peers {
            let url = format!("{}{}", peer.url.trim_end_matches('/'), path_and_query);
            let request = self
                .http
                .request(method.clone(), &url)
                .headers(headers.clone())
                .body(body.clone());

            if let Err(error) = request.send().await {
                warn!(%error, peer = %peer.url, "peer forward failed");
            }
        }
    }
}

/// Appends this hop to an `X-Forwarded-For` chain.
pub fn append_forwarded_for(existing: Option<&str>, this_hop: &str) -> String {
    match existing {
        Some(chain) if !chain.is_empty() => format!("{chain}, {this_hop}"),
        _ => this_hop.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_to_existing_chain() {
        assert_eq!(append_forwarded_for(Some("1.2.3.4"), "5.6.7.8"), "1.2.3.4, 5.6.7.8");
    }

    #[test]
    fn starts_a_new_chain_when_absent() {
        assert_eq!(append_forwarded_for(None, "5.6.7.8"), "5.6.7.8");
    }

    #[test]
    fn empty_peer_list_is_inert() {
        let forwarder = PeerForwarder::new(Vec::new(), "zone-a".to_string());
        assert!(forwarder.peers.is_empty());
    }
}
