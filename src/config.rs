use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::Deserialize;

use crate::error::PikavError;

/// The service's single configuration record.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// `host:port` the HTTP server binds to.
    pub addr: String,
    /// JWKS endpoint used to verify bearer tokens.
    pub jwks_url: String,
    /// This node's identity, used as a broker consumer/producer name and
    /// logged on startup.
    pub id: String,
    /// Present only in the broker fan-in deployment shape.
    pub broker: Option<BrokerConfig>,
    /// Present only in the peer-mesh deployment shape. These
    /// two are alternative deployment shapes, not composable.
    pub nodes: Option<Vec<NodeConfig>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BrokerConfig {
    pub url: String,
    pub topic: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NodeConfig {
    pub url: String,
    /// Opaque value shared out-of-band with this peer, e.g. for mutual
    /// authentication of forwarded requests. Unused by the router itself.
    #[serde(default)]
    pub shared: Option<String>,
}

impl Config {
    /// Loads `path` as YAML, then layers environment variables prefixed
    /// `PIKAV_` on top (e.g. `PIKAV_ADDR` overrides `addr`) — env always
    /// wins over the file.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, PikavError> {
        Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("PIKAV_").split("__"))
            .extract()
            .map_err(|error| PikavError::Fatal(format!("error constructing config: {error}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn write_yaml(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{contents}").unwrap();
        file
    }

    #[test]
    fn loads_minimal_yaml() {
        let file = write_yaml(
            r#"
addr: "0.0.0.0:3012"
jwks_url: "https://example.com/.well-known/jwks.json"
id: "node-1"
"#,
        );
        let config = Config::load(file.path()).expect("config should load");
        assert_eq!(config.addr, "0.0.0.0:3012");
        assert!(config.broker.is_none());
        assert!(config.nodes.is_none());
    }

    #[test]
    #[serial]
    fn env_overrides_file_value() {
        let file = write_yaml(
            r#"
addr: "0.0.0.0:3012"
jwks_url: "https://example.com/jwks.json"
id: "node-1"
"#,
        );
        std::env::set_var("PIKAV_ADDR", "0.0.0.0:9999");
        let config = Config::load(file.path()).expect("config should load");
        std::env::remove_var("PIKAV_ADDR");
        assert_eq!(config.addr, "0.0.0.0:9999");
    }
}
