//! Bot configuration, loaded from a TOML file.
//!
//! ```toml
//! server   = "irc.example.net:+6697"
//! nickname = "canopy"
//! channel  = "#network-ops"
//! ignore   = ["flaky.example.net"]
//!
//! [sasl]
//! username = "canopy"
//! password = "hunter2"
//!
//! [oper]
//! name     = "canopy"
//! password = "opersecret"
//! ```
//!
//! The server port carries the TLS marker: `host:+port` connects with TLS,
//! `host:port` in the clear.

use serde::Deserialize;

/// Probe rounds a server may miss before it is flagged as hung.
pub const DEFAULT_WARN_THRESHOLD: u32 = 2;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// `host:port` or `host:+port` (TLS).
    pub server: String,
    pub nickname: String,
    /// Defaults to `nickname`.
    pub username: Option<String>,
    /// Defaults to `nickname`.
    pub realname: Option<String>,
    /// Server password (`PASS`), if the network requires one.
    pub password: Option<String>,
    /// Channel that receives alert lines.
    pub channel: String,
    /// Servers never probed; their subtrees are not traversed.
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: u32,
    pub sasl: Option<SaslConfig>,
    pub oper: OperConfig,
}

fn default_warn_threshold() -> u32 {
    DEFAULT_WARN_THRESHOLD
}

#[derive(Debug, Deserialize, Clone)]
pub struct SaslConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OperConfig {
    pub name: String,
    /// Plain `OPER` password. When absent, elevation needs a challenge
    /// responder wired in at session construction.
    pub password: Option<String>,
}

/// A parsed `server` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("bad server endpoint {0:?}: expected host:port or host:+port")]
    BadEndpoint(String),
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        // Surface an unusable endpoint at load time, not at connect time.
        config.endpoint()?;
        Ok(config)
    }

    /// Parse the `server` field into host, port, and TLS flag.
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        let bad = || ConfigError::BadEndpoint(self.server.clone());

        let (host, port_s) = self.server.rsplit_once(':').ok_or_else(bad)?;
        if host.is_empty() {
            return Err(bad());
        }
        let (tls, digits) = match port_s.strip_prefix('+') {
            Some(rest) => (true, rest),
            None => (false, port_s),
        };
        let port: u16 = digits.parse().map_err(|_| bad())?;
        if port == 0 {
            return Err(bad());
        }

        Ok(Endpoint {
            host: host.to_owned(),
            port,
            tls,
        })
    }

    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.nickname)
    }

    pub fn realname(&self) -> &str {
        self.realname.as_deref().unwrap_or(&self.nickname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MINIMAL: &str = r##"
        server   = "irc.example.net:+6697"
        nickname = "canopy"
        channel  = "#network-ops"

        [oper]
        name     = "canopy"
        password = "opersecret"
    "##;

    #[test]
    fn minimal_config_parses() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.nickname, "canopy");
        assert_eq!(config.channel, "#network-ops");
        assert_eq!(config.warn_threshold, DEFAULT_WARN_THRESHOLD);
        assert!(config.ignore.is_empty());
        assert!(config.sasl.is_none());
        assert_eq!(config.username(), "canopy");
        assert_eq!(config.realname(), "canopy");
    }

    #[test]
    fn endpoint_with_tls_marker() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(
            config.endpoint().unwrap(),
            Endpoint {
                host: "irc.example.net".into(),
                port: 6697,
                tls: true,
            }
        );
    }

    #[test]
    fn endpoint_plaintext() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.server = "irc.example.net:6667".into();
        let ep = config.endpoint().unwrap();
        assert_eq!(ep.port, 6667);
        assert!(!ep.tls);
    }

    #[test]
    fn endpoint_rejects_garbage() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        for bad in ["irc.example.net", "irc.example.net:", ":6667", "irc.example.net:+x", "irc.example.net:0"] {
            config.server = bad.into();
            assert!(config.endpoint().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn full_config_parses() {
        let config: Config = toml::from_str(
            r##"
            server         = "hub.example.net:6667"
            nickname       = "canopy"
            username       = "watcher"
            realname       = "network monitor"
            password       = "linkpass"
            channel        = "#ops"
            ignore         = ["flaky.example.net", "lab.example.net"]
            warn_threshold = 3

            [sasl]
            username = "canopy"
            password = "hunter2"

            [oper]
            name = "canopy"
            "##,
        )
        .unwrap();
        assert_eq!(config.username(), "watcher");
        assert_eq!(config.realname(), "network monitor");
        assert_eq!(config.ignore.len(), 2);
        assert_eq!(config.warn_threshold, 3);
        assert!(config.sasl.is_some());
        assert!(config.oper.password.is_none());
    }
}
