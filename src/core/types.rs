use super::error::{RegistryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Identifier of a consensus group.
pub type GroupId = String;

/// Network identity of a consensus-group member.
///
/// Serialized as a `"host:port"` string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerAddress {
    host: String,
    port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(RegistryError::ConfigParse(
                "peer host must not be empty".to_string(),
            ));
        }
        if port == 0 {
            return Err(RegistryError::ConfigParse(format!(
                "peer '{}' has port 0",
                host
            )));
        }
        Ok(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        // rsplit keeps bracketed IPv6 hosts intact
        let (host, port) = s.rsplit_once(':').ok_or_else(|| {
            RegistryError::ConfigParse(format!("peer '{}' is not in host:port form", s))
        })?;
        let port = port
            .parse::<u16>()
            .map_err(|_| RegistryError::ConfigParse(format!("peer '{}' has an invalid port", s)))?;
        Self::new(host, port)
    }
}

impl TryFrom<String> for PeerAddress {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PeerAddress> for String {
    fn from(value: PeerAddress) -> Self {
        value.to_string()
    }
}

/// Member set of a consensus group, parsed from `host:port,host:port,...`.
///
/// Parsing is all-or-nothing: a single malformed entry rejects the whole string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberConfiguration {
    peers: Vec<PeerAddress>,
}

impl MemberConfiguration {
    pub fn parse(conf: &str) -> Result<Self> {
        if conf.trim().is_empty() {
            return Err(RegistryError::ConfigParse(
                "member configuration must not be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let mut peers = Vec::new();
        for entry in conf.split(',') {
            if entry.trim().is_empty() {
                return Err(RegistryError::ConfigParse(format!(
                    "Fail to parse conf: '{}' contains an empty entry",
                    conf
                )));
            }
            let peer: PeerAddress = entry.parse().map_err(|err| {
                RegistryError::ConfigParse(format!("Fail to parse conf '{}': {}", conf, err))
            })?;
            if seen.insert(peer.clone()) {
                peers.push(peer);
            }
        }

        Ok(Self { peers })
    }

    pub fn peers(&self) -> &[PeerAddress] {
        &self.peers
    }

    pub fn contains(&self, peer: &PeerAddress) -> bool {
        self.peers.contains(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl FromStr for MemberConfiguration {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for MemberConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .peers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer() {
        let peer: PeerAddress = "10.0.0.1:9001".parse().unwrap();
        assert_eq!(peer.host(), "10.0.0.1");
        assert_eq!(peer.port(), 9001);
        assert_eq!(peer.to_string(), "10.0.0.1:9001");
    }

    #[test]
    fn test_parse_peer_rejects_garbage() {
        assert!("10.0.0.1".parse::<PeerAddress>().is_err());
        assert!("10.0.0.1:http".parse::<PeerAddress>().is_err());
        assert!(":9001".parse::<PeerAddress>().is_err());
        assert!("10.0.0.1:0".parse::<PeerAddress>().is_err());
        assert!("10.0.0.1:70000".parse::<PeerAddress>().is_err());
    }

    #[test]
    fn test_peer_serde_as_string() {
        let peer: PeerAddress = "node-a:7000".parse().unwrap();
        let json = serde_json::to_string(&peer).unwrap();
        assert_eq!(json, "\"node-a:7000\"");

        let back: PeerAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, peer);
        assert!(serde_json::from_str::<PeerAddress>("\"node-a\"").is_err());
    }

    #[test]
    fn test_member_configuration() {
        let conf = MemberConfiguration::parse("10.0.0.1:9001, 10.0.0.2:9001,10.0.0.1:9001").unwrap();
        assert_eq!(conf.len(), 2);
        assert_eq!(conf.to_string(), "10.0.0.1:9001,10.0.0.2:9001");
        assert!(conf.contains(&"10.0.0.2:9001".parse().unwrap()));
    }

    #[test]
    fn test_member_configuration_is_all_or_nothing() {
        for conf in ["", "  ", "10.0.0.1:9001,", "10.0.0.1:9001,bogus", "a:1,,b:2"] {
            let err = MemberConfiguration::parse(conf).unwrap_err();
            assert!(matches!(err, RegistryError::ConfigParse(_)), "{conf:?}");
        }
    }
}
