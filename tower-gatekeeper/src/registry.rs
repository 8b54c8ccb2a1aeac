use std::collections::BTreeSet;
use std::fmt;

use url::Url;

use crate::error::ConfigError;

pub const DEFAULT_SCHEME: &str = "tcp";

/// Accounting port used when an address does not name one.
pub const DEFAULT_PORT: u16 = 10004;

/// A parsed `[scheme://]host[:port]` governor address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GovernorAddress {
    scheme: String,
    host: String,
    port: u16,
}

impl GovernorAddress {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let fail = |reason| ConfigError::Address {
            address: raw.to_string(),
            reason,
        };

        let trimmed = raw.trim();
        // An empty port would otherwise fall back to the default.
        if trimmed.ends_with(':') {
            return Err(fail("invalid port"));
        }
        let url = if trimmed.contains("://") {
            Url::parse(trimmed)
        } else {
            Url::parse(&format!("{DEFAULT_SCHEME}://{trimmed}"))
        }
        .map_err(|err| match err {
            url::ParseError::InvalidPort => fail("invalid port"),
            url::ParseError::EmptyHost => fail("missing host"),
            _ => fail("malformed address"),
        })?;

        if !url.username().is_empty() || url.password().is_some() {
            return Err(fail("unexpected credentials"));
        }
        if !url.path().is_empty() || url.query().is_some() || url.fragment().is_some() {
            return Err(fail("unexpected path"));
        }
        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => return Err(fail("missing host")),
        };
        let port = url.port().unwrap_or(DEFAULT_PORT);
        if port == 0 {
            return Err(fail("invalid port"));
        }
        if port == u16::MAX {
            return Err(fail("no room for the control port"));
        }

        Ok(Self {
            scheme: url.scheme().to_string(),
            host,
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The control channel lives on the next port of the same host.
    pub fn control(&self) -> Self {
        Self {
            scheme: self.scheme.clone(),
            host: self.host.clone(),
            port: self.port + 1,
        }
    }
}

impl fmt::Display for GovernorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// One governor and the domains routed to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterEndpoint {
    address: GovernorAddress,
    accounting_address: String,
    control_address: String,
    domains: BTreeSet<String>,
}

impl MasterEndpoint {
    fn new(address: GovernorAddress) -> Self {
        Self {
            accounting_address: address.to_string(),
            control_address: address.control().to_string(),
            address,
            domains: BTreeSet::new(),
        }
    }

    pub fn address(&self) -> &GovernorAddress {
        &self.address
    }

    pub fn accounting_address(&self) -> &str {
        &self.accounting_address
    }

    pub fn control_address(&self) -> &str {
        &self.control_address
    }

    pub fn domains(&self) -> &BTreeSet<String> {
        &self.domains
    }

    pub fn serves(&self, domain: &str) -> bool {
        self.domains.contains(domain)
    }
}

/// Governors known to this filter, deduplicated by accounting address.
///
/// Built once while the configuration is compiled and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct MasterRegistry {
    endpoints: Vec<MasterEndpoint>,
}

impl MasterRegistry {
    /// Routes `domain` to the governor at `server`, returning its index.
    pub fn register(&mut self, server: &str, domain: &str) -> Result<usize, ConfigError> {
        let address = GovernorAddress::parse(server)?;
        let index = match self.endpoints.iter().position(|e| e.address == address) {
            Some(index) => index,
            None => {
                tracing::debug!(%address, "registered governor");
                self.endpoints.push(MasterEndpoint::new(address));
                self.endpoints.len() - 1
            }
        };
        self.endpoints[index].domains.insert(domain.to_string());
        Ok(index)
    }

    pub fn endpoint(&self, index: usize) -> Option<&MasterEndpoint> {
        self.endpoints.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MasterEndpoint> {
        self.endpoints.iter()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_defaults() {
        let address = GovernorAddress::parse("governor.local").unwrap();
        assert_eq!(address.to_string(), "tcp://governor.local:10004");
        assert_eq!(address.control().to_string(), "tcp://governor.local:10005");
    }

    #[test]
    fn test_address_forms() {
        let cases = [
            ("tcp://localhost:10004", "tcp://localhost:10004"),
            ("TCP://10.0.0.1:7000", "tcp://10.0.0.1:7000"),
            ("10.0.0.1:7000", "tcp://10.0.0.1:7000"),
            ("ipc://gov", "ipc://gov:10004"),
            ("tcp://[::1]:9000", "tcp://[::1]:9000"),
            ("[::1]", "tcp://[::1]:10004"),
        ];
        for (raw, expected) in cases {
            assert_eq!(GovernorAddress::parse(raw).unwrap().to_string(), expected, "{raw}");
        }
    }

    #[test]
    fn test_bad_addresses() {
        for raw in [
            "",
            "tcp://",
            "://host",
            "host:",
            "host:abc",
            "host:0",
            "host:65535",
            "host:70000",
            "tcp://host:1/path",
            "[::1",
            "tcp://gov:10004:7000",
            "tcp://user@gov:10004",
            "gov:abc:10004",
            "tcp://::1:9000",
        ] {
            assert!(
                matches!(GovernorAddress::parse(raw), Err(ConfigError::Address { .. })),
                "{raw}"
            );
        }
    }

    #[test]
    fn test_registry_deduplicates_by_address() {
        let mut registry = MasterRegistry::default();
        assert_eq!(registry.register("tcp://localhost:10004", "api").unwrap(), 0);
        assert_eq!(registry.register("localhost", "web").unwrap(), 0);
        assert_eq!(registry.register("tcp://localhost:20004", "api").unwrap(), 1);
        assert_eq!(registry.register("localhost:10004", "api").unwrap(), 0);

        assert_eq!(registry.len(), 2);
        let first = registry.endpoint(0).unwrap();
        assert_eq!(first.control_address(), "tcp://localhost:10005");
        assert_eq!(
            first.domains().iter().collect::<Vec<_>>(),
            vec!["api", "web"]
        );
        assert!(first.serves("web"));
        assert!(!registry.endpoint(1).unwrap().serves("web"));
        assert!(registry.endpoint(2).is_none());
    }
}
