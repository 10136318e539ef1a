use std::fmt;

use anyhow::{anyhow, Context, Result};

// A TCP endpoint. port == -1 means "unspecified", only ever valid for a
// jump host's own sshd endpoint; rejected for any upstream or
// jumphost_server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: i32,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: i32) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    // Parses host:port, requiring a present numeric port. Used for
    // upstreams and jumphost_server, never for the jump host's own sshd
    // endpoint, which allows a bare host meaning "default port".
    pub fn parse_host_port(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("'{}' is not in host:port form", s))?;
        if host.is_empty() {
            return Err(anyhow!("'{}' is missing a host", s));
        }
        let port: i32 = port
            .parse()
            .with_context(|| format!("'{}' has an invalid port", s))?;
        if port < 0 || port > u16::MAX as i32 {
            return Err(anyhow!("'{}' has a port out of range", s));
        }
        Ok(Self::new(host, port))
    }

    // Parses a jump-host spec: host or host:port. Missing port becomes
    // -1, meaning "use ssh's default".
    pub fn parse_jumphost(s: &str) -> Result<Self> {
        match s.rsplit_once(':') {
            Some((host, port)) => {
                let port: i32 = port
                    .parse()
                    .with_context(|| format!("'{}' has an invalid jumphost port", s))?;
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(s, -1)),
        }
    }

    pub fn is_unspecified_port(&self) -> bool {
        self.port == -1
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == -1 {
            write!(f, "{}", self.host)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
