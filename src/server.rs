// Remote endpoint identity
use crate::utils::error::ConfigError;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const LOOPBACK: &str = "127.0.0.1";

/// Identity of a remote endpoint.
///
/// Equality and hashing only consider `host`, `user` and `port`; roles and
/// per-host options ride along but never make two descriptors distinct.
#[derive(Debug, Clone)]
pub struct ServerDescriptor {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub roles: Vec<String>,
    pub options: BTreeMap<String, String>,
}

impl ServerDescriptor {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: None,
            roles: Vec::new(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SSH_PORT)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// The loopback endpoint a forwarded port exposes for this server.
    pub fn forwarded_to(&self, local_port: u16) -> Self {
        Self {
            host: LOOPBACK.to_string(),
            user: self.user.clone(),
            port: Some(local_port),
            roles: Vec::new(),
            options: self.options.clone(),
        }
    }

    /// Parses `[user@]host[:port]`, with `[addr]:port` for IPv6 literals.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(ConfigError::InvalidServer("empty address".to_string()));
        }

        let (user, rest) = match spec.rsplit_once('@') {
            Some((user, _)) if user.is_empty() => {
                return Err(ConfigError::InvalidServer(spec.to_string()))
            }
            Some((user, rest)) => (Some(user.to_string()), rest),
            None => (None, spec),
        };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| ConfigError::InvalidServer(spec.to_string()))?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(ConfigError::InvalidServer(spec.to_string())),
            }
        } else if rest.matches(':').count() == 1 {
            let (host, port) = rest.split_once(':').unwrap_or((rest, ""));
            (host, Some(port))
        } else {
            (rest, None)
        };

        if host.is_empty() {
            return Err(ConfigError::InvalidServer(spec.to_string()));
        }

        let port = port
            .map(|p| {
                p.parse::<u16>()
                    .map_err(|_| ConfigError::InvalidServer(format!("bad port in {spec}")))
            })
            .transpose()?;

        Ok(Self {
            host: host.to_string(),
            user,
            port,
            roles: Vec::new(),
            options: BTreeMap::new(),
        })
    }
}

impl PartialEq for ServerDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.user == other.user && self.port == other.port
    }
}

impl Eq for ServerDescriptor {}

impl Hash for ServerDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.user.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}
