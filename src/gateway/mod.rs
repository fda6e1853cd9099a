// Gateway routing: which tunnel chain reaches which target host
pub mod chain;

pub use chain::build_chain;

use crate::config::ConnectOptions;
use crate::server::ServerDescriptor;
use crate::ssh::{Transport, TunnelHandle};
use crate::utils::error::{ConfigError, ConnectError};
use indexmap::IndexMap;
use log::info;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Gateway option exactly as written in an inventory file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum GatewayConfig {
    Single(String),
    Chain(Vec<String>),
    Multi(IndexMap<String, Vec<String>>),
}

/// One chain of gateways and the targets routed through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayRoute {
    pub chain: Vec<ServerDescriptor>,
    pub hosts: Vec<String>,
}

/// Resolved gateway option.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GatewaySpec {
    #[default]
    NoGateway,
    /// One chain used for every target.
    SingleChain(Vec<ServerDescriptor>),
    /// Per-host routing; the first route doubles as the default.
    MultiGateway(Vec<GatewayRoute>),
}

impl GatewaySpec {
    /// Parses a chain written as `hop1,hop2,...`.
    pub fn parse_chain(spec: &str) -> Result<Vec<ServerDescriptor>, ConfigError> {
        spec.split(',')
            .map(str::trim)
            .filter(|hop| !hop.is_empty())
            .map(ServerDescriptor::parse)
            .collect()
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self, ConfigError> {
        match config {
            GatewayConfig::Single(spec) => Self::from_chain(Self::parse_chain(spec)?),
            GatewayConfig::Chain(hops) => {
                let chain = hops
                    .iter()
                    .map(|hop| ServerDescriptor::parse(hop))
                    .collect::<Result<Vec<_>, _>>()?;
                Self::from_chain(chain)
            }
            GatewayConfig::Multi(map) => {
                let mut routes = Vec::with_capacity(map.len());
                for (key, hosts) in map {
                    let chain = Self::parse_chain(key)?;
                    if chain.is_empty() {
                        return Err(ConfigError::InvalidGateway(format!(
                            "empty gateway for hosts {}",
                            hosts.join(", ")
                        )));
                    }
                    routes.push(GatewayRoute {
                        chain,
                        hosts: hosts.clone(),
                    });
                }
                if routes.is_empty() {
                    Ok(GatewaySpec::NoGateway)
                } else {
                    Ok(GatewaySpec::MultiGateway(routes))
                }
            }
        }
    }

    fn from_chain(chain: Vec<ServerDescriptor>) -> Result<Self, ConfigError> {
        if chain.is_empty() {
            Ok(GatewaySpec::NoGateway)
        } else {
            Ok(GatewaySpec::SingleChain(chain))
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, GatewaySpec::NoGateway)
    }
}

/// Live tunnels keyed by target host, with a fallback for unlisted hosts.
pub struct GatewayRegistry {
    routes: HashMap<String, Arc<dyn TunnelHandle>>,
    default: Arc<dyn TunnelHandle>,
}

impl GatewayRegistry {
    /// Builds every tunnel the spec names. Returns `None` for `NoGateway`.
    pub fn build(
        spec: &GatewaySpec,
        transport: &dyn Transport,
        options: &ConnectOptions,
    ) -> Result<Option<Self>, ConnectError> {
        match spec {
            GatewaySpec::NoGateway => Ok(None),
            GatewaySpec::SingleChain(chain) => {
                let tunnel = build_chain(chain, transport, options)?;
                Ok(Some(Self {
                    routes: HashMap::new(),
                    default: tunnel,
                }))
            }
            GatewaySpec::MultiGateway(routes) => {
                let mut by_host = HashMap::new();
                let mut default = None;
                for route in routes {
                    let tunnel = build_chain(&route.chain, transport, options)?;
                    info!(
                        "Routing {} host(s) through {}",
                        route.hosts.len(),
                        describe_chain(&route.chain)
                    );
                    for host in &route.hosts {
                        by_host.insert(host.clone(), Arc::clone(&tunnel));
                    }
                    default.get_or_insert(tunnel);
                }
                let default = default
                    .ok_or_else(|| ConnectError::new("gateway", "no gateway routes configured"))?;
                Ok(Some(Self {
                    routes: by_host,
                    default,
                }))
            }
        }
    }

    pub fn tunnel_for(&self, host: &str) -> &Arc<dyn TunnelHandle> {
        self.routes.get(host).unwrap_or(&self.default)
    }
}

pub fn describe_chain(chain: &[ServerDescriptor]) -> String {
    chain
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}
