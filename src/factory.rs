// Connection factories: direct dials and gateway-routed dials
use crate::config::ConnectOptions;
use crate::gateway::{GatewayRegistry, GatewaySpec};
use crate::server::ServerDescriptor;
use crate::ssh::{Session, Transport};
use crate::utils::error::ConnectError;
use log::{debug, info};
use std::sync::Arc;

pub trait ConnectionFactory: Send + Sync {
    fn connect_to(&self, server: &ServerDescriptor) -> Result<Session, ConnectError>;
}

pub struct DirectConnectionFactory {
    transport: Arc<dyn Transport>,
    options: ConnectOptions,
}

impl DirectConnectionFactory {
    pub fn new(transport: Arc<dyn Transport>, options: ConnectOptions) -> Self {
        Self { transport, options }
    }
}

impl ConnectionFactory for DirectConnectionFactory {
    fn connect_to(&self, server: &ServerDescriptor) -> Result<Session, ConnectError> {
        debug!("Connecting to {}", server);
        let connection = self.transport.connect(server, &self.options)?;
        Ok(Session::direct(server.clone(), connection))
    }
}

pub struct GatewayConnectionFactory {
    transport: Arc<dyn Transport>,
    options: ConnectOptions,
    registry: GatewayRegistry,
}

impl GatewayConnectionFactory {
    pub fn new(
        transport: Arc<dyn Transport>,
        options: ConnectOptions,
        registry: GatewayRegistry,
    ) -> Self {
        Self {
            transport,
            options,
            registry,
        }
    }
}

impl ConnectionFactory for GatewayConnectionFactory {
    fn connect_to(&self, server: &ServerDescriptor) -> Result<Session, ConnectError> {
        let tunnel = self.registry.tunnel_for(&server.host);
        let local_port = tunnel
            .open(&server.host, server.port_or_default())
            .map_err(|e| ConnectError::for_server(server, e.to_string()))?;

        let local = server.forwarded_to(local_port);
        debug!("Connecting to {} via {}", server, local);
        let connection = self
            .transport
            .connect(&local, &self.options)
            .map_err(|e| ConnectError::for_server(server, e.reason))?;

        Ok(Session::tunnelled(local, connection, server.clone()))
    }
}

/// Builds the factory for `gateway`, opening every gateway tunnel up front.
pub fn build_factory(
    gateway: &GatewaySpec,
    transport: Arc<dyn Transport>,
    options: ConnectOptions,
) -> Result<Arc<dyn ConnectionFactory>, ConnectError> {
    match GatewayRegistry::build(gateway, transport.as_ref(), &options)? {
        Some(registry) => {
            info!("Using gateway connection factory");
            Ok(Arc::new(GatewayConnectionFactory::new(
                transport, options, registry,
            )))
        }
        None => {
            info!("Using direct connection factory");
            Ok(Arc::new(DirectConnectionFactory::new(transport, options)))
        }
    }
}
