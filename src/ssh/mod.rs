// SSH transport seam
pub mod client;
pub mod session;
pub mod tunnel;

pub use client::{Ssh2Transport, SshClient};
pub use session::Session;
pub use tunnel::SshTunnel;

use crate::config::ConnectOptions;
use crate::server::ServerDescriptor;
use crate::utils::error::{CloseError, ConnectError};
use anyhow::Result;
use std::sync::Arc;

/// Dials remote endpoints. Handshake and authentication live behind this
/// trait; everything above it only sees connections and tunnels.
pub trait Transport: Send + Sync {
    /// Opens a full remote session.
    fn connect(
        &self,
        server: &ServerDescriptor,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Connection>, ConnectError>;

    /// Opens a forwarding-only tunnel through `gateway`.
    fn open_tunnel(
        &self,
        gateway: &ServerDescriptor,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn TunnelHandle>, ConnectError>;
}

/// A live forwarding tunnel.
pub trait TunnelHandle: Send + Sync {
    /// Binds a local port whose connections are forwarded to
    /// `host:port` as seen from the far end of the tunnel.
    fn open(&self, host: &str, port: u16) -> Result<u16, ConnectError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub exit_status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// An authenticated remote session.
pub trait Connection: Send + Sync {
    fn exec(&self, command: &str) -> Result<CommandOutput>;

    fn close(&self) -> std::result::Result<(), CloseError>;
}
