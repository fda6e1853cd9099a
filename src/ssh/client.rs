// ssh2-backed client
use crate::config::{AuthMethod, ConnectOptions};
use crate::server::ServerDescriptor;
use crate::ssh::tunnel::SshTunnel;
use crate::ssh::{CommandOutput, Connection, Transport, TunnelHandle};
use crate::utils::error::{CloseError, ConnectError};
use anyhow::{anyhow, Context, Result};
use log::debug;
use ssh2::{ErrorCode, Session};
use std::io::prelude::*;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use std::sync::Arc;

// libssh2 codes for a peer that is already gone
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

pub struct SshClient {
    pub session: Session,
    label: String,
}

impl SshClient {
    pub fn connect(server: &ServerDescriptor, options: &ConnectOptions) -> Result<Self> {
        let port = server.port_or_default();
        let username = server
            .user
            .as_deref()
            .unwrap_or(&options.default_user);
        debug!("Dialing {}@{}:{}", username, server.host, port);

        let addrs: Vec<SocketAddr> = (server.host.as_str(), port)
            .to_socket_addrs()
            .context("Failed to resolve SSH server address")?
            .collect();
        let tcp = dial_any(&addrs, options.timeout)
            .with_context(|| format!("Failed to connect to SSH server {}", server))?;

        let mut session = Session::new().context("Failed to create SSH session")?;
        if let Some(timeout) = options.timeout {
            session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
        }
        session.set_tcp_stream(tcp);
        session.handshake().context("SSH handshake failed")?;

        match &options.auth {
            AuthMethod::Password(password) => {
                session
                    .userauth_password(username, password)
                    .context("Password authentication failed")?;
            }
            AuthMethod::PublicKey(key_path) => {
                session
                    .userauth_pubkey_file(username, None, key_path, None)
                    .context("Public key authentication failed")?;
            }
            AuthMethod::Agent => {
                session
                    .userauth_agent(username)
                    .context("SSH agent authentication failed")?;
            }
        }

        if !session.authenticated() {
            return Err(anyhow!("Authentication failed for {}", server));
        }

        // Handshake is done; exec and forwarding must not inherit the dial timeout.
        session.set_timeout(0);

        Ok(SshClient {
            session,
            label: server.to_string(),
        })
    }
}

impl Connection for SshClient {
    fn exec(&self, command: &str) -> Result<CommandOutput> {
        let mut channel = self
            .session
            .channel_session()
            .context("Failed to create SSH channel")?;

        channel.exec(command).context("Failed to execute command")?;

        let mut stdout = String::new();
        channel
            .read_to_string(&mut stdout)
            .context("Failed to read command output")?;

        channel.wait_close().context("Failed to close channel")?;
        let exit_status = channel
            .exit_status()
            .context("Failed to read exit status")?;

        Ok(CommandOutput {
            stdout,
            exit_status,
        })
    }

    fn close(&self) -> std::result::Result<(), CloseError> {
        debug!("Disconnecting {}", self.label);
        self.session
            .disconnect(None, "ssh-fanout closing session", None)
            .map_err(classify_close_error)
    }
}

/// Tries each resolved address in turn and keeps the first that answers.
fn dial_any(addrs: &[SocketAddr], timeout: Option<Duration>) -> Result<TcpStream> {
    let mut last_error = None;
    for addr in addrs {
        let attempt = match timeout {
            Some(timeout) => TcpStream::connect_timeout(addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(tcp) => return Ok(tcp),
            Err(e) => {
                debug!("Dial {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }
    match last_error {
        Some(e) => Err(e.into()),
        None => Err(anyhow!("No address found")),
    }
}

pub(crate) fn classify_close_error(err: ssh2::Error) -> CloseError {
    match err.code() {
        ErrorCode::Session(
            LIBSSH2_ERROR_SOCKET_SEND | LIBSSH2_ERROR_SOCKET_DISCONNECT | LIBSSH2_ERROR_SOCKET_RECV,
        ) => CloseError::ConnectionDropped,
        _ => CloseError::Other(err.to_string()),
    }
}

/// Production transport dialing real hosts with libssh2.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ssh2Transport;

impl Transport for Ssh2Transport {
    fn connect(
        &self,
        server: &ServerDescriptor,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Connection>, ConnectError> {
        let client = SshClient::connect(server, options)
            .map_err(|e| ConnectError::for_server(server, format!("{e:#}")))?;
        Ok(Box::new(client))
    }

    fn open_tunnel(
        &self,
        gateway: &ServerDescriptor,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn TunnelHandle>, ConnectError> {
        let client = SshClient::connect(gateway, options)
            .map_err(|e| ConnectError::for_server(gateway, format!("gateway: {e:#}")))?;
        Ok(Arc::new(SshTunnel::new(client.session, gateway.to_string())))
    }
}
