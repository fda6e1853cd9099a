// Gateway tunnels: local port forwarding over a single ssh2 session
use crate::server::LOOPBACK;
use crate::ssh::TunnelHandle;
use crate::utils::error::ConnectError;
use log::{debug, warn};
use ssh2::{Channel, ErrorCode, Session};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const LIBSSH2_ERROR_EAGAIN: i32 = -37;
const POLL_INTERVAL: Duration = Duration::from_millis(2);
const BUFFER_SIZE: usize = 16 * 1024;
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// A forwarding-only session to a gateway host.
///
/// The session runs non-blocking so that any number of forwarded
/// connections can be pumped over it concurrently. Every port handed out
/// by `open` carries one connection and is closed as soon as it is taken.
pub struct SshTunnel {
    session: Session,
    gateway: String,
    shutdown: Arc<AtomicBool>,
}

impl SshTunnel {
    pub fn new(session: Session, gateway: String) -> Self {
        session.set_blocking(false);
        Self {
            session,
            gateway,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl TunnelHandle for SshTunnel {
    fn open(&self, host: &str, port: u16) -> Result<u16, ConnectError> {
        let target = format!("{host}:{port}");
        let fail = |e: io::Error| ConnectError::new(&target, format!("forward via {}: {e}", self.gateway));

        let listener = TcpListener::bind((LOOPBACK, 0)).map_err(fail)?;
        listener.set_nonblocking(true).map_err(fail)?;
        let local_port = listener.local_addr().map_err(fail)?.port();

        let forward = Forward {
            session: self.session.clone(),
            host: host.to_string(),
            port,
            shutdown: Arc::clone(&self.shutdown),
        };
        thread::Builder::new()
            .name(format!("forward-{local_port}"))
            .spawn(move || forward.serve(listener))
            .map_err(fail)?;

        debug!(
            "Forwarding {}:{} -> {} via {}",
            LOOPBACK, local_port, target, self.gateway
        );
        Ok(local_port)
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

struct Forward {
    session: Session,
    host: String,
    port: u16,
    shutdown: Arc<AtomicBool>,
}

impl Forward {
    /// Serves exactly one connection, then the listener goes away.
    fn serve(self, listener: TcpListener) {
        let stream = accept_one(&listener, &self.shutdown, ACCEPT_TIMEOUT);
        drop(listener);
        let Some(stream) = stream else {
            return;
        };

        let channel = match self.open_channel() {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Failed to open channel to {}:{}: {}", self.host, self.port, e);
                return;
            }
        };
        pump(stream, channel, &self.shutdown);
        debug!("Forward to {}:{} finished", self.host, self.port);
    }

    fn open_channel(&self) -> Result<Channel, ssh2::Error> {
        loop {
            match self.session.channel_direct_tcpip(&self.host, self.port, None) {
                Err(e) if e.code() == ErrorCode::Session(LIBSSH2_ERROR_EAGAIN) => {
                    thread::sleep(POLL_INTERVAL);
                }
                other => return other,
            }
        }
    }
}

/// Waits for the single client of a forwarded port.
///
/// Gives up when the tunnel shuts down or nobody connects within `timeout`.
fn accept_one(
    listener: &TcpListener,
    shutdown: &AtomicBool,
    timeout: Duration,
) -> Option<TcpStream> {
    let started = Instant::now();
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("Accepted {} on forwarded port", peer);
                return Some(stream);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if started.elapsed() >= timeout {
                    warn!("Nobody connected to forwarded port within {:?}", timeout);
                    return None;
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                warn!("Forward listener failed: {}", e);
                return None;
            }
        }
    }
    None
}

/// Copies bytes both ways until either side closes.
fn pump(mut local: TcpStream, mut channel: Channel, shutdown: &AtomicBool) {
    if let Err(e) = local.set_nonblocking(true) {
        warn!("Failed to set forwarded stream non-blocking: {}", e);
        return;
    }

    let mut buf = [0u8; BUFFER_SIZE];
    let mut to_remote: Vec<u8> = Vec::new();
    let mut to_local: Vec<u8> = Vec::new();

    while !shutdown.load(Ordering::Relaxed) {
        let mut progressed = false;

        if to_remote.is_empty() {
            match local.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    to_remote.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            }
        }
        if !to_remote.is_empty() {
            match channel.write(&to_remote) {
                Ok(n) => {
                    to_remote.drain(..n);
                    progressed = true;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            }
        }

        if to_local.is_empty() {
            match channel.read(&mut buf) {
                Ok(0) if channel.eof() => break,
                Ok(0) => {}
                Ok(n) => {
                    to_local.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            }
        }
        if !to_local.is_empty() {
            match local.write(&to_local) {
                Ok(n) => {
                    to_local.drain(..n);
                    progressed = true;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            }
        }

        if !progressed {
            thread::sleep(POLL_INTERVAL);
        }
    }

    // Best effort; the session is non-blocking and may report EAGAIN here.
    let _ = channel.close();
}
