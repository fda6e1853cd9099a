//! Shared test utilities for integration tests.
//!
//! `MockTransport` stands in for libssh2: it hands out forwarded ports,
//! records every dial, tunnel, forward and close in order, and can be told
//! which hosts are unreachable.

#![allow(dead_code)]

use ssh_fanout::config::{AuthMethod, ConnectOptions};
use ssh_fanout::context::ExecutionContext;
use ssh_fanout::gateway::GatewaySpec;
use ssh_fanout::orchestrator::{Inventory, Orchestrator};
use ssh_fanout::server::{ServerDescriptor, LOOPBACK};
use ssh_fanout::ssh::{CommandOutput, Connection, Transport, TunnelHandle};
use ssh_fanout::utils::error::{CloseError, ConnectError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

pub const FIRST_FORWARD_PORT: u16 = 40000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Gateway tunnel `id` opened by dialing `endpoint`, which reaches `host`.
    Tunnel {
        id: usize,
        host: String,
        endpoint: String,
    },
    /// Tunnel `via` forwarded `local_port` to `target:port`.
    Forward {
        via: usize,
        target: String,
        port: u16,
        local_port: u16,
    },
    /// Full session dialed at `endpoint`, which reaches `target`.
    Dial { endpoint: String, target: String },
    Close { target: String },
}

#[derive(Default)]
struct State {
    events: Vec<Event>,
    forwards: HashMap<u16, String>,
    next_port: u16,
    next_tunnel: usize,
    open: usize,
    peak_open: usize,
    unreachable: HashSet<String>,
    drop_on_close: HashSet<String>,
    failing_commands: HashSet<String>,
    dropped_tunnels: Vec<String>,
}

impl State {
    /// The real host behind `server`, following forwarded loopback ports.
    fn resolve(&self, server: &ServerDescriptor) -> String {
        if server.host == LOOPBACK {
            if let Some(target) = server.port.and_then(|port| self.forwards.get(&port)) {
                return target.clone();
            }
        }
        server.host.clone()
    }
}

pub struct MockTransport {
    state: Arc<Mutex<State>>,
    dial_delay: Duration,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                next_port: FIRST_FORWARD_PORT,
                ..State::default()
            })),
            dial_delay: Duration::from_millis(5),
        }
    }

    pub fn unreachable(self, hosts: &[&str]) -> Self {
        self.lock()
            .unreachable
            .extend(hosts.iter().map(|h| h.to_string()));
        self
    }

    pub fn drops_on_close(self, hosts: &[&str]) -> Self {
        self.lock()
            .drop_on_close
            .extend(hosts.iter().map(|h| h.to_string()));
        self
    }

    pub fn failing_commands_on(self, hosts: &[&str]) -> Self {
        self.lock()
            .failing_commands
            .extend(hosts.iter().map(|h| h.to_string()));
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    /// Targets of full-session dials, in dial order.
    pub fn dials(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Dial { target, .. } => Some(target),
                _ => None,
            })
            .collect()
    }

    pub fn closes(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Close { target } => Some(target),
                _ => None,
            })
            .collect()
    }

    pub fn tunnel_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Tunnel { .. }))
            .count()
    }

    /// Gateways whose tunnels have been released, in drop order.
    pub fn dropped_tunnels(&self) -> Vec<String> {
        self.lock().dropped_tunnels.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().open
    }

    pub fn peak_open(&self) -> usize {
        self.lock().peak_open
    }
}

impl Transport for MockTransport {
    fn connect(
        &self,
        server: &ServerDescriptor,
        _options: &ConnectOptions,
    ) -> Result<Box<dyn Connection>, ConnectError> {
        thread::sleep(self.dial_delay);
        let mut state = self.lock();
        let target = state.resolve(server);
        state.events.push(Event::Dial {
            endpoint: server.to_string(),
            target: target.clone(),
        });
        if state.unreachable.contains(&target) {
            return Err(ConnectError::for_server(server, "connection refused"));
        }
        state.open += 1;
        state.peak_open = state.peak_open.max(state.open);
        Ok(Box::new(MockConnection {
            target,
            state: Arc::clone(&self.state),
        }))
    }

    fn open_tunnel(
        &self,
        gateway: &ServerDescriptor,
        _options: &ConnectOptions,
    ) -> Result<Arc<dyn TunnelHandle>, ConnectError> {
        let mut state = self.lock();
        let host = state.resolve(gateway);
        if state.unreachable.contains(&host) {
            return Err(ConnectError::for_server(gateway, "connection refused"));
        }
        let id = state.next_tunnel;
        state.next_tunnel += 1;
        state.events.push(Event::Tunnel {
            id,
            host: host.clone(),
            endpoint: gateway.to_string(),
        });
        Ok(Arc::new(MockTunnel {
            id,
            host,
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockTunnel {
    id: usize,
    host: String,
    state: Arc<Mutex<State>>,
}

impl Drop for MockTunnel {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.dropped_tunnels.push(self.host.clone());
        }
    }
}

impl TunnelHandle for MockTunnel {
    fn open(&self, host: &str, port: u16) -> Result<u16, ConnectError> {
        let mut state = self.state.lock().unwrap();
        let local_port = state.next_port;
        state.next_port += 1;
        state.forwards.insert(local_port, host.to_string());
        state.events.push(Event::Forward {
            via: self.id,
            target: host.to_string(),
            port,
            local_port,
        });
        Ok(local_port)
    }
}

struct MockConnection {
    target: String,
    state: Arc<Mutex<State>>,
}

impl Connection for MockConnection {
    fn exec(&self, command: &str) -> anyhow::Result<CommandOutput> {
        let state = self.state.lock().unwrap();
        let exit_status = if state.failing_commands.contains(&self.target) {
            1
        } else {
            0
        };
        Ok(CommandOutput {
            stdout: format!("{} on {}\n", command, self.target),
            exit_status,
        })
    }

    fn close(&self) -> Result<(), CloseError> {
        let mut state = self.state.lock().unwrap();
        state.open -= 1;
        state.events.push(Event::Close {
            target: self.target.clone(),
        });
        if state.drop_on_close.contains(&self.target) {
            Err(CloseError::ConnectionDropped)
        } else {
            Ok(())
        }
    }
}

pub fn servers(hosts: &[&str]) -> Vec<ServerDescriptor> {
    hosts.iter().map(|h| ServerDescriptor::new(*h)).collect()
}

pub fn hosts(servers: &[ServerDescriptor]) -> Vec<String> {
    servers.iter().map(|s| s.host.clone()).collect()
}

pub fn context(transport: &Arc<MockTransport>, gateway: GatewaySpec) -> ExecutionContext {
    let transport: Arc<dyn Transport> = transport.clone();
    ExecutionContext::new(
        transport,
        ConnectOptions::new("deploy", AuthMethod::Agent),
        gateway,
    )
}

pub fn orchestrator(servers: Vec<ServerDescriptor>) -> Orchestrator {
    Orchestrator::new(Box::new(Inventory::new(servers))).with_permissive(false)
}
