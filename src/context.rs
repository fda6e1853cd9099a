// Execution context: everything one run of the orchestrator owns
use crate::config::ConnectOptions;
use crate::factory::{build_factory, ConnectionFactory};
use crate::gateway::GatewaySpec;
use crate::registry::{FailureTracker, SessionRegistry};
use crate::ssh::Transport;
use crate::utils::error::{ConnectError, TeardownError};
use crate::utils::lock;
use log::warn;
use std::sync::{Arc, Mutex};

/// Session and failure state for one execution, passed explicitly to every
/// orchestrator call. Independent runs each own their own context.
pub struct ExecutionContext {
    transport: Arc<dyn Transport>,
    options: ConnectOptions,
    gateway: GatewaySpec,
    factory: Mutex<Option<Arc<dyn ConnectionFactory>>>,
    sessions: SessionRegistry,
    failures: FailureTracker,
}

impl ExecutionContext {
    pub fn new(
        transport: Arc<dyn Transport>,
        options: ConnectOptions,
        gateway: GatewaySpec,
    ) -> Self {
        Self {
            transport,
            options,
            gateway,
            factory: Mutex::new(None),
            sessions: SessionRegistry::new(),
            failures: FailureTracker::new(),
        }
    }

    /// Returns the connection factory, building it on first use.
    ///
    /// The lock is held for the whole build so gateway tunnels are opened
    /// exactly once per context. A failed build is not cached.
    pub fn factory(&self) -> Result<Arc<dyn ConnectionFactory>, ConnectError> {
        let mut slot = lock(&self.factory);
        if let Some(factory) = slot.as_ref() {
            return Ok(Arc::clone(factory));
        }
        let factory = build_factory(&self.gateway, Arc::clone(&self.transport), self.options.clone())?;
        *slot = Some(Arc::clone(&factory));
        Ok(factory)
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn failures(&self) -> &FailureTracker {
        &self.failures
    }

    /// Tears down every session still open in this context.
    pub fn close_all(&self) -> Result<(), TeardownError> {
        self.sessions.close_all()
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        if let Err(e) = self.sessions.close_all() {
            warn!("{}", e);
        }
    }
}
