// Per-context session and failure bookkeeping
use crate::factory::ConnectionFactory;
use crate::server::ServerDescriptor;
use crate::ssh::Session;
use crate::utils::error::{CloseError, ConnectError, TeardownError};
use crate::utils::lock;
use log::{debug, warn};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Open sessions of one execution context, at most one per server.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<ServerDescriptor, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the open session for `server`, dialing through `factory`
    /// only when none exists yet. The lock is not held while dialing, so
    /// different servers connect in parallel.
    pub fn connect(
        &self,
        factory: &dyn ConnectionFactory,
        server: &ServerDescriptor,
    ) -> Result<Arc<Session>, ConnectError> {
        if let Some(existing) = self.get(server) {
            return Ok(existing);
        }

        let session = Arc::new(factory.connect_to(server)?);

        let mut sessions = lock(&self.sessions);
        match sessions.entry(server.clone()) {
            Entry::Occupied(entry) => {
                let existing = Arc::clone(entry.get());
                drop(sessions);
                debug!("Discarding duplicate session to {}", server);
                if let Err(e) = session.close() {
                    debug!("Closing duplicate session to {} failed: {}", server, e);
                }
                Ok(existing)
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&session));
                Ok(session)
            }
        }
    }

    pub fn get(&self, server: &ServerDescriptor) -> Option<Arc<Session>> {
        lock(&self.sessions).get(server).cloned()
    }

    pub fn contains(&self, server: &ServerDescriptor) -> bool {
        lock(&self.sessions).contains_key(server)
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and closes the sessions of `servers`.
    ///
    /// Every server is attempted. Connections the remote already dropped are
    /// ignored; any other close failure is collected and returned once all
    /// sessions were removed.
    pub fn teardown(&self, servers: &[ServerDescriptor]) -> Result<(), TeardownError> {
        let removed: Vec<(ServerDescriptor, Arc<Session>)> = {
            let mut sessions = lock(&self.sessions);
            servers
                .iter()
                .filter_map(|server| sessions.remove_entry(server))
                .collect()
        };
        close_sessions(removed)
    }

    /// Tears down every open session.
    pub fn close_all(&self) -> Result<(), TeardownError> {
        let removed: Vec<_> = lock(&self.sessions).drain().collect();
        close_sessions(removed)
    }
}

fn close_sessions(sessions: Vec<(ServerDescriptor, Arc<Session>)>) -> Result<(), TeardownError> {
    let mut failures = Vec::new();
    for (server, session) in sessions {
        match session.close() {
            Ok(()) => debug!("Closed session to {}", session.target()),
            Err(CloseError::ConnectionDropped) => {
                debug!("Session to {} was already closed by remote", session.target());
            }
            Err(e) => {
                warn!("Failed to close session to {}: {}", session.target(), e);
                failures.push((server, e));
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(TeardownError { failures })
    }
}

/// Servers that failed during the current run. Marks are never cleared.
#[derive(Debug, Default)]
pub struct FailureTracker {
    failed: Mutex<HashSet<ServerDescriptor>>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_failed(&self, server: &ServerDescriptor) {
        if lock(&self.failed).insert(server.clone()) {
            warn!("Marking {} as failed for the rest of this run", server);
        }
    }

    pub fn mark_all<'a, I>(&self, servers: I)
    where
        I: IntoIterator<Item = &'a ServerDescriptor>,
    {
        for server in servers {
            self.mark_failed(server);
        }
    }

    pub fn is_failed(&self, server: &ServerDescriptor) -> bool {
        lock(&self.failed).contains(server)
    }

    pub fn len(&self) -> usize {
        lock(&self.failed).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
