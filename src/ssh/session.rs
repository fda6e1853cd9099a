// Session: an open connection plus the endpoint it represents
use crate::server::ServerDescriptor;
use crate::ssh::{CommandOutput, Connection};
use crate::utils::error::CloseError;
use anyhow::Result;
use std::fmt;

pub struct Session {
    /// The endpoint actually dialed.
    pub server: ServerDescriptor,
    connection: Box<dyn Connection>,
    /// The real destination when the session was opened through a gateway.
    pub original_target: Option<ServerDescriptor>,
}

impl Session {
    pub fn direct(server: ServerDescriptor, connection: Box<dyn Connection>) -> Self {
        Self {
            server,
            connection,
            original_target: None,
        }
    }

    pub fn tunnelled(
        local: ServerDescriptor,
        connection: Box<dyn Connection>,
        target: ServerDescriptor,
    ) -> Self {
        Self {
            server: local,
            connection,
            original_target: Some(target),
        }
    }

    /// The logical host this session talks to.
    pub fn target(&self) -> &ServerDescriptor {
        self.original_target.as_ref().unwrap_or(&self.server)
    }

    pub fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.connection.exec(command)
    }

    pub fn close(&self) -> std::result::Result<(), CloseError> {
        self.connection.close()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("server", &self.server)
            .field("original_target", &self.original_target)
            .finish_non_exhaustive()
    }
}
