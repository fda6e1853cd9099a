use crate::server::ServerDescriptor;
use thiserror::Error;

/// A single host could not be dialed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to connect to {host}: {reason}")]
pub struct ConnectError {
    pub host: String,
    pub reason: String,
}

impl ConnectError {
    pub fn new(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            reason: reason.into(),
        }
    }

    pub fn for_server(server: &ServerDescriptor, reason: impl Into<String>) -> Self {
        Self::new(server.to_string(), reason)
    }
}

/// One or more hosts of a batch failed to connect.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct ConnectionError {
    pub message: String,
    pub hosts: Vec<ServerDescriptor>,
}

impl ConnectionError {
    pub fn from_failures(failures: &[(ServerDescriptor, ConnectError)]) -> Self {
        let details: Vec<String> = failures.iter().map(|(_, e)| e.to_string()).collect();
        Self {
            message: format!(
                "Connection failed for {} host(s): {}",
                failures.len(),
                details.join("; ")
            ),
            hosts: failures.iter().map(|(server, _)| server.clone()).collect(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct NoMatchingServersError {
    pub message: String,
}

/// Raised by a batch callback when the work failed on specific hosts.
#[derive(Error, Debug, Clone)]
#[error("Remote execution failed on {}: {}", display_hosts(.hosts), .message)]
pub struct RemoteError {
    pub message: String,
    pub hosts: Vec<ServerDescriptor>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>, hosts: Vec<ServerDescriptor>) -> Self {
        Self {
            message: message.into(),
            hosts,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloseError {
    /// The remote side already dropped the connection.
    #[error("Connection already closed by remote")]
    ConnectionDropped,

    #[error("Close failed: {0}")]
    Other(String),
}

#[derive(Error, Debug)]
#[error("Teardown failed for {}", display_failures(.failures))]
pub struct TeardownError {
    pub failures: Vec<(ServerDescriptor, CloseError)>,
}

/// Error returned by a batch callback.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("execute_on_servers called without a callback")]
    MissingCallback,

    #[error(transparent)]
    NoMatchingServers(#[from] NoMatchingServersError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Teardown(#[from] TeardownError),

    #[error("Batch callback failed: {0}")]
    Callback(anyhow::Error),
}

impl From<BatchError> for OrchestratorError {
    fn from(err: BatchError) -> Self {
        match err {
            BatchError::Remote(remote) => OrchestratorError::Remote(remote),
            BatchError::Other(other) => OrchestratorError::Callback(other),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid server address: {0}")]
    InvalidServer(String),

    #[error("Invalid gateway specification: {0}")]
    InvalidGateway(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Inventory parse error: {0}")]
    ParseError(#[from] serde_json::Error),
}

fn display_hosts(hosts: &[ServerDescriptor]) -> String {
    hosts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn display_failures(failures: &[(ServerDescriptor, CloseError)]) -> String {
    failures
        .iter()
        .map(|(server, err)| format!("{server} ({err})"))
        .collect::<Vec<_>>()
        .join(", ")
}
