// Command line arguments
use crate::orchestrator::NoMatchPolicy;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ssh-fanout")]
#[command(about = "Run work across many SSH hosts in bounded, gateway-aware batches")]
#[command(version = "0.1.0")]
pub struct Cli {
    /// Inventory file (JSON) listing servers, roles and gateways
    #[arg(short, long)]
    pub inventory: PathBuf,

    /// Only target servers carrying one of these roles (comma separated)
    #[arg(short, long, value_delimiter = ',')]
    pub roles: Vec<String>,

    /// Only target these hosts (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub hosts: Vec<String>,

    /// Maximum number of hosts connected at the same time
    #[arg(short, long)]
    pub max_hosts: Option<usize>,

    /// Run on the first matching server only
    #[arg(long)]
    pub once: bool,

    /// Show the planned batches without connecting
    #[arg(long)]
    pub dry_run: bool,

    /// Keep going on the remaining hosts when some fail
    #[arg(long)]
    pub continue_on_error: bool,

    /// What to do when no server matches
    #[arg(long, value_enum)]
    pub on_no_matching_servers: Option<NoMatchPolicy>,

    /// Gateway chain to tunnel through, e.g. "bastion" or "jump1,jump2".
    /// Repeat to append further hops: `-g jump1 -g jump2,jump3`
    #[arg(short, long)]
    pub gateway: Vec<String>,

    /// Default SSH username
    #[arg(short, long)]
    pub user: Option<String>,

    /// SSH password (if not provided, will prompt for input)
    #[arg(short = 'P', long)]
    pub password: Option<String>,

    /// SSH private key file path
    #[arg(short, long)]
    pub key_file: Option<PathBuf>,

    /// Use SSH agent for authentication
    #[arg(long)]
    pub use_agent: bool,

    /// TCP connect timeout in seconds
    #[arg(long, default_value = "10")]
    pub connect_timeout: u64,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Execute a command on every matching server
    Exec {
        /// Command line to run remotely
        command: String,
    },
    /// Connect to every matching server and disconnect again
    Check,
}
