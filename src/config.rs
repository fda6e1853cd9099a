// Configuration: inventory file merged with command line flags
use crate::cli::{Cli, Commands};
use crate::gateway::{GatewayConfig, GatewaySpec};
use crate::orchestrator::{NoMatchPolicy, RunOptions};
use crate::server::ServerDescriptor;
use crate::utils::error::ConfigError;
use anyhow::{Context, Result};
use dialoguer::{Confirm, Password};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum AuthMethod {
    Password(String),
    PublicKey(PathBuf),
    Agent,
}

/// Options handed to every dial, gateways included.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub default_user: String,
    pub auth: AuthMethod,
    pub timeout: Option<Duration>,
}

impl ConnectOptions {
    pub fn new(default_user: impl Into<String>, auth: AuthMethod) -> Self {
        Self {
            default_user: default_user.into(),
            auth,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ServerEntry {
    Address(String),
    Detailed {
        host: String,
        user: Option<String>,
        port: Option<u16>,
        #[serde(default)]
        roles: Vec<String>,
    },
}

impl ServerEntry {
    fn into_descriptor(self) -> Result<ServerDescriptor, ConfigError> {
        match self {
            ServerEntry::Address(address) => ServerDescriptor::parse(&address),
            ServerEntry::Detailed {
                host,
                user,
                port,
                roles,
            } => {
                let mut server = ServerDescriptor::parse(&host)?;
                server.user = user.or(server.user);
                server.port = port.or(server.port);
                Ok(server.with_roles(roles))
            }
        }
    }
}

/// On-disk inventory.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct InventoryFile {
    #[serde(default)]
    servers: Vec<ServerEntry>,
    #[serde(default)]
    gateway: Option<GatewayConfig>,
    #[serde(default)]
    pub max_hosts: Option<usize>,
    #[serde(default)]
    pub on_no_matching_servers: Option<NoMatchPolicy>,
}

impl InventoryFile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn servers(&self) -> Result<Vec<ServerDescriptor>, ConfigError> {
        self.servers
            .iter()
            .cloned()
            .map(ServerEntry::into_descriptor)
            .collect()
    }

    pub fn gateway(&self) -> Result<GatewaySpec, ConfigError> {
        match &self.gateway {
            Some(config) => GatewaySpec::from_config(config),
            None => Ok(GatewaySpec::NoGateway),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub servers: Vec<ServerDescriptor>,
    pub gateway: GatewaySpec,
    pub connect: ConnectOptions,
    pub run: RunOptions,
    pub roles: Vec<String>,
    pub continue_on_error: bool,
    pub command: Commands,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let inventory = InventoryFile::load(&cli.inventory)
            .with_context(|| format!("Failed to load inventory {}", cli.inventory.display()))?;
        let servers = inventory.servers().context("Invalid server in inventory")?;

        // A chain on the command line overrides the inventory's gateway.
        let gateway = match Self::gateway_from_cli(&cli.gateway).context("Invalid --gateway")? {
            Some(spec) => spec,
            None => inventory.gateway().context("Invalid gateway in inventory")?,
        };

        let default_user = match &cli.user {
            Some(user) => user.clone(),
            None => std::env::var("USER").unwrap_or_else(|_| "root".to_string()),
        };
        // Dry runs never dial, so don't prompt for credentials.
        let auth = if cli.dry_run {
            AuthMethod::Agent
        } else {
            Self::determine_auth_method(cli, &default_user)?
        };

        let run = RunOptions {
            max_hosts: cli.max_hosts.or(inventory.max_hosts),
            once: cli.once,
            dry_run: cli.dry_run,
            on_no_matching_servers: cli.on_no_matching_servers.or(inventory.on_no_matching_servers),
            host_filter: cli.hosts.clone(),
        };

        Ok(Config {
            servers,
            gateway,
            connect: ConnectOptions {
                default_user,
                auth,
                timeout: Some(Duration::from_secs(cli.connect_timeout)).filter(|t| !t.is_zero()),
            },
            run,
            roles: cli.roles.clone(),
            continue_on_error: cli.continue_on_error,
            command: cli.command.clone(),
        })
    }

    /// Joins repeated `--gateway` values into one chain, in order.
    fn gateway_from_cli(values: &[String]) -> Result<Option<GatewaySpec>, ConfigError> {
        if values.is_empty() {
            return Ok(None);
        }
        let spec = GatewaySpec::from_config(&GatewayConfig::Single(values.join(",")))?;
        Ok(Some(spec))
    }

    fn determine_auth_method(cli: &Cli, username: &str) -> Result<AuthMethod> {
        if let Some(password) = &cli.password {
            return Ok(AuthMethod::Password(password.clone()));
        }

        if cli.use_agent {
            return Ok(AuthMethod::Agent);
        }

        if let Some(key_file) = &cli.key_file {
            return Ok(AuthMethod::PublicKey(key_file.clone()));
        }

        let home = home::home_dir().context("Cannot determine home directory")?;
        let ssh_dir = home.join(".ssh");

        let key_files = ["id_rsa", "id_ed25519", "id_ecdsa"];
        for key_name in &key_files {
            let key_path = ssh_dir.join(key_name);
            if key_path.exists() {
                println!("Found SSH key: {}", key_path.display());
                let use_key = Confirm::new()
                    .with_prompt(format!("Use SSH key {} for authentication?", key_path.display()))
                    .default(true)
                    .interact()?;

                if use_key {
                    return Ok(AuthMethod::PublicKey(key_path));
                }
            }
        }

        println!("No SSH key found or selected.");
        let password = Password::new()
            .with_prompt(format!("Enter password for {}", username))
            .interact()?;

        Ok(AuthMethod::Password(password))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayRoute;
    use clap::Parser;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const INVENTORY: &str = r#"{
        "servers": [
            "deploy@web1:2222",
            {"host": "web2", "roles": ["web"]},
            {"host": "db1", "user": "postgres", "roles": ["db"]}
        ],
        "gateway": {"bastion": ["db1"], "jump1,jump2": ["web2"]},
        "max_hosts": 2,
        "on_no_matching_servers": "continue"
    }"#;

    #[test]
    fn loads_inventory_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(INVENTORY.as_bytes()).unwrap();

        let inventory = InventoryFile::load(file.path()).unwrap();
        let servers = inventory.servers().unwrap();

        assert_eq!(servers.len(), 3);
        assert_eq!(servers[0], ServerDescriptor::parse("deploy@web1:2222").unwrap());
        assert!(servers[1].has_role("web"));
        assert_eq!(servers[2].user.as_deref(), Some("postgres"));
        assert_eq!(inventory.max_hosts, Some(2));
        assert_eq!(inventory.on_no_matching_servers, Some(NoMatchPolicy::Continue));
    }

    #[test]
    fn resolves_gateway_mapping_once() {
        let inventory = InventoryFile::from_json(INVENTORY).unwrap();
        assert_eq!(
            inventory.gateway().unwrap(),
            GatewaySpec::MultiGateway(vec![
                GatewayRoute {
                    chain: vec![ServerDescriptor::new("bastion")],
                    hosts: vec!["db1".into()],
                },
                GatewayRoute {
                    chain: vec![ServerDescriptor::new("jump1"), ServerDescriptor::new("jump2")],
                    hosts: vec!["web2".into()],
                },
            ])
        );
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let inventory = InventoryFile::from_json("{}").unwrap();
        assert!(inventory.servers().unwrap().is_empty());
        assert!(inventory.gateway().unwrap().is_none());
        assert_eq!(inventory.max_hosts, None);
    }

    #[test]
    fn repeated_gateway_flags_form_one_chain() {
        let values = vec!["jump1".to_string(), "ops@jump2:2200,jump3".to_string()];
        assert_eq!(
            Config::gateway_from_cli(&values).unwrap(),
            Some(GatewaySpec::SingleChain(vec![
                ServerDescriptor::new("jump1"),
                ServerDescriptor::parse("ops@jump2:2200").unwrap(),
                ServerDescriptor::new("jump3"),
            ]))
        );
        assert_eq!(Config::gateway_from_cli(&[]).unwrap(), None);
    }

    #[test]
    fn command_line_gateway_overrides_inventory() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(INVENTORY.as_bytes()).unwrap();
        let path = file.path().to_str().unwrap();

        let cli = Cli::try_parse_from([
            "ssh-fanout", "-i", path, "-g", "edge", "--dry-run", "check",
        ])
        .unwrap();
        let config = Config::from_cli(&cli).unwrap();

        assert_eq!(
            config.gateway,
            GatewaySpec::SingleChain(vec![ServerDescriptor::new("edge")])
        );
    }

    #[test]
    fn dry_run_resolves_without_prompting() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(INVENTORY.as_bytes()).unwrap();
        let path = file.path().to_str().unwrap();

        let cli = Cli::try_parse_from(["ssh-fanout", "-i", path, "--dry-run", "check"]).unwrap();
        let config = Config::from_cli(&cli).unwrap();

        assert!(matches!(config.connect.auth, AuthMethod::Agent));
        assert!(config.run.dry_run);
        assert_eq!(config.servers.len(), 3);
    }

    #[test]
    fn reports_bad_json() {
        assert!(matches!(
            InventoryFile::from_json("{\"servers\": 3}"),
            Err(ConfigError::ParseError(_))
        ));
        assert!(matches!(
            InventoryFile::load("/nonexistent/inventory.json"),
            Err(ConfigError::IoError(_))
        ));
    }
}
