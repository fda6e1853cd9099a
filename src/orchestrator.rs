// Execution orchestrator: filter, batch, connect, run, tear down
use crate::context::ExecutionContext;
use crate::server::ServerDescriptor;
use crate::utils::error::{
    BatchError, ConnectError, ConnectionError, NoMatchingServersError, OrchestratorError,
};
use clap::ValueEnum;
use crossbeam_channel::unbounded;
use log::{debug, info, warn};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

/// Environment switch downgrading an empty server match to a skip.
pub const SKIP_EMPTY_ENV: &str = "SSH_FANOUT_SKIP_EMPTY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NoMatchPolicy {
    /// Treat an empty match as nothing to do
    Continue,
    /// Fail the run
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub max_hosts: Option<usize>,
    pub once: bool,
    pub dry_run: bool,
    pub on_no_matching_servers: Option<NoMatchPolicy>,
    /// Restricts the run to these host names when non-empty.
    pub host_filter: Vec<String>,
}

/// The unit of work the orchestrator schedules.
pub trait Task {
    fn name(&self) -> &str;

    fn in_scope(&self, server: &ServerDescriptor) -> bool;

    fn continue_on_error(&self) -> bool {
        false
    }

    fn max_hosts(&self) -> Option<usize> {
        None
    }

    fn on_no_matching_servers(&self) -> Option<NoMatchPolicy> {
        None
    }
}

/// A task scoped by server roles. No roles means every server.
#[derive(Debug, Clone, Default)]
pub struct RoleTask {
    pub name: String,
    pub roles: Vec<String>,
    pub continue_on_error: bool,
    pub max_hosts: Option<usize>,
    pub on_no_matching_servers: Option<NoMatchPolicy>,
}

impl RoleTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }

    pub fn max_hosts(mut self, max_hosts: usize) -> Self {
        self.max_hosts = Some(max_hosts);
        self
    }
}

impl Task for RoleTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn in_scope(&self, server: &ServerDescriptor) -> bool {
        self.roles.is_empty() || self.roles.iter().any(|role| server.has_role(role))
    }

    fn continue_on_error(&self) -> bool {
        self.continue_on_error
    }

    fn max_hosts(&self) -> Option<usize> {
        self.max_hosts
    }

    fn on_no_matching_servers(&self) -> Option<NoMatchPolicy> {
        self.on_no_matching_servers
    }
}

/// Resolves which servers a task applies to.
pub trait ServerResolver {
    fn resolve(&self, task: &dyn Task, options: &RunOptions) -> Vec<ServerDescriptor>;
}

/// Static list of known servers.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    servers: Vec<ServerDescriptor>,
}

impl Inventory {
    pub fn new(servers: Vec<ServerDescriptor>) -> Self {
        Self { servers }
    }
}

impl ServerResolver for Inventory {
    fn resolve(&self, task: &dyn Task, options: &RunOptions) -> Vec<ServerDescriptor> {
        let mut seen = HashSet::new();
        self.servers
            .iter()
            .filter(|server| task.in_scope(server))
            .filter(|server| {
                options.host_filter.is_empty() || options.host_filter.contains(&server.host)
            })
            .filter(|server| seen.insert((*server).clone()))
            .cloned()
            .collect()
    }
}

/// Outcome of a connect round that does not raise.
#[derive(Debug, Default)]
pub struct ConnectResult {
    pub succeeded: Vec<ServerDescriptor>,
    pub failed: Vec<(ServerDescriptor, ConnectError)>,
}

impl ConnectResult {
    pub fn into_result(self) -> Result<Vec<ServerDescriptor>, ConnectionError> {
        if self.failed.is_empty() {
            Ok(self.succeeded)
        } else {
            Err(ConnectionError::from_failures(&self.failed))
        }
    }
}

#[derive(Debug, Default)]
pub struct ExecutionSummary {
    pub batches: usize,
    pub succeeded: Vec<ServerDescriptor>,
    pub failed: Vec<ServerDescriptor>,
}

pub type BatchCallback<'a> =
    &'a mut dyn FnMut(&ExecutionContext, &[ServerDescriptor]) -> Result<(), BatchError>;

pub struct Orchestrator {
    resolver: Box<dyn ServerResolver>,
    permissive: bool,
}

impl Orchestrator {
    pub fn new(resolver: Box<dyn ServerResolver>) -> Self {
        Self {
            resolver,
            permissive: permissive_from_env(),
        }
    }

    pub fn with_permissive(mut self, permissive: bool) -> Self {
        self.permissive = permissive;
        self
    }

    pub fn is_permissive(&self) -> bool {
        self.permissive
    }

    /// Servers `task` should run on in this context.
    pub fn filter_servers(
        &self,
        ctx: &ExecutionContext,
        task: &dyn Task,
        options: &RunOptions,
    ) -> Result<Vec<ServerDescriptor>, NoMatchingServersError> {
        let mut servers = self.resolver.resolve(task, options);

        if servers.is_empty() {
            let policy = options
                .on_no_matching_servers
                .or_else(|| task.on_no_matching_servers());
            if self.permissive || policy == Some(NoMatchPolicy::Continue) {
                info!("No servers matched task '{}', skipping", task.name());
                return Ok(servers);
            }
            if options.dry_run {
                info!("No servers matched task '{}' (dry run)", task.name());
                return Ok(servers);
            }
            return Err(NoMatchingServersError {
                message: format!("No servers matched task '{}'", task.name()),
            });
        }

        if task.continue_on_error() {
            let before = servers.len();
            servers.retain(|server| !ctx.failures().is_failed(server));
            let skipped = before - servers.len();
            if skipped > 0 {
                info!(
                    "Skipping {} previously failed host(s) for task '{}'",
                    skipped,
                    task.name()
                );
            }
        }

        if options.once {
            servers.truncate(1);
        }

        Ok(servers)
    }

    /// Connects to every server in parallel and waits for all of them.
    pub fn establish_connections_to(
        &self,
        ctx: &ExecutionContext,
        servers: &[ServerDescriptor],
    ) -> Result<(), ConnectionError> {
        self.establish_connections_partial(ctx, servers)
            .into_result()
            .map(|_| ())
    }

    /// Like `establish_connections_to`, but reports per-server outcomes
    /// instead of raising.
    pub fn establish_connections_partial(
        &self,
        ctx: &ExecutionContext,
        servers: &[ServerDescriptor],
    ) -> ConnectResult {
        // Built here, before any worker exists, so tunnels are opened once.
        let factory = match ctx.factory() {
            Ok(factory) => factory,
            Err(e) => {
                warn!("Could not set up connections: {}", e);
                return ConnectResult {
                    succeeded: Vec::new(),
                    failed: servers.iter().map(|s| (s.clone(), e.clone())).collect(),
                };
            }
        };

        let (tx, rx) = unbounded();
        thread::scope(|scope| {
            for (index, server) in servers.iter().enumerate() {
                let worker_tx = tx.clone();
                let factory = Arc::clone(&factory);
                let sessions = ctx.sessions();
                let spawned = thread::Builder::new()
                    .name(format!("connect-{}", server.host))
                    .spawn_scoped(scope, move || {
                        let outcome = sessions.connect(factory.as_ref(), server).map(|_| ());
                        let _ = worker_tx.send((index, outcome));
                    });
                if let Err(e) = spawned {
                    let _ = tx.send((
                        index,
                        Err(ConnectError::for_server(server, format!("spawn failed: {e}"))),
                    ));
                }
            }
        });
        drop(tx);

        let mut outcomes: Vec<_> = rx.iter().collect();
        outcomes.sort_by_key(|(index, _)| *index);

        let mut result = ConnectResult::default();
        for (index, outcome) in outcomes {
            let server = servers[index].clone();
            match outcome {
                Ok(()) => result.succeeded.push(server),
                Err(e) => {
                    warn!("{}", e);
                    result.failed.push((server, e));
                }
            }
        }
        result
    }

    /// Runs `callback` over the servers in scope for `task`, at most
    /// `max_hosts` of them connected at a time.
    pub fn execute_on_servers(
        &self,
        ctx: &ExecutionContext,
        task: &dyn Task,
        options: &RunOptions,
        callback: Option<BatchCallback<'_>>,
    ) -> Result<ExecutionSummary, OrchestratorError> {
        let callback = callback.ok_or(OrchestratorError::MissingCallback)?;

        let servers = self.filter_servers(ctx, task, options)?;
        let mut summary = ExecutionSummary::default();
        if servers.is_empty() {
            return Ok(summary);
        }

        let max_hosts = batch_size(task, options, servers.len());
        let is_partial = max_hosts < servers.len();
        let tolerate_connect = task.continue_on_error() || options.dry_run;
        info!(
            "Running '{}' on {} host(s), {} at a time",
            task.name(),
            servers.len(),
            max_hosts
        );

        for (index, slice) in batches(&servers, max_hosts).enumerate() {
            debug!("Batch {}: {} host(s)", index + 1, slice.len());
            summary.batches += 1;

            let mut batch = slice.to_vec();
            let connected = self.establish_connections_partial(ctx, &batch);
            if !connected.failed.is_empty() {
                let err = ConnectionError::from_failures(&connected.failed);
                if !tolerate_connect {
                    return Err(err.into());
                }
                warn!("Continuing without {} unreachable host(s)", err.hosts.len());
                ctx.failures().mark_all(&err.hosts);
                batch.retain(|server| !err.hosts.contains(server));
                summary.failed.extend(err.hosts);
            }

            if batch.is_empty() {
                debug!("Batch {} has no reachable hosts left", index + 1);
            } else {
                match callback(ctx, &batch) {
                    Ok(()) => summary.succeeded.extend(batch),
                    Err(BatchError::Remote(err)) if task.continue_on_error() => {
                        warn!("{}", err);
                        ctx.failures().mark_all(&err.hosts);
                        batch.retain(|server| !err.hosts.contains(server));
                        summary.succeeded.extend(batch);
                        summary.failed.extend(err.hosts);
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            if is_partial {
                ctx.sessions().teardown(slice)?;
            }
        }

        Ok(summary)
    }
}

/// Hosts per batch: explicit option, then the task's setting, then all.
pub fn batch_size(task: &dyn Task, options: &RunOptions, total: usize) -> usize {
    options
        .max_hosts
        .or_else(|| task.max_hosts())
        .unwrap_or(total)
        .max(1)
}

/// Consecutive slices of at most `max_hosts`, in order.
pub fn batches(
    servers: &[ServerDescriptor],
    max_hosts: usize,
) -> std::slice::Chunks<'_, ServerDescriptor> {
    servers.chunks(max_hosts.max(1))
}

fn permissive_from_env() -> bool {
    match std::env::var(SKIP_EMPTY_ENV) {
        Ok(value) => {
            let value = value.trim();
            !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false")
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthMethod, ConnectOptions};
    use crate::gateway::GatewaySpec;
    use crate::ssh::{Connection, Transport, TunnelHandle};
    use pretty_assertions::assert_eq;
    use serial_test::serial;

    struct Unreachable;

    impl Transport for Unreachable {
        fn connect(
            &self,
            server: &ServerDescriptor,
            _options: &ConnectOptions,
        ) -> Result<Box<dyn Connection>, ConnectError> {
            Err(ConnectError::for_server(server, "unreachable"))
        }

        fn open_tunnel(
            &self,
            gateway: &ServerDescriptor,
            _options: &ConnectOptions,
        ) -> Result<Arc<dyn TunnelHandle>, ConnectError> {
            Err(ConnectError::for_server(gateway, "unreachable"))
        }
    }

    fn context() -> ExecutionContext {
        ExecutionContext::new(
            Arc::new(Unreachable),
            ConnectOptions::new("deploy", AuthMethod::Agent),
            GatewaySpec::NoGateway,
        )
    }

    fn inventory() -> Orchestrator {
        Orchestrator::new(Box::new(Inventory::new(vec![
            ServerDescriptor::new("web1").with_roles(["web"]),
            ServerDescriptor::new("web2").with_roles(["web"]),
            ServerDescriptor::new("db1").with_roles(["db"]),
            ServerDescriptor::new("web1").with_roles(["web"]),
        ])))
        .with_permissive(false)
    }

    fn hosts(servers: &[ServerDescriptor]) -> Vec<&str> {
        servers.iter().map(|s| s.host.as_str()).collect()
    }

    #[test]
    fn batches_cover_every_server_in_order() {
        let servers: Vec<_> = (0..7)
            .map(|i| ServerDescriptor::new(format!("h{i}")))
            .collect();

        for max in 1..=8 {
            let slices: Vec<_> = batches(&servers, max).collect();
            assert_eq!(slices.len(), servers.len().div_ceil(max));
            assert!(slices.iter().all(|slice| slice.len() <= max));
            let flattened: Vec<_> = slices.concat();
            assert_eq!(flattened, servers);
        }
    }

    #[test]
    fn batch_size_prefers_options_then_task() {
        let task = RoleTask::new("deploy").max_hosts(3);
        let mut options = RunOptions::default();
        assert_eq!(batch_size(&task, &options, 10), 3);

        options.max_hosts = Some(4);
        assert_eq!(batch_size(&task, &options, 10), 4);

        assert_eq!(batch_size(&RoleTask::new("all"), &RunOptions::default(), 10), 10);
        options.max_hosts = Some(0);
        assert_eq!(batch_size(&task, &options, 10), 1);
    }

    #[test]
    fn filter_scopes_by_role_and_dedupes() {
        let ctx = context();
        let task = RoleTask::new("restart").with_roles(["web"]);
        let servers = inventory()
            .filter_servers(&ctx, &task, &RunOptions::default())
            .unwrap();
        assert_eq!(hosts(&servers), vec!["web1", "web2"]);
    }

    #[test]
    fn filter_applies_host_filter_and_once() {
        let ctx = context();
        let task = RoleTask::new("any");
        let options = RunOptions {
            host_filter: vec!["db1".into(), "web2".into()],
            ..RunOptions::default()
        };
        let servers = inventory().filter_servers(&ctx, &task, &options).unwrap();
        assert_eq!(hosts(&servers), vec!["web2", "db1"]);

        let once = RunOptions {
            once: true,
            ..RunOptions::default()
        };
        let servers = inventory().filter_servers(&ctx, &task, &once).unwrap();
        assert_eq!(hosts(&servers), vec!["web1"]);
    }

    #[test]
    fn filter_drops_failed_hosts_only_for_tolerant_tasks() {
        let ctx = context();
        ctx.failures().mark_failed(&ServerDescriptor::new("web1"));

        let strict = RoleTask::new("strict").with_roles(["web"]);
        let servers = inventory()
            .filter_servers(&ctx, &strict, &RunOptions::default())
            .unwrap();
        assert_eq!(hosts(&servers), vec!["web1", "web2"]);

        let tolerant = strict.clone().continue_on_error(true);
        let servers = inventory()
            .filter_servers(&ctx, &tolerant, &RunOptions::default())
            .unwrap();
        assert_eq!(hosts(&servers), vec!["web2"]);
    }

    #[test]
    fn empty_match_policy() {
        let ctx = context();
        let task = RoleTask::new("cron").with_roles(["worker"]);

        let err = inventory()
            .filter_servers(&ctx, &task, &RunOptions::default())
            .unwrap_err();
        assert_eq!(err.message, "No servers matched task 'cron'");

        let tolerant = RunOptions {
            on_no_matching_servers: Some(NoMatchPolicy::Continue),
            ..RunOptions::default()
        };
        assert!(inventory().filter_servers(&ctx, &task, &tolerant).unwrap().is_empty());

        let dry_run = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };
        assert!(inventory().filter_servers(&ctx, &task, &dry_run).unwrap().is_empty());

        let permissive = inventory().with_permissive(true);
        assert!(permissive
            .filter_servers(&ctx, &task, &RunOptions::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn task_level_continue_policy_is_honoured() {
        let ctx = context();
        let task = RoleTask {
            on_no_matching_servers: Some(NoMatchPolicy::Continue),
            ..RoleTask::new("cron").with_roles(["worker"])
        };
        assert!(inventory()
            .filter_servers(&ctx, &task, &RunOptions::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    #[serial]
    fn permissive_switch_reads_environment() {
        std::env::set_var(SKIP_EMPTY_ENV, "1");
        assert!(Orchestrator::new(Box::new(Inventory::default())).is_permissive());

        std::env::set_var(SKIP_EMPTY_ENV, "false");
        assert!(!Orchestrator::new(Box::new(Inventory::default())).is_permissive());

        std::env::remove_var(SKIP_EMPTY_ENV);
        assert!(!Orchestrator::new(Box::new(Inventory::default())).is_permissive());
    }

    #[test]
    fn missing_callback_is_rejected() {
        let ctx = context();
        let err = inventory()
            .execute_on_servers(&ctx, &RoleTask::new("any"), &RunOptions::default(), None)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::MissingCallback));
    }
}
