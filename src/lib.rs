// Library entry: module exports and the CLI run loop
pub mod cli;
pub mod config;
pub mod context;
pub mod factory;
pub mod gateway;
pub mod orchestrator;
pub mod registry;
pub mod server;
pub mod ssh;
pub mod utils;

use anyhow::{anyhow, Result};
use cli::Commands;
use config::Config;
use context::ExecutionContext;
use orchestrator::{
    batch_size, batches, BatchCallback, Inventory, Orchestrator, RoleTask, RunOptions,
};
use server::ServerDescriptor;
use ssh::Ssh2Transport;
use std::sync::Arc;
use utils::error::{BatchError, RemoteError};

pub fn run(config: Config) -> Result<()> {
    let orchestrator = Orchestrator::new(Box::new(Inventory::new(config.servers.clone())));
    let task = RoleTask {
        name: match &config.command {
            Commands::Exec { command } => command.clone(),
            Commands::Check => "check".to_string(),
        },
        roles: config.roles.clone(),
        continue_on_error: config.continue_on_error,
        ..RoleTask::default()
    };
    let ctx = ExecutionContext::new(
        Arc::new(Ssh2Transport),
        config.connect.clone(),
        config.gateway.clone(),
    );

    if config.run.dry_run {
        return print_plan(&orchestrator, &ctx, &task, &config.run);
    }

    let mut callback = |ctx: &ExecutionContext, batch: &[ServerDescriptor]| match &config.command {
        Commands::Exec { command } => run_command(ctx, batch, command),
        Commands::Check => {
            for server in batch {
                println!("[{}] connected", server);
            }
            Ok(())
        }
    };

    let outcome = orchestrator.execute_on_servers(
        &ctx,
        &task,
        &config.run,
        Some(&mut callback as BatchCallback<'_>),
    );
    let teardown = ctx.close_all();
    let summary = outcome?;
    teardown?;

    println!(
        "\n{} host(s) succeeded, {} failed, {} batch(es)",
        summary.succeeded.len(),
        summary.failed.len(),
        summary.batches
    );
    if summary.failed.is_empty() {
        Ok(())
    } else {
        let failed: Vec<String> = summary.failed.iter().map(ToString::to_string).collect();
        Err(anyhow!("Failed hosts: {}", failed.join(", ")))
    }
}

fn run_command(
    ctx: &ExecutionContext,
    batch: &[ServerDescriptor],
    command: &str,
) -> Result<(), BatchError> {
    let mut failed = Vec::new();
    for server in batch {
        let Some(session) = ctx.sessions().get(server) else {
            eprintln!("[{}] no open session", server);
            failed.push(server.clone());
            continue;
        };
        match session.exec(command) {
            Ok(output) => {
                for line in output.stdout.lines() {
                    println!("[{}] {}", session.target(), line);
                }
                if !output.success() {
                    eprintln!("[{}] exited with status {}", session.target(), output.exit_status);
                    failed.push(server.clone());
                }
            }
            Err(e) => {
                eprintln!("[{}] {:#}", session.target(), e);
                failed.push(server.clone());
            }
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(RemoteError::new(format!("`{}` failed", command), failed).into())
    }
}

fn print_plan(
    orchestrator: &Orchestrator,
    ctx: &ExecutionContext,
    task: &RoleTask,
    options: &RunOptions,
) -> Result<()> {
    let servers = orchestrator.filter_servers(ctx, task, options)?;
    if servers.is_empty() {
        println!("No servers matched, nothing to do");
        return Ok(());
    }
    let max_hosts = batch_size(task, options, servers.len());
    for (index, slice) in batches(&servers, max_hosts).enumerate() {
        let hosts: Vec<String> = slice.iter().map(ToString::to_string).collect();
        println!("Batch {}: {}", index + 1, hosts.join(", "));
    }
    Ok(())
}
