use anyhow::Result;
use clap::Parser;
use ssh_fanout::{cli::Cli, config::Config, run};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    println!("ssh-fanout v0.1.0");
    println!("Inventory: {}", cli.inventory.display());

    let config = Config::from_cli(&cli)?;

    match run(config) {
        Ok(_) => {
            println!("\n✅ Completed successfully!\n");
        }
        Err(e) => {
            eprintln!("\n❌ Run failed: {:#}\n", e);
            std::process::exit(1);
        }
    }

    Ok(())
}
