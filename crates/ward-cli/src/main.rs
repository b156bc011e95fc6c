//! ward: permission checks and execution plans for agent tool calls.

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands, ConfigAction};
use tracing_subscriber::EnvFilter;
use ward_core::ConfigStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("ward=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config_store = match &cli.config {
        Some(path) => ConfigStore::at(path.clone()),
        None => ConfigStore::new(),
    };
    let mut config = config_store.load();
    cli.apply_overrides(&mut config);

    match cli.command {
        Commands::Check {
            ref tool,
            ref args,
            json,
        } => {
            commands::check::run(&config, tool, args, json).await?;
        }
        Commands::Rules { action } => commands::rules::run(&config, action)?,
        Commands::Plan {
            ref file,
            yes,
            parallel,
            json,
        } => {
            let options = commands::plan::PlanOptions {
                approve: yes,
                parallel,
                json,
            };
            let status = commands::plan::run(&config, file, options).await?;
            let code = commands::plan::exit_code(status);
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Tools { ref name } => commands::tools::run(&config, name.as_deref())?,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("# {}", config_store.path().display());
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Init { force } => {
                if config_store.path().exists() && !force {
                    println!(
                        "Config already exists at {} (use --force to overwrite)",
                        config_store.path().display()
                    );
                } else {
                    config_store.save(&ward_core::Config::default())?;
                    println!("Wrote {}", config_store.path().display());
                }
            }
        },
    }

    Ok(())
}
