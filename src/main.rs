// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use ragserve::config::{default_config_path, Config};
use ragserve::drivers::DriverPool;
use ragserve::server::{Server, API_BASE};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Configuration error
    pub const CONFIG: i32 = 78;
}

/// ragserve - session-scoped retrieval-augmented prompting service.
#[derive(Parser)]
#[command(name = "ragserve")]
#[command(version = VERSION)]
#[command(about = "Session-scoped RAG prompting over a pool of model backends.")]
#[command(long_about = "ragserve - session-scoped RAG prompting service\n\n\
    Start the server:    ragserve (or: ragserve serve --port 4321)\n\
    Show config:         ragserve config show\n\
    Inspect backends:    ragserve drivers list\n\
    Free stuck backends: ragserve drivers reset")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (defaults to ~/.ragserve/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Verbose mode: debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server (default)
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Address to bind to
        #[arg(short, long, value_name = "ADDR")]
        bind: Option<String>,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Inspect or repair the backend pool
    Drivers {
        #[command(subcommand)]
        command: DriversCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration (secrets masked)
    Show,
    /// Print the default config file location
    Path,
}

#[derive(Subcommand)]
enum DriversCommands {
    /// List every backend descriptor
    List,
    /// Mark every backend idle
    Reset,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn serve(config: Config, port: Option<u16>, bind: Option<String>) -> Result<()> {
    let mut server = Server::new(config);
    if let Some(port) = port {
        server = server.with_port(port);
    }
    if let Some(bind) = bind {
        server = server.with_bind_address(bind);
    }

    println!(
        "{} ragserve v{} on port {} (API under {})",
        "[✓]".green(),
        VERSION,
        server.port(),
        API_BASE
    );

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(server.start())
}

fn list_drivers(config: &Config) -> Result<()> {
    let pool = DriverPool::open(&config.llm_drivers_db_path).with_context(|| {
        format!(
            "Failed to open driver pool at {}",
            config.llm_drivers_db_path.display()
        )
    })?;
    let descriptors = pool.descriptors()?;
    if descriptors.is_empty() {
        println!(
            "{} No drivers registered yet; they are seeded on first start.",
            "[!]".yellow()
        );
        return Ok(());
    }

    println!("{}", format!("{:<4} {:<8} {:<6} URI", "ID", "TYPE", "STATE").bold());
    for d in descriptors {
        let state = if d.idle {
            format!("{:<6}", "idle").green()
        } else {
            format!("{:<6}", "busy").yellow()
        };
        println!("{:<4} {:<8} {} {}", d.id, d.kind.as_str(), state, d.uri);
    }
    Ok(())
}

fn reset_drivers(config: &Config) -> Result<()> {
    let pool = DriverPool::open(&config.llm_drivers_db_path)?;
    let cleared = pool.reset_all()?;
    println!("{} Marked {} busy driver(s) idle", "[✓]".green(), cleared);
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    if let Some(Commands::Config {
        command: ConfigCommands::Path,
    }) = &cli.command
    {
        println!("{}", default_config_path()?.display());
        return Ok(());
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} Invalid configuration: {:#}", "[✗]".red(), e);
            std::process::exit(exit_codes::CONFIG);
        }
    };

    match cli.command {
        None => serve(config, None, None),
        Some(Commands::Serve { port, bind }) => serve(config, port, bind),
        Some(Commands::Config { command }) => match command {
            ConfigCommands::Show => {
                println!("{}", config.to_display_json()?);
                Ok(())
            }
            ConfigCommands::Path => Ok(()),
        },
        Some(Commands::Drivers { command }) => match command {
            DriversCommands::List => list_drivers(&config),
            DriversCommands::Reset => reset_drivers(&config),
        },
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("{} {:#}", "[✗]".red(), e);
        std::process::exit(exit_codes::ERROR);
    }
}
