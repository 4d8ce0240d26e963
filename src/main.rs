//! Sharedlock CLI - inspect lock registries and run commands under a named lock

mod ui;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use sharedlock::config::{self, Backend, SharedLockConfig};
use sharedlock::{LockCoordinator, QuoteStyle};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "sharedlock")]
#[command(version)]
#[command(about = "Named, TTL-bounded locks shared through a relational database")]
#[command(long_about = r#"
Sharedlock serializes work across processes that share one database:
  • a registry table decides who owns a lock name
  • the database's native session locks detect dead owners
  • every lock expires after its TTL

Example usage:
  sharedlock init --backend mysql --database app --username locker
  sharedlock run nightly-import --timeout 30 --ttl 600 -- ./import.sh
  sharedlock list
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file
    #[arg(short, long, global = true, default_value = "sharedlock.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Sqlite,
    Mysql,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file and create the registry table
    Init {
        #[arg(long, value_enum, default_value = "sqlite")]
        backend: BackendArg,

        /// Database name, or the database file for sqlite
        #[arg(short, long)]
        database: Option<String>,

        #[arg(long, default_value = "localhost")]
        host: String,

        #[arg(long)]
        port: Option<u16>,

        #[arg(short, long, default_value = "")]
        username: String,

        /// Password (prefer the SHAREDLOCK_PASSWORD environment variable)
        #[arg(long, env = "SHAREDLOCK_PASSWORD", default_value = "", hide_env_values = true)]
        password: String,

        /// Registry table name
        #[arg(short, long, default_value = sharedlock::registry::DEFAULT_TABLE)]
        table: String,

        /// Quote identifiers with ANSI double quotes instead of backticks
        #[arg(long)]
        ansi_quotes: bool,

        /// Overwrite an existing config file
        #[arg(short, long)]
        force: bool,
    },

    /// List the lock records in the registry
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Repair the registry table
    Repair,

    /// Run a command while holding a lock
    Run {
        /// Lock name
        name: String,

        /// Seconds to wait for the lock
        #[arg(short, long, default_value = "10")]
        timeout: f64,

        /// Seconds the lock is claimed for
        #[arg(long, default_value = "60")]
        ttl: u64,

        /// Command and its arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Init {
            backend,
            database,
            host,
            port,
            username,
            password,
            table,
            ansi_quotes,
            force,
        } => {
            let mut cfg = SharedLockConfig {
                backend: match backend {
                    BackendArg::Sqlite => Backend::Sqlite,
                    BackendArg::Mysql => Backend::Mysql,
                },
                table,
                quote_style: if ansi_quotes { QuoteStyle::Ansi } else { QuoteStyle::Backtick },
                ..SharedLockConfig::default()
            };
            cfg.connection.host = host;
            cfg.connection.port = port;
            cfg.connection.username = username;
            cfg.connection.password = password;
            if let Some(database) = database {
                cfg.connection.database = database;
            }
            cfg.validate()?;

            config::write_config(&cli.config, &cfg, force)?;
            ui::config_written(&cli.config);

            let locks = LockCoordinator::from_config(&cfg)?;
            locks.ensure_table()?;
            ui::initialized(&cfg.table, &cfg.connection.database);
        }

        Commands::List { json } => {
            let cfg = load(&cli.config)?;
            let locks = LockCoordinator::from_config(&cfg)?;
            let records = locks.records()?;

            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                ui::registry_empty(&cfg.table);
            } else {
                ui::registry_heading(records.len(), &cfg.table);
                println!("{}", ui::records_table(&records, unix_now()));
            }
        }

        Commands::Repair => {
            let cfg = load(&cli.config)?;
            let locks = LockCoordinator::from_config(&cfg)?;
            ui::repairing(&cfg.table);
            locks.repair_table()?;
            ui::repaired();
        }

        Commands::Run { name, timeout, ttl, command } => {
            let cfg = load(&cli.config)?;
            if cfg.backend == Backend::Sqlite {
                tracing::debug!(
                    "sqlite backend: locks are shared by the processes of this host through {}",
                    cfg.connection.database
                );
            }
            let code = run_locked(&cfg, &name, timeout, ttl, &command)?;
            std::process::exit(code);
        }
    }

    Ok(())
}

fn load(path: &Path) -> anyhow::Result<SharedLockConfig> {
    match config::load_config(Some(path))? {
        Some(cfg) => Ok(cfg),
        None => {
            ui::config_missing(path);
            Ok(SharedLockConfig::default())
        }
    }
}

/// Hold `name` while `command` runs; returns the command's exit code
fn run_locked(
    cfg: &SharedLockConfig,
    name: &str,
    timeout: f64,
    ttl: u64,
    command: &[String],
) -> anyhow::Result<i32> {
    let (program, args) = command.split_first().context("no command given")?;
    let timeout = Duration::try_from_secs_f64(timeout).context("invalid timeout")?;

    let locks = LockCoordinator::from_config(cfg)?;
    let waited = Instant::now();
    let handle = locks.lock(name, timeout, ttl)?;
    ui::acquired(name, waited.elapsed(), ttl);

    let status = Command::new(program).args(args).status();

    // release even if the command could not be started
    let released = handle.release();
    let status = status.with_context(|| format!("failed to run {}", program))?;
    match released {
        Ok(()) => ui::released(name),
        Err(err) => {
            ui::release_failed(&err);
            return Ok(status.code().filter(|code| *code != 0).unwrap_or(1));
        }
    }

    if let Some(code) = status.code() {
        ui::exit_status(code);
    }
    Ok(status.code().unwrap_or(1))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
