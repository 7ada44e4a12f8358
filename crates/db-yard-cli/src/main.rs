//! db-yard - turn database files on disk into running local services.
//!
//! CLI entry point: one-shot materialization, the watch loop, ledger
//! listing, tagged-process listing, kill, and reverse-proxy config
//! generation.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;

/// db-yard - file-driven process supervisor
#[derive(Parser, Debug)]
#[command(name = "db-yard")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Root directory to discover database files under (repeatable)
    #[arg(long = "cargo-home", global = true)]
    cargo_home: Vec<PathBuf>,

    /// Ledger root holding session state
    #[arg(long = "spawn-state-home", global = true, default_value = ".db-yard")]
    spawn_state_home: PathBuf,

    /// Override the default glob set (repeatable)
    #[arg(long = "watch", global = true)]
    watch_globs: Vec<String>,

    /// Bind host for children
    #[arg(long, global = true, default_value = "127.0.0.1")]
    listen: String,

    /// Periodic full reconcile interval in milliseconds
    #[arg(long = "reconcile-ms", global = true, default_value = "3000")]
    reconcile_ms: u64,

    /// Allow reconciliation over records owned by a different token
    #[arg(long = "adopt-foreign-state", global = true)]
    adopt_foreign_state: bool,

    /// Event verbosity
    #[arg(long, global = true, value_enum, default_value = "essential")]
    verbose: Verbosity,

    /// Bind the admin HTTP surface to this port
    #[arg(long = "admin-port", global = true)]
    admin_port: Option<u16>,

    /// Bind the admin HTTP surface to this host
    #[arg(long = "admin-host", global = true, default_value = "127.0.0.1")]
    admin_host: String,

    /// Terminate all owned pids on exit
    #[arg(long = "kill-all-on-exit", global = true)]
    kill_all_on_exit: bool,

    /// Enable the unsafe ad-hoc SQL admin endpoint
    #[arg(long = "enable-sql-endpoint", global = true)]
    enable_sql_endpoint: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Verbosity {
    /// Lifecycle events only
    Essential,
    /// Every reconciliation detail
    Comprehensive,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// One-shot: discover, spawn, write manifests, exit
    Start,

    /// Supervisor loop: watch roots and reconcile until a signal arrives
    Watch,

    /// List services recorded in a spawned-state home
    Ls {
        /// Emit JSON instead of text lines
        #[arg(long)]
        json: bool,
    },

    /// List processes tagged as owned by db-yard
    Ps {
        /// Emit JSON instead of text lines
        #[arg(long)]
        json: bool,
    },

    /// Terminate recorded pids
    Kill {
        /// Remove the session directory afterwards
        #[arg(long)]
        clean: bool,
    },

    /// Generate reverse-proxy configs from the ledger
    ProxyConf {
        /// Which proxy flavor to emit
        #[arg(long = "type", value_enum, default_value = "both")]
        flavor: ProxyFlavorArg,

        /// Output directory for nginx files (stdout when absent)
        #[arg(long = "nginx-out")]
        nginx_out: Option<PathBuf>,

        /// Output directory for traefik files (stdout when absent)
        #[arg(long = "traefik-out")]
        traefik_out: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProxyFlavorArg {
    Nginx,
    Traefik,
    Both,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        Verbosity::Essential => "db_yard_core=info,db_yard_server=info,db_yard_cli=info",
        Verbosity::Comprehensive => "db_yard_core=debug,db_yard_server=debug,db_yard_cli=debug",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match &cli.command {
        Commands::Start => commands::start::run(&cli).await,
        Commands::Watch => commands::watch::run(&cli).await,
        Commands::Ls { json } => commands::ls::run(&cli, *json),
        Commands::Ps { json } => commands::ps::run(*json),
        Commands::Kill { clean } => commands::kill::run(&cli, *clean).await,
        Commands::ProxyConf {
            flavor,
            nginx_out,
            traefik_out,
        } => commands::proxy_conf::run(&cli, *flavor, nginx_out.as_deref(), traefik_out.as_deref()),
    }
}

impl Cli {
    /// Assemble the core configuration from the global flags.
    pub(crate) fn config(&self) -> Result<db_yard_core::YardConfig> {
        let mut builder = db_yard_core::YardConfig::builder()
            .ledger_root(&self.spawn_state_home)
            .listen_host(&self.listen)
            .reconcile_interval(std::time::Duration::from_millis(self.reconcile_ms))
            .adopt_foreign_state(self.adopt_foreign_state)
            .kill_all_on_exit(self.kill_all_on_exit)
            .sql_endpoint_enabled(self.enable_sql_endpoint);

        for root in &self.cargo_home {
            builder = builder.root(root);
        }
        if !self.watch_globs.is_empty() {
            builder = builder.globs(self.watch_globs.clone());
        }

        Ok(builder.build()?)
    }
}
