//! `db-yard watch` - the supervisor loop.
//!
//! Runs the watch scheduler until SIGINT or SIGTERM; optionally binds the
//! admin/proxy HTTP surface next to it. Exit codes follow the shell
//! convention: 130 for SIGINT, 143 for SIGTERM.

use std::net::SocketAddr;
use std::process::ExitCode;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use db_yard_core::{scheduler, Orchestrator};
use db_yard_server::AppState;

use crate::Cli;

pub async fn run(cli: &Cli) -> Result<ExitCode> {
    let config = cli.config()?;
    let ledger_root = config.ledger_root.clone();
    let sql_enabled = config.sql_endpoint_enabled;
    let mut orch = Orchestrator::new(config);

    let cancel = CancellationToken::new();

    // Signals funnel into the same cancellation; remember which one fired
    // for the exit code.
    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let signal_cancel = cancel.clone();
    let signal_task = tokio::spawn(async move {
        let code = tokio::select! {
            _ = sigint.recv() => 130u8,
            _ = sigterm.recv() => 143u8,
        };
        signal_cancel.cancel();
        code
    });

    // Optional admin surface, reading the ledger root so it always follows
    // the current session pointer.
    let admin_task = match cli.admin_port {
        Some(port) => {
            let addr: SocketAddr = format!("{}:{port}", cli.admin_host)
                .parse()
                .with_context(|| format!("invalid admin address {}:{port}", cli.admin_host))?;
            let state = AppState::new(&ledger_root, sql_enabled);
            let cancel = cancel.clone();
            Some(tokio::spawn(async move {
                if let Err(err) = db_yard_server::serve(addr, state, cancel).await {
                    warn!(error = %err, "admin server stopped");
                }
            }))
        }
        None => None,
    };

    let stats = scheduler::watch(&mut orch, cancel.clone()).await?;
    info!(
        full = stats.full_passes,
        delta = stats.delta_passes,
        "supervisor stopped"
    );

    if let Some(task) = admin_task {
        let _ = task.await;
    }

    let code = if signal_task.is_finished() {
        signal_task.await.unwrap_or(0)
    } else {
        signal_task.abort();
        0
    };

    Ok(match code {
        0 => ExitCode::SUCCESS,
        n => ExitCode::from(n),
    })
}
