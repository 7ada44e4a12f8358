//! `db-yard start` - one-shot materialization.

use std::process::ExitCode;

use anyhow::Result;

use db_yard_core::{scheduler, Orchestrator};

use crate::Cli;

pub async fn run(cli: &Cli) -> Result<ExitCode> {
    let mut orch = Orchestrator::new(cli.config()?);
    let summary = scheduler::materialize(&mut orch).await?;

    println!("{summary}");
    for issue in &summary.issues {
        eprintln!("  {}: {}", issue.subject, issue.message);
    }

    // Children are detached; the supervisor exits and leaves them running.
    if summary.spawn_errors > 0 {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
