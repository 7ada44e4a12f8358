//! `db-yard kill` - terminate recorded pids.

use std::process::ExitCode;

use anyhow::Result;

use db_yard_core::orchestrator::{kill_session, KillOptions};

use crate::Cli;

pub async fn run(cli: &Cli, clean: bool) -> Result<ExitCode> {
    let counts = kill_session(&cli.spawn_state_home, KillOptions { clean }).await;
    println!("{counts}");
    Ok(ExitCode::SUCCESS)
}
