//! `db-yard ls` - list services from a spawned-state home.

use std::process::ExitCode;

use anyhow::Result;

use db_yard_core::Orchestrator;

use crate::Cli;

pub fn run(cli: &Cli, json: bool) -> Result<ExitCode> {
    let states = Orchestrator::list_session_states(&cli.spawn_state_home);

    if json {
        println!("{}", serde_json::to_string_pretty(&states)?);
        return Ok(ExitCode::SUCCESS);
    }

    if states.is_empty() {
        println!("no services recorded under {}", cli.spawn_state_home.display());
        return Ok(ExitCode::SUCCESS);
    }

    for state in &states {
        let marker = if state.alive { "alive" } else { "dead " };
        match (&state.context, &state.error) {
            (Some(context), _) => {
                println!(
                    "{marker}  {:>7}  {:<24}  {}  {}",
                    state.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
                    context.service.id,
                    context.service.upstream_url,
                    context.supplier.location.display(),
                );
            }
            (None, Some(error)) => {
                println!("broken  {}  {error}", state.context_path.display());
            }
            (None, None) => {}
        }
    }

    Ok(ExitCode::SUCCESS)
}
