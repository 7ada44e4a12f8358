//! `db-yard ps` - list processes tagged as owned by db-yard.

use std::process::ExitCode;

use anyhow::Result;

use db_yard_core::Orchestrator;

pub fn run(json: bool) -> Result<ExitCode> {
    let tagged = Orchestrator::list_tagged_processes();

    if json {
        println!("{}", serde_json::to_string_pretty(&tagged)?);
        return Ok(ExitCode::SUCCESS);
    }

    if tagged.is_empty() {
        println!("no tagged processes");
        return Ok(ExitCode::SUCCESS);
    }

    for process in &tagged {
        println!(
            "{:>7}  {:<24}  {}",
            process.pid,
            process.service_id.as_deref().unwrap_or("-"),
            process.context_path.display(),
        );
        if let Some(issue) = &process.issue {
            println!("         issue: {issue}");
        }
    }

    Ok(ExitCode::SUCCESS)
}
