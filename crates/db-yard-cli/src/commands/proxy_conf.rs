//! `db-yard proxy-conf` - generate reverse-proxy configs from the ledger.

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};

use db_yard_core::proxyconf::{generate, ProxyFlavor};
use db_yard_core::Orchestrator;

use crate::{Cli, ProxyFlavorArg};

pub fn run(
    cli: &Cli,
    flavor: ProxyFlavorArg,
    nginx_out: Option<&Path>,
    traefik_out: Option<&Path>,
) -> Result<ExitCode> {
    let contexts: Vec<_> = Orchestrator::list_session_states(&cli.spawn_state_home)
        .into_iter()
        .filter_map(|s| s.context)
        .collect();

    if matches!(flavor, ProxyFlavorArg::Nginx | ProxyFlavorArg::Both) {
        emit(&contexts, ProxyFlavor::Nginx, nginx_out)?;
    }
    if matches!(flavor, ProxyFlavorArg::Traefik | ProxyFlavorArg::Both) {
        emit(&contexts, ProxyFlavor::Traefik, traefik_out)?;
    }

    Ok(ExitCode::SUCCESS)
}

fn emit(
    contexts: &[db_yard_core::SpawnedContext],
    flavor: ProxyFlavor,
    out_dir: Option<&Path>,
) -> Result<()> {
    let files = generate(contexts, flavor);

    match out_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create output dir {}", dir.display()))?;
            for file in &files {
                let path = dir.join(&file.name);
                std::fs::write(&path, &file.contents)
                    .with_context(|| format!("write {}", path.display()))?;
            }
            println!("wrote {} files to {}", files.len(), dir.display());
        }
        None => {
            for file in &files {
                println!("# ---- {} ----", file.name);
                print!("{}", file.contents);
            }
        }
    }
    Ok(())
}
