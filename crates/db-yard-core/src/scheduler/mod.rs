//! Scheduler module.
//!
//! Two policies share one reconciliation pass. `materialize` runs the
//! pass once and returns, leaving children detached under the operating
//! system. `watch` loops over three trigger sources: the initial pass,
//! debounced filesystem events (delta passes), and a periodic full sweep
//! that closes any watcher fidelity gap. Filesystem events are hints,
//! never the source of truth.
//!
//! At most one pass runs at a time; events arriving during a pass collapse
//! into the pending set and produce a single follow-up pass.

use std::collections::HashSet;
use std::path::PathBuf;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::reconcile::PassSummary;

/// Scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The filesystem watcher could not be created or attached.
    #[error("filesystem watcher failed: {0}")]
    Watcher(#[from] notify::Error),

    /// A pass failed fatally (session directory unusable).
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// Counters of one watch run.
#[derive(Debug, Default, Clone)]
pub struct WatchStats {
    /// Full passes executed (initial + periodic).
    pub full_passes: u64,

    /// Delta passes executed from debounced events.
    pub delta_passes: u64,

    /// Summary of the last pass.
    pub last_summary: Option<PassSummary>,
}

/// One-shot mode: start the session, reconcile once, and return. The
/// supervisor does not hold the process tree afterwards.
///
/// # Errors
///
/// Returns [`SchedulerError::Orchestrator`] when the session cannot be
/// created.
pub async fn materialize(orch: &mut Orchestrator) -> Result<PassSummary, SchedulerError> {
    let summary = orch.start_session().await?;
    info!(%summary, "materialized");
    Ok(summary)
}

/// Watch mode: reconcile on startup, on debounced filesystem events, and
/// on a periodic timer, until `cancel` fires.
///
/// Cancellation closes the watcher, lets the in-flight pass finish, runs
/// the optional kill-all sweep, and returns.
///
/// # Errors
///
/// Returns [`SchedulerError::Watcher`] when the watcher cannot attach and
/// [`SchedulerError::Orchestrator`] for fatal pass failures.
pub async fn watch(
    orch: &mut Orchestrator,
    cancel: CancellationToken,
) -> Result<WatchStats, SchedulerError> {
    let mut stats = WatchStats::default();

    let summary = orch.start_session().await?;
    stats.full_passes += 1;
    stats.last_summary = Some(summary);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<PathBuf>();
    let mut watcher = RecommendedWatcher::new(
        move |result: Result<notify::Event, notify::Error>| match result {
            Ok(event) => {
                for path in event.paths {
                    let _ = event_tx.send(path);
                }
            }
            Err(err) => warn!(error = %err, "watch event error"),
        },
        notify::Config::default(),
    )?;

    for root in &orch.config().roots {
        if let Err(err) = watcher.watch(root, RecursiveMode::Recursive) {
            // A missing root is not fatal: the periodic sweep still covers
            // it once it appears.
            warn!(root = %root.display(), error = %err, "could not watch root");
        }
    }

    let debounce = orch.config().debounce;
    let mut sweep = tokio::time::interval(orch.config().reconcile_interval);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    sweep.reset();

    let mut pending: HashSet<PathBuf> = HashSet::new();
    let mut deadline: Option<tokio::time::Instant> = None;

    loop {
        let debounce_fired = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            () = cancel.cancelled() => break,

            received = event_rx.recv() => {
                let Some(path) = received else { break };
                pending.insert(path);
                deadline = Some(tokio::time::Instant::now() + debounce);
            }

            () = debounce_fired => {
                deadline = None;
                let scope = std::mem::take(&mut pending);
                debug!(paths = scope.len(), "debounced delta reconcile");
                let summary = orch.reconcile_delta(&scope).await?;
                stats.delta_passes += 1;
                stats.last_summary = Some(summary);
            }

            _ = sweep.tick() => {
                let summary = orch.reconcile_full().await?;
                stats.full_passes += 1;
                stats.last_summary = Some(summary);
            }
        }
    }

    drop(watcher);

    if orch.config().kill_all_on_exit {
        let counts = orch.kill_owned().await;
        info!(%counts, "kill-all-on-exit sweep finished");
    }

    info!(
        full = stats.full_passes,
        delta = stats.delta_passes,
        "watch loop stopped"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use crate::config::YardConfig;

    use super::*;

    fn test_orchestrator(cargo: &TempDir, ledger: &TempDir) -> Orchestrator {
        let config = YardConfig::builder()
            .root(cargo.path())
            .ledger_root(ledger.path())
            .debounce(Duration::from_millis(50))
            .reconcile_interval(Duration::from_millis(200))
            .build()
            .unwrap();
        Orchestrator::new(config)
    }

    #[tokio::test]
    async fn test_materialize_empty_root_is_noop() {
        let cargo = TempDir::new().unwrap();
        let ledger = TempDir::new().unwrap();
        let mut orch = test_orchestrator(&cargo, &ledger);

        let summary = materialize(&mut orch).await.unwrap();
        assert_eq!(summary.spawned, 0);
        assert!(summary.is_noop());
        assert!(orch.session().is_some());
    }

    #[tokio::test]
    async fn test_watch_runs_initial_pass_and_cancels() {
        let cargo = TempDir::new().unwrap();
        let ledger = TempDir::new().unwrap();
        let mut orch = test_orchestrator(&cargo, &ledger);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            canceller.cancel();
        });

        let stats = watch(&mut orch, cancel).await.unwrap();
        assert!(stats.full_passes >= 1);
    }

    #[tokio::test]
    async fn test_watch_debounces_events_into_delta_pass() {
        let cargo = TempDir::new().unwrap();
        let ledger = TempDir::new().unwrap();
        let mut orch = test_orchestrator(&cargo, &ledger);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        let drop_zone = cargo.path().to_path_buf();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            // A plain file: discovered, classified, but never spawned.
            let conn = rusqlite::Connection::open(drop_zone.join("plain.db")).unwrap();
            conn.execute_batch("CREATE TABLE t (x);").unwrap();
            drop(conn);
            tokio::time::sleep(Duration::from_millis(600)).await;
            canceller.cancel();
        });

        let stats = watch(&mut orch, cancel).await.unwrap();
        assert!(
            stats.delta_passes >= 1 || stats.full_passes >= 2,
            "either the debounce or the periodic sweep must have fired"
        );
    }
}
