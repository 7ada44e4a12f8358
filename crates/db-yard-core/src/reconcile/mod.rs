//! Reconciler module.
//!
//! One pass diffs the desired set (discovery ∘ classification) against the
//! observed set (session ledger + tagged processes) and plans actions:
//! spawn, refresh, touch, stop, detach, or orphan removal. Planning is
//! pure; the orchestrator executes the plan. Iteration is sorted by
//! service id so traces and tests are deterministic.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::TcpListener;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::classify::ExposableService;
use crate::ledger::SpawnedState;
use crate::procindex::TaggedProcess;
use crate::sidecar::SidecarConfig;

/// A desired service with the sidecar it was resolved under.
#[derive(Debug, Clone)]
pub struct DesiredService {
    /// The exposable service.
    pub service: ExposableService,

    /// Sidecar configuration read at discovery time.
    pub sidecar: SidecarConfig,
}

/// One observed ledger record, pre-decorated by the caller so planning
/// stays free of filesystem access.
#[derive(Debug, Clone)]
pub struct ObservedRecord {
    /// The scanned state.
    pub state: SpawnedState,

    /// Whether the record's owner token differs from the session's.
    pub foreign: bool,

    /// Whether the record's source file still exists on disk.
    pub source_exists: bool,
}

/// Per-source-file spawn failure memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffEntry {
    /// When the last failure happened, ms since epoch.
    pub last_fail_at_ms: i64,

    /// Consecutive failures.
    pub fail_count: u32,
}

/// Failure counters keyed by source file.
#[derive(Debug, Default)]
pub struct BackoffTable {
    entries: HashMap<PathBuf, BackoffEntry>,
}

impl BackoffTable {
    /// Fresh empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a spawn for this source must be skipped right now.
    #[must_use]
    pub fn is_throttled(&self, source: &Path, now_ms: i64, window_ms: i64) -> bool {
        self.entries
            .get(source)
            .is_some_and(|entry| now_ms - entry.last_fail_at_ms < window_ms)
    }

    /// Record a failed spawn or fast exit.
    pub fn record_failure(&mut self, source: &Path, now_ms: i64) {
        let entry = self
            .entries
            .entry(source.to_path_buf())
            .or_insert(BackoffEntry {
                last_fail_at_ms: now_ms,
                fail_count: 0,
            });
        entry.last_fail_at_ms = now_ms;
        entry.fail_count += 1;
    }

    /// A successful spawn clears the counter.
    pub fn clear(&mut self, source: &Path) {
        self.entries.remove(source);
    }

    /// Current entry for a source.
    #[must_use]
    pub fn entry(&self, source: &Path) -> Option<BackoffEntry> {
        self.entries.get(source).copied()
    }
}

/// Why a record is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The source file disappeared.
    SourceRemoved,
    /// The source file no longer classifies as exposable.
    Reclassified,
}

/// One planned action.
#[derive(Debug)]
pub enum Action {
    /// Launch a child for a service that is not running.
    Spawn(DesiredService),

    /// Source changed size or mtime: rewrite the manifest in place.
    Refresh(DesiredService, SpawnedState),

    /// Alive and unchanged: update only the last-seen stamp.
    Touch(SpawnedState),

    /// Desired but throttled by the backoff window.
    Throttled(DesiredService, BackoffEntry),

    /// Kill the pid and remove the manifest.
    Stop(SpawnedState, StopReason),

    /// Foreign record without adoption: drop from the running set but do
    /// not signal the pid or touch the file.
    Detach(SpawnedState),

    /// Context whose source is gone and whose pid is dead: remove the
    /// manifest only, logs stay.
    RemoveOrphan(PathBuf),
}

/// Inputs of one planning step.
#[derive(Debug)]
pub struct PlanInputs<'a> {
    /// Desired services.
    pub desired: Vec<DesiredService>,

    /// Observed records of the current session.
    pub observed: Vec<ObservedRecord>,

    /// Current time, ms since epoch.
    pub now_ms: i64,

    /// Failure memory.
    pub backoff: &'a BackoffTable,

    /// Backoff window, ms.
    pub backoff_window_ms: i64,

    /// Whether foreign records may be reconciled.
    pub adopt_foreign: bool,

    /// Delta reconcile: restrict planning to these source files.
    pub scope: Option<&'a HashSet<PathBuf>>,
}

/// Plan the actions of one pass.
///
/// Actions come out grouped by kind and sorted by service id within each
/// group, so executing them in order is deterministic.
#[must_use]
pub fn plan(inputs: &PlanInputs<'_>) -> Vec<Action> {
    let in_scope = |path: &Path| -> bool {
        inputs.scope.is_none_or(|scope| scope.contains(path))
    };

    let mut desired_by_id: BTreeMap<&str, &DesiredService> = BTreeMap::new();
    for desired in &inputs.desired {
        desired_by_id.insert(desired.service.id.as_str(), desired);
    }

    // Broken records (unparseable manifests) are excluded from planning
    // entirely; they surface through the discrepancy report instead.
    let mut observed_by_id: BTreeMap<String, Vec<&ObservedRecord>> = BTreeMap::new();
    for record in &inputs.observed {
        if let Some(id) = record.state.service_id() {
            observed_by_id.entry(id.to_string()).or_default().push(record);
        }
    }

    let mut actions = Vec::new();

    // Desired side: spawn, refresh, or touch.
    for (id, desired) in &desired_by_id {
        if !in_scope(&desired.service.location) {
            continue;
        }

        let record = observed_by_id.get(*id).and_then(|records| pick(records));

        let running = record.filter(|r| r.state.alive);
        if let Some(record) = running {
            if record.foreign && !inputs.adopt_foreign {
                // An alive foreign record satisfies the desired state; we
                // may not rewrite it, so leave it entirely alone.
                continue;
            }
            if supplier_changed(&desired.service, record) {
                actions.push(Action::Refresh((*desired).clone(), record.state.clone()));
            } else {
                actions.push(Action::Touch(record.state.clone()));
            }
            continue;
        }

        // Not running (no record, or record with a dead pid).
        if let Some(entry) = inputs.backoff.entry(&desired.service.location) {
            if inputs.backoff.is_throttled(
                &desired.service.location,
                inputs.now_ms,
                inputs.backoff_window_ms,
            ) {
                actions.push(Action::Throttled((*desired).clone(), entry));
                continue;
            }
        }
        actions.push(Action::Spawn((*desired).clone()));
    }

    // Observed side: stop, detach, or garbage-collect.
    for (id, records) in &observed_by_id {
        if desired_by_id.contains_key(id.as_str()) {
            // Dead records shadowed by an alive one (or being respawned)
            // are cleaned up as orphans once their source is gone.
            for record in records.iter().filter(|r| !r.state.alive) {
                if !record.source_exists && in_scope(source_of(record)) {
                    actions.push(Action::RemoveOrphan(record.state.context_path.clone()));
                }
            }
            continue;
        }

        for record in records {
            if !in_scope(source_of(record)) {
                continue;
            }
            if record.foreign && !inputs.adopt_foreign {
                actions.push(Action::Detach(record.state.clone()));
                continue;
            }
            if record.state.alive {
                let reason = if record.source_exists {
                    StopReason::Reclassified
                } else {
                    StopReason::SourceRemoved
                };
                actions.push(Action::Stop(record.state.clone(), reason));
            } else if !record.source_exists {
                actions.push(Action::RemoveOrphan(record.state.context_path.clone()));
            } else {
                // Dead pid, source still present but no longer desired
                // (re-classified while down): the manifest is stale.
                actions.push(Action::Stop(record.state.clone(), StopReason::Reclassified));
            }
        }
    }

    debug!(actions = actions.len(), "planned reconciliation pass");
    actions
}

/// Tie-break between records claiming one id: prefer a record whose
/// source file still exists, then the newest spawn.
fn pick<'a>(records: &[&'a ObservedRecord]) -> Option<&'a ObservedRecord> {
    records
        .iter()
        .max_by_key(|r| {
            (
                r.state.alive,
                r.source_exists,
                r.state.context.as_ref().map(|c| c.started_at),
            )
        })
        .copied()
}

fn supplier_changed(service: &ExposableService, record: &ObservedRecord) -> bool {
    record.state.context.as_ref().is_some_and(|context| {
        context.supplier.size != service.size || context.supplier.mtime != service.mtime_ms
    })
}

fn source_of(record: &ObservedRecord) -> &Path {
    record
        .state
        .context
        .as_ref()
        .map_or(record.state.context_path.as_path(), |c| {
            c.supplier.location.as_path()
        })
}

// ---------------------------------------------------------------------------
// Port allocation
// ---------------------------------------------------------------------------

/// Allocate a free TCP port, starting from `port_start` and skipping ports
/// already used by live records. The operating system is the authority: a
/// candidate must actually bind, and when the sequential range is dense an
/// ephemeral `:0` bind discovers a free port.
///
/// # Errors
///
/// Returns the underlying I/O error when even an ephemeral bind fails.
pub fn alloc_port(
    listen_host: &str,
    port_start: u16,
    used: &HashSet<u16>,
) -> std::io::Result<u16> {
    for offset in 0..256u32 {
        let Some(candidate) = port_start.checked_add(offset as u16) else {
            break;
        };
        if used.contains(&candidate) {
            continue;
        }
        if let Ok(listener) = TcpListener::bind((listen_host, candidate)) {
            drop(listener);
            return Ok(candidate);
        }
    }

    let listener = TcpListener::bind((listen_host, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

// ---------------------------------------------------------------------------
// Pass summary
// ---------------------------------------------------------------------------

/// A per-candidate problem accumulated during a pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassIssue {
    /// Service id or path the problem belongs to.
    pub subject: String,

    /// Human-readable description.
    pub message: String,
}

/// Counters and issues of one reconciliation pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PassSummary {
    /// Children launched.
    pub spawned: u32,

    /// Records stopped (pid killed, manifest removed).
    pub stopped: u32,

    /// Manifests rewritten for changed sources.
    pub refreshed: u32,

    /// Records confirmed alive and unchanged.
    pub touched: u32,

    /// Spawns skipped by the backoff window.
    pub throttled: u32,

    /// Foreign records left alone.
    pub detached: u32,

    /// Orphan manifests removed.
    pub orphans_removed: u32,

    /// Spawns that failed outright (launch error or fast exit).
    pub spawn_errors: u32,

    /// Per-candidate problems; never fatal to the pass.
    pub issues: Vec<PassIssue>,
}

impl PassSummary {
    /// Whether the pass changed nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.spawned == 0
            && self.stopped == 0
            && self.refreshed == 0
            && self.throttled == 0
            && self.orphans_removed == 0
    }

    /// Record a problem.
    pub fn push_issue(&mut self, subject: impl Into<String>, message: impl Into<String>) {
        self.issues.push(PassIssue {
            subject: subject.into(),
            message: message.into(),
        });
    }
}

impl std::fmt::Display for PassSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "spawned {} stopped {} refreshed {} throttled {} orphans {} issues {}",
            self.spawned,
            self.stopped,
            self.refreshed,
            self.throttled,
            self.orphans_removed,
            self.issues.len()
        )
    }
}

// ---------------------------------------------------------------------------
// Discrepancy report
// ---------------------------------------------------------------------------

/// One inconsistency between the tag index and the ledger.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Discrepancy {
    /// A tagged process has no backing ledger record.
    ProcessWithoutLedger {
        /// The process pid.
        pid: u32,
        /// Its service tag, when present.
        service_id: Option<String>,
        /// The context path its environment names.
        context_path: PathBuf,
    },

    /// A ledger record has no alive backing process.
    LedgerWithoutProcess {
        /// The manifest path.
        context_path: PathBuf,
        /// The recorded service id, when the record parses.
        service_id: Option<String>,
        /// The recorded pid, when the record parses.
        pid: Option<u32>,
        /// Why, when the record is broken.
        detail: Option<String>,
    },

    /// Both exist but disagree.
    ProcessAndLedgerMismatch {
        /// The process pid.
        pid: u32,
        /// The manifest path.
        context_path: PathBuf,
        /// What disagrees.
        detail: String,
    },
}

/// Totals of one discrepancy report.
#[derive(Debug, Default, Clone, Serialize)]
pub struct DiscrepancySummary {
    /// Tagged processes without ledger records.
    pub process_without_ledger: u32,

    /// Ledger records without alive processes.
    pub ledger_without_process: u32,

    /// Pairs that disagree.
    pub mismatched: u32,

    /// Pairs in agreement.
    pub consistent: u32,
}

/// A full report plus totals.
#[derive(Debug, Default, Clone, Serialize)]
pub struct DiscrepancyReport {
    /// The individual items.
    pub items: Vec<Discrepancy>,

    /// Totals.
    pub summary: DiscrepancySummary,
}

/// Diff the tag index against a ledger scan.
#[must_use]
pub fn report_discrepancies(
    states: &[SpawnedState],
    tagged: &[TaggedProcess],
) -> DiscrepancyReport {
    let mut report = DiscrepancyReport::default();

    let ledger_pids: HashMap<u32, &SpawnedState> = states
        .iter()
        .filter_map(|s| s.pid.map(|pid| (pid, s)))
        .collect();
    let tagged_pids: HashSet<u32> = tagged.iter().map(|t| t.pid).collect();

    for process in tagged {
        match ledger_pids.get(&process.pid) {
            None => {
                report.summary.process_without_ledger += 1;
                report.items.push(Discrepancy::ProcessWithoutLedger {
                    pid: process.pid,
                    service_id: process.service_id.clone(),
                    context_path: process.context_path.clone(),
                });
            }
            Some(state) => {
                let recorded = state
                    .context
                    .as_ref()
                    .map(|c| c.paths.context.clone())
                    .unwrap_or_else(|| state.context_path.clone());
                if let Some(issue) = &process.issue {
                    report.summary.mismatched += 1;
                    report.items.push(Discrepancy::ProcessAndLedgerMismatch {
                        pid: process.pid,
                        context_path: recorded,
                        detail: issue.clone(),
                    });
                } else {
                    report.summary.consistent += 1;
                }
            }
        }
    }

    for state in states {
        let missing_process = match state.pid {
            Some(pid) => !state.alive || !tagged_pids.contains(&pid),
            None => true,
        };
        if missing_process {
            report.summary.ledger_without_process += 1;
            report.items.push(Discrepancy::LedgerWithoutProcess {
                context_path: state.context_path.clone(),
                service_id: state.service_id().map(ToString::to_string),
                pid: state.pid,
                detail: state.error.clone(),
            });
        }
    }

    report
}
