//! Orchestrator module.
//!
//! Owns the component instances (discovery, classifier, driver registry,
//! spawner, ledger, tag index) and wires them into the start / ls / ps /
//! kill / reconcile operations. A reconciliation pass receives everything
//! it needs explicitly; no component holds a back-reference to another.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::classify;
use crate::config::YardConfig;
use crate::discovery;
use crate::driver::{DriverRegistry, PlanRequest};
use crate::ledger::{
    self, ContextPaths, ListenStamp, OwnerStamp, PathsStamp, ServiceStamp, Session, SessionStamp,
    SpawnStamp, SpawnedContext, SpawnedState, SupplierStamp,
};
use crate::pathing;
use crate::probe;
use crate::procindex::{self, TaggedProcess};
use crate::reconcile::{
    self, Action, BackoffTable, DesiredService, DiscrepancyReport, ObservedRecord, PassSummary,
    PlanInputs, StopReason,
};
use crate::sidecar::SidecarConfig;
use crate::spawner::{self, SpawnRequest, SpawnTags};
use crate::sqlrunner::{ReadOnlySqlRunner, SqlRunner};

/// Orchestrator errors.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Ledger failure on the session directory itself.
    #[error(transparent)]
    Ledger(#[from] ledger::LedgerError),

    /// An operation that needs a session ran before `start_session`.
    #[error("no active session; call start_session first")]
    NoSession,
}

/// Options of the kill operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct KillOptions {
    /// Remove the whole session directory afterwards.
    pub clean: bool,
}

/// Counters of one kill operation.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct KillCounts {
    /// Pids terminated.
    pub killed: u32,

    /// Pids that were already gone.
    pub already_gone: u32,

    /// Signal failures (left in the ledger).
    pub errors: u32,

    /// Context files removed.
    pub contexts_removed: u32,
}

impl std::fmt::Display for KillCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "killed {} already-gone {} errors {} contexts-removed {}",
            self.killed, self.already_gone, self.errors, self.contexts_removed
        )
    }
}

/// Composes the components into the supervisor operations.
pub struct Orchestrator {
    config: YardConfig,
    registry: DriverRegistry,
    sql: Box<dyn SqlRunner>,
    session: Option<Session>,
    backoff: BackoffTable,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Create an orchestrator with the built-in drivers and the read-only
    /// SQL runner.
    #[must_use]
    pub fn new(config: YardConfig) -> Self {
        Self {
            config,
            registry: DriverRegistry::with_builtins(),
            sql: Box::new(ReadOnlySqlRunner),
            session: None,
            backoff: BackoffTable::new(),
        }
    }

    /// Replace the driver registry.
    #[must_use]
    pub fn with_registry(mut self, registry: DriverRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the SQL runner.
    #[must_use]
    pub fn with_sql_runner(mut self, sql: Box<dyn SqlRunner>) -> Self {
        self.sql = sql;
        self
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &YardConfig {
        &self.config
    }

    /// The active session, once started.
    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Create the session home, adopt surviving children of the previous
    /// session, and run the initial reconciliation.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Ledger`] when the session directory
    /// cannot be created.
    pub async fn start_session(&mut self) -> Result<PassSummary, OrchestratorError> {
        let predecessor = ledger::current_session(&self.config.ledger_root);
        let session = ledger::create_session(&self.config.ledger_root)?;
        info!(
            session = %session.home.name(),
            home = %session.home.path().display(),
            "session started"
        );
        self.session = Some(session);

        if let Some(old_home) = predecessor {
            self.adopt_surviving_records(&old_home);
        }

        self.reconcile_full().await
    }

    /// Carry over records of the finished predecessor session whose
    /// children are still alive and whose source files still exist. Only
    /// the new session home is written; the predecessor's files are left
    /// untouched.
    fn adopt_surviving_records(&mut self, old_home: &ledger::SessionHome) {
        let session = match &self.session {
            Some(session) => session.clone(),
            None => return,
        };
        if old_home.path() == session.home.path() {
            return;
        }

        let old_token = old_home.owner_token();
        let adopt_all = self.config.adopt_foreign_state;

        for state in ledger::scan(old_home.path()) {
            let Some(context) = state.context else {
                continue;
            };
            if !state.alive || !context.supplier.location.exists() {
                continue;
            }
            // Leave records of a predecessor that is still running, and
            // records the predecessor itself did not write, unless foreign
            // adoption was requested.
            let legitimate = old_token
                .as_deref()
                .is_some_and(|token| token == context.owner.owner_token);
            let predecessor_exited = !spawner::is_pid_alive(context.owner.supervisor_pid);
            if !adopt_all && !(legitimate && predecessor_exited) {
                continue;
            }

            let mut adopted = context;
            let rel = pathing::best_matching_root(&adopted.supplier.location, &self.config.roots)
                .map(|root| pathing::rel_to_root(&adopted.supplier.location, root));
            let Some(rel) = rel else {
                continue;
            };

            let dir = rel
                .parent()
                .map_or_else(|| session.home.path().to_path_buf(), |p| session.home.path().join(p));
            let basename = rel.file_name().map(|n| n.to_string_lossy().to_string());
            let Some(basename) = basename else { continue };

            adopted.session = SessionStamp {
                session_id: session.session_id.clone(),
                host: session.host.clone(),
                started_at: session.started_at,
            };
            adopted.owner = OwnerStamp {
                owner_token: session.owner_token.clone(),
                supervisor_pid: std::process::id(),
                host: session.host.clone(),
                started_at_ms: adopted.owner.started_at_ms,
            };
            adopted.paths = PathsStamp {
                context: dir.join(format!("{basename}{}", ledger::CONTEXT_SUFFIX)),
                stdout: dir.join(format!("{basename}.stdout.log")),
                stderr: dir.join(format!("{basename}.stderr.log")),
            };
            adopted.last_seen_at_ms = Some(Utc::now().timestamp_millis());

            match ledger::write_context(&adopted) {
                Ok(()) => {
                    info!(
                        service = %adopted.service.id,
                        pid = adopted.spawned.pid,
                        "adopted surviving child from previous session"
                    );
                }
                Err(err) => {
                    warn!(service = %adopted.service.id, error = %err, "adoption write failed");
                }
            }
        }
    }

    /// Run one full reconciliation pass.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::NoSession`] before `start_session`.
    pub async fn reconcile_full(&mut self) -> Result<PassSummary, OrchestratorError> {
        self.run_pass(None).await
    }

    /// Run one delta pass restricted to the given source files.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::NoSession`] before `start_session`.
    pub async fn reconcile_delta(
        &mut self,
        paths: &HashSet<PathBuf>,
    ) -> Result<PassSummary, OrchestratorError> {
        self.run_pass(Some(paths)).await
    }

    async fn run_pass(
        &mut self,
        scope: Option<&HashSet<PathBuf>>,
    ) -> Result<PassSummary, OrchestratorError> {
        let session = self.session.clone().ok_or(OrchestratorError::NoSession)?;
        let mut summary = PassSummary::default();

        // Desired side: discovery then classification.
        let outcome = discovery::discover(&self.config.watch_roots());
        for issue in &outcome.issues {
            summary.push_issue(
                issue
                    .path
                    .as_ref()
                    .map_or_else(|| "discovery".to_string(), |p| p.display().to_string()),
                issue.message.clone(),
            );
        }

        let mut desired = Vec::new();
        for candidate in &outcome.candidates {
            let classification = classify::classify(candidate);
            if let Some(note) = &classification.note {
                debug!(path = %candidate.path.display(), note = %note, "not classifiable");
            }
            let sidecar = classify::load_sidecar(candidate);
            if let Some(service) =
                classify::to_exposable(&classification, candidate, &sidecar, &self.config.roots)
            {
                desired.push(DesiredService { service, sidecar });
            }
        }

        // Observed side: the session ledger, decorated for planning.
        let observed: Vec<ObservedRecord> = ledger::scan(session.home.path())
            .into_iter()
            .map(|state| {
                let foreign = state.is_foreign(&session.owner_token);
                let source_exists = state
                    .context
                    .as_ref()
                    .is_some_and(|c| c.supplier.location.exists());
                ObservedRecord {
                    state,
                    foreign,
                    source_exists,
                }
            })
            .collect();

        let actions = reconcile::plan(&PlanInputs {
            desired,
            observed,
            now_ms: Utc::now().timestamp_millis(),
            backoff: &self.backoff,
            backoff_window_ms: i64::try_from(self.config.respawn_backoff.as_millis())
                .unwrap_or(i64::MAX),
            adopt_foreign: self.config.adopt_foreign_state,
            scope,
        });

        for action in actions {
            self.execute(&session, action, &mut summary).await;
        }

        self.recover_untracked_children(&session, &mut summary).await;
        self.rewrite_pid_file(&session, &mut summary);

        info!(%summary, "reconciliation pass finished");
        Ok(summary)
    }

    async fn execute(&mut self, session: &Session, action: Action, summary: &mut PassSummary) {
        match action {
            Action::Spawn(desired) => {
                match self.spawn_service(session, &desired).await {
                    Ok(context) => {
                        self.backoff.clear(&desired.service.location);
                        summary.spawned += 1;

                        // Reachability is informational; it never gates the
                        // lifecycle, so the probe runs detached.
                        let probe_url = context.listen.probe_url.clone();
                        let timeout = self.config.probe_timeout;
                        let id = context.service.id.clone();
                        tokio::spawn(async move {
                            let result = probe::probe_http(&probe_url, timeout).await;
                            if result.reachable {
                                debug!(service = %id, url = %probe_url, "probe ok");
                            } else {
                                info!(
                                    service = %id,
                                    url = %probe_url,
                                    error = ?result.error,
                                    "probe failed"
                                );
                            }
                        });
                    }
                    Err(message) => {
                        self.backoff
                            .record_failure(&desired.service.location, Utc::now().timestamp_millis());
                        warn!(service = %desired.service.id, %message, "[spawn] failed");
                        summary.spawn_errors += 1;
                        summary.push_issue(desired.service.id.clone(), message);
                    }
                }
            }
            Action::Refresh(desired, state) => match self.refresh_record(&desired, &state) {
                Ok(()) => summary.refreshed += 1,
                Err(err) => summary.push_issue(desired.service.id.clone(), err.to_string()),
            },
            Action::Touch(state) => {
                if let Some(mut context) = state.context {
                    context.last_seen_at_ms = Some(Utc::now().timestamp_millis());
                    if let Err(err) = ledger::write_context(&context) {
                        summary.push_issue(context.service.id.clone(), err.to_string());
                    } else {
                        summary.touched += 1;
                    }
                }
            }
            Action::Throttled(desired, entry) => {
                debug!(
                    service = %desired.service.id,
                    fail_count = entry.fail_count,
                    "spawn throttled by backoff"
                );
                summary.throttled += 1;
            }
            Action::Stop(state, reason) => {
                self.stop_record(&state, reason, summary).await;
            }
            Action::Detach(state) => {
                debug!(
                    context = %state.context_path.display(),
                    "foreign record left alone"
                );
                summary.detached += 1;
            }
            Action::RemoveOrphan(path) => match ledger::remove_context(&path) {
                Ok(()) => summary.orphans_removed += 1,
                Err(err) => summary.push_issue(path.display().to_string(), err.to_string()),
            },
        }
    }

    async fn spawn_service(
        &self,
        session: &Session,
        desired: &DesiredService,
    ) -> Result<SpawnedContext, String> {
        let service = &desired.service;

        let used: HashSet<u16> = ledger::scan(session.home.path())
            .iter()
            .filter(|s| s.alive)
            .filter_map(|s| s.context.as_ref().map(|c| c.listen.port))
            .collect();
        let port = reconcile::alloc_port(&self.config.listen_host, self.config.port_start, &used)
            .map_err(|err| format!("port allocation failed: {err}"))?;

        let plan = self
            .registry
            .plan(&PlanRequest {
                service,
                port,
                listen_host: &self.config.listen_host,
                sidecar: &desired.sidecar,
            })
            .map_err(|err| err.to_string())?;

        let paths = ledger::context_paths(&session.home, service, &self.config.roots);
        let tags = SpawnTags {
            session_id: session.session_id.clone(),
            service_id: service.id.clone(),
            context_path: paths.context.clone(),
        };

        let request = SpawnRequest {
            plan: plan.clone(),
            stdout_path: paths.stdout.clone(),
            stderr_path: paths.stderr.clone(),
            tags,
        };
        let pid = spawner::spawn_detached(&request, self.config.fast_exit)
            .await
            .map_err(|err| err.to_string())?;

        let context = self.build_context(session, desired, &paths, plan, port, pid);
        if let Err(err) = ledger::write_context(&context) {
            // The child is already running; the tag index recovers or
            // kills it on the next pass.
            return Err(format!("context write failed after spawn of pid {pid}: {err}"));
        }

        info!(
            service = %service.id,
            pid,
            port,
            prefix = %service.proxy_endpoint_prefix,
            "service spawned"
        );
        Ok(context)
    }

    fn build_context(
        &self,
        session: &Session,
        desired: &DesiredService,
        paths: &ContextPaths,
        plan: crate::driver::SpawnPlan,
        port: u16,
        pid: u32,
    ) -> SpawnedContext {
        let service = &desired.service;
        let base_url = format!("http://{}:{port}", self.config.listen_host);
        let upstream_url = pathing::join_url(&base_url, &service.proxy_endpoint_prefix);
        let now = Utc::now();

        let spawned_ctx = self.snapshot_ctx_queries(desired);

        SpawnedContext {
            started_at: now,
            session: SessionStamp {
                session_id: session.session_id.clone(),
                host: session.host.clone(),
                started_at: session.started_at,
            },
            service: ServiceStamp {
                id: service.id.clone(),
                kind: service.kind.as_str().to_string(),
                label: service.label.clone(),
                proxy_endpoint_prefix: service.proxy_endpoint_prefix.clone(),
                upstream_url,
            },
            supplier: SupplierStamp {
                location: service.location.clone(),
                size: service.size,
                mtime: service.mtime_ms,
                kind: service.kind.as_str().to_string(),
                nature: service.nature.as_str().to_string(),
            },
            listen: ListenStamp {
                host: self.config.listen_host.clone(),
                port,
                base_url: base_url.clone(),
                probe_url: format!("{base_url}/"),
            },
            spawned: SpawnStamp { pid, plan },
            paths: PathsStamp {
                context: paths.context.clone(),
                stdout: paths.stdout.clone(),
                stderr: paths.stderr.clone(),
            },
            owner: OwnerStamp {
                owner_token: session.owner_token.clone(),
                supervisor_pid: std::process::id(),
                host: session.host.clone(),
                started_at_ms: now.timestamp_millis(),
            },
            db_yard_config: (!desired.sidecar.is_empty()).then(|| desired.sidecar.clone()),
            spawned_ctx,
            last_seen_at_ms: Some(now.timestamp_millis()),
        }
    }

    fn snapshot_ctx_queries(
        &self,
        desired: &DesiredService,
    ) -> Option<BTreeMap<String, serde_json::Value>> {
        let queries = desired.sidecar.ctx_queries();
        if queries.is_empty() {
            return None;
        }
        let mut snapshots = BTreeMap::new();
        for (_, sql) in queries {
            let outcome = self.sql.run_query(&desired.service.location, &sql);
            let value = if outcome.ok {
                outcome.rows_json()
            } else {
                serde_json::json!({ "error": outcome.error })
            };
            snapshots.insert(sql, value);
        }
        Some(snapshots)
    }

    /// Rewrite a manifest in place for a changed source: fresh supplier
    /// stamp, fresh sidecar, fresh context snapshots. Pid and listen stay.
    fn refresh_record(
        &self,
        desired: &DesiredService,
        state: &SpawnedState,
    ) -> Result<(), ledger::LedgerError> {
        let Some(mut context) = state.context.clone() else {
            return Ok(());
        };
        let service = &desired.service;

        context.supplier.size = service.size;
        context.supplier.mtime = service.mtime_ms;
        context.supplier.kind = service.kind.as_str().to_string();
        context.db_yard_config = (!desired.sidecar.is_empty()).then(|| desired.sidecar.clone());
        context.spawned_ctx = self.snapshot_ctx_queries(desired);
        context.last_seen_at_ms = Some(Utc::now().timestamp_millis());

        ledger::write_context(&context)?;
        debug!(service = %service.id, "manifest refreshed in place");
        Ok(())
    }

    async fn stop_record(
        &self,
        state: &SpawnedState,
        reason: StopReason,
        summary: &mut PassSummary,
    ) {
        if let Some(pid) = state.pid {
            match spawner::kill_pid(pid).await {
                Ok(outcome) => {
                    debug!(pid, ?outcome, ?reason, "record stopped");
                }
                Err(err) => {
                    summary.push_issue(
                        state.context_path.display().to_string(),
                        format!("kill failed: {err}"),
                    );
                    // Leave the manifest so the record is not lost.
                    return;
                }
            }
        }
        match ledger::remove_context(&state.context_path) {
            Ok(()) => summary.stopped += 1,
            Err(err) => {
                summary.push_issue(state.context_path.display().to_string(), err.to_string());
            }
        }
    }

    /// A child carrying this session's tag but missing from the ledger
    /// means a context write failed after spawn. Without the manifest its
    /// port and plan are unknown, so the child is terminated and respawned
    /// cleanly by a later pass.
    async fn recover_untracked_children(&self, session: &Session, summary: &mut PassSummary) {
        let recorded: HashSet<u32> = ledger::scan(session.home.path())
            .iter()
            .filter_map(|s| s.pid)
            .collect();

        for process in procindex::list_tagged_processes() {
            if process.session_id.as_deref() != Some(session.session_id.as_str()) {
                continue;
            }
            if recorded.contains(&process.pid) {
                continue;
            }
            warn!(
                pid = process.pid,
                service = ?process.service_id,
                "tagged child without ledger record; terminating"
            );
            if let Err(err) = spawner::kill_pid(process.pid).await {
                summary.push_issue(
                    format!("pid {}", process.pid),
                    format!("untracked child kill failed: {err}"),
                );
            } else {
                summary.stopped += 1;
            }
        }
    }

    fn rewrite_pid_file(&self, session: &Session, summary: &mut PassSummary) {
        let pids: Vec<u32> = ledger::scan(session.home.path())
            .iter()
            .filter(|s| s.alive && !s.is_foreign(&session.owner_token))
            .filter_map(|s| s.pid)
            .collect();

        if let Err(err) = ledger::write_pid_file(&session.home, &pids) {
            summary.push_issue(PID_FILE_SUBJECT, err.to_string());
        }
    }

    /// Stop everything this session owns. Used by the cancellation path
    /// when `kill_all_on_exit` is set.
    pub async fn kill_owned(&mut self) -> KillCounts {
        let Some(session) = self.session.clone() else {
            return KillCounts::default();
        };
        kill_session(session.home.path(), KillOptions::default()).await
    }

    /// List ledger records under a session home or ledger root.
    #[must_use]
    pub fn list_session_states(home: &Path) -> Vec<SpawnedState> {
        let resolved = ledger::resolve_session_home(home);
        ledger::scan(resolved.path())
    }

    /// List processes tagged as owned by db-yard.
    #[must_use]
    pub fn list_tagged_processes() -> Vec<TaggedProcess> {
        procindex::list_tagged_processes()
    }

    /// Diff the tag index against the ledger under `home`.
    #[must_use]
    pub fn reconcile_report(home: &Path) -> DiscrepancyReport {
        let resolved = ledger::resolve_session_home(home);
        let states = ledger::scan(resolved.path());
        let tagged = procindex::list_tagged_processes();
        reconcile::report_discrepancies(&states, &tagged)
    }
}

const PID_FILE_SUBJECT: &str = "spawned-pids.txt";

/// Stop every pid recorded under `home`, remove the context files, and
/// optionally remove the session directory.
pub async fn kill_session(home: &Path, options: KillOptions) -> KillCounts {
    let resolved = ledger::resolve_session_home(home);
    let mut counts = KillCounts::default();

    let mut pids: Vec<u32> = ledger::read_pid_file(&resolved);
    let states = ledger::scan(resolved.path());
    pids.extend(states.iter().filter_map(|s| s.pid));
    pids.sort_unstable();
    pids.dedup();

    for pid in pids {
        match spawner::kill_pid(pid).await {
            Ok(spawner::KillOutcome::AlreadyGone) => counts.already_gone += 1,
            Ok(_) => counts.killed += 1,
            Err(err) => {
                warn!(pid, error = %err, "kill failed");
                counts.errors += 1;
            }
        }
    }

    for state in &states {
        if ledger::remove_context(&state.context_path).is_ok() {
            counts.contexts_removed += 1;
        }
    }

    if options.clean {
        if let Err(err) = std::fs::remove_dir_all(resolved.path()) {
            warn!(home = %resolved.path().display(), error = %err, "clean failed");
        }
    } else if let Err(err) = ledger::write_pid_file(&resolved, &[]) {
        warn!(error = %err, "pid file rewrite failed");
    }

    info!(%counts, home = %resolved.path().display(), "kill finished");
    counts
}
