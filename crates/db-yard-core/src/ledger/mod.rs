//! Ledger module.
//!
//! The filesystem is the control plane: a ledger root holds session
//! directories, each with an owner token, a pid-file, per-service context
//! manifests, and the children's log files. Context and pid-file writes are
//! atomic (temp file + rename) so readers never observe a torn manifest.
//!
//! Layout:
//!
//! ```text
//! <ledgerRoot>/
//!   .current-session                 # <sessionName>\n
//!   <sessionName>/                   # sortable timestamp
//!     .db-yard.owner-token
//!     spawned-pids.txt
//!     <rel/path/to/db>.context.json
//!     <rel/path/to/db>.stdout.log
//!     <rel/path/to/db>.stderr.log
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::classify::ExposableService;
use crate::driver::SpawnPlan;
use crate::pathing;
use crate::sidecar::SidecarConfig;
use crate::spawner;

/// Name of the pointer file at the ledger root.
pub const CURRENT_SESSION_FILE: &str = ".current-session";
/// Name of the per-session owner token file.
pub const OWNER_TOKEN_FILE: &str = ".db-yard.owner-token";
/// Name of the per-session pid-file.
pub const PID_FILE: &str = "spawned-pids.txt";
/// Suffix of context manifests.
pub const CONTEXT_SUFFIX: &str = ".context.json";

/// Ledger errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Filesystem operation failed.
    #[error("ledger I/O at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A manifest could not be serialized.
    #[error("failed to serialize context: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> LedgerError {
    LedgerError::Io {
        path: path.into(),
        source,
    }
}

/// One supervisor run's identity and its directory under the ledger root.
#[derive(Debug, Clone)]
pub struct Session {
    /// Unique id of this run.
    pub session_id: String,

    /// Hostname the supervisor runs on.
    pub host: String,

    /// When the session started.
    pub started_at: DateTime<Utc>,

    /// The session directory.
    pub home: SessionHome,

    /// Token proving ownership of records this session writes.
    pub owner_token: String,
}

/// A session directory under the ledger root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHome {
    path: PathBuf,
}

impl SessionHome {
    /// Wrap an existing directory as a session home.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The session directory name.
    #[must_use]
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Read this home's owner token, if present.
    #[must_use]
    pub fn owner_token(&self) -> Option<String> {
        std::fs::read_to_string(self.path.join(OWNER_TOKEN_FILE))
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// The pid-file path.
    #[must_use]
    pub fn pid_file(&self) -> PathBuf {
        self.path.join(PID_FILE)
    }
}

/// Create a fresh session under `ledger_root`.
///
/// Writes the session directory (named with a sortable UTC timestamp,
/// suffixed on collision), the owner token file, and repoints
/// `.current-session`.
///
/// # Errors
///
/// Returns [`LedgerError::Io`] when the directory tree cannot be created.
pub fn create_session(ledger_root: &Path) -> Result<Session, LedgerError> {
    let started_at = Utc::now();
    let base = started_at.format("%Y-%m-%d-%H-%M-%S").to_string();

    std::fs::create_dir_all(ledger_root).map_err(|e| io_err(ledger_root, e))?;

    let mut name = base.clone();
    let mut attempt = 1u32;
    let home_path = loop {
        let candidate = ledger_root.join(&name);
        match std::fs::create_dir(&candidate) {
            Ok(()) => break candidate,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                attempt += 1;
                name = format!("{base}.{attempt}");
            }
            Err(err) => return Err(io_err(candidate, err)),
        }
    };

    let owner_token = Uuid::new_v4().to_string();
    atomic_write(
        &home_path.join(OWNER_TOKEN_FILE),
        owner_token.as_bytes(),
    )?;
    atomic_write(
        &ledger_root.join(CURRENT_SESSION_FILE),
        format!("{name}\n").as_bytes(),
    )?;

    let session = Session {
        session_id: Uuid::new_v4().to_string(),
        host: hostname(),
        started_at,
        home: SessionHome::at(home_path),
        owner_token,
    };
    debug!(session = %session.home.name(), "created session home");
    Ok(session)
}

/// Read the `.current-session` pointer under a ledger root.
#[must_use]
pub fn current_session(ledger_root: &Path) -> Option<SessionHome> {
    let name = std::fs::read_to_string(ledger_root.join(CURRENT_SESSION_FILE)).ok()?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let path = ledger_root.join(name);
    path.is_dir().then(|| SessionHome::at(path))
}

/// Resolve a path the user gave to a session home.
///
/// A ledger root (a directory carrying `.current-session`) resolves to its
/// current session; anything else is taken as a session home directly.
#[must_use]
pub fn resolve_session_home(path: &Path) -> SessionHome {
    if path.join(CURRENT_SESSION_FILE).is_file() {
        if let Some(home) = current_session(path) {
            return home;
        }
    }
    SessionHome::at(path)
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown-host".to_string())
}

/// Write `bytes` to `path` atomically via a temp sibling and rename,
/// creating parent directories on demand.
///
/// # Errors
///
/// Returns [`LedgerError::Io`] on any filesystem failure.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), LedgerError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    std::fs::write(&tmp, bytes).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Context manifest schema
// ---------------------------------------------------------------------------

/// Session identity stamped into a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStamp {
    /// Session id.
    pub session_id: String,
    /// Hostname.
    pub host: String,
    /// Session start time.
    pub started_at: DateTime<Utc>,
}

/// Service identity stamped into a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStamp {
    /// Stable service id.
    pub id: String,
    /// Driver kind name.
    pub kind: String,
    /// Human-readable label.
    pub label: String,
    /// Proxy endpoint prefix.
    pub proxy_endpoint_prefix: String,
    /// Joined base URL + prefix.
    pub upstream_url: String,
}

/// Source file description stamped into a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupplierStamp {
    /// Absolute path of the source database.
    pub location: PathBuf,
    /// Size at spawn/refresh time.
    pub size: u64,
    /// Modification time in ms since epoch.
    pub mtime: i64,
    /// Driver kind name.
    pub kind: String,
    /// Supplier nature name.
    pub nature: String,
}

/// Listen address stamped into a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenStamp {
    /// Bind host.
    pub host: String,
    /// Bound port.
    pub port: u16,
    /// `http://host:port`.
    pub base_url: String,
    /// URL probed for reachability.
    pub probe_url: String,
}

/// Spawn outcome stamped into a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnStamp {
    /// Child pid, alive at write time.
    pub pid: u32,
    /// The executed plan.
    pub plan: SpawnPlan,
}

/// File locations stamped into a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathsStamp {
    /// Absolute path of the manifest itself.
    pub context: PathBuf,
    /// Child stdout log.
    pub stdout: PathBuf,
    /// Child stderr log.
    pub stderr: PathBuf,
}

/// Ownership stamped into a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerStamp {
    /// The writing session's token.
    pub owner_token: String,
    /// The supervisor's own pid.
    pub supervisor_pid: u32,
    /// Hostname.
    pub host: String,
    /// Spawn instant, ms since epoch.
    pub started_at_ms: i64,
}

/// The durable manifest of one running service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnedContext {
    /// Spawn time.
    pub started_at: DateTime<Utc>,
    /// Session identity.
    pub session: SessionStamp,
    /// Service identity.
    pub service: ServiceStamp,
    /// Source file description.
    pub supplier: SupplierStamp,
    /// Listen address.
    pub listen: ListenStamp,
    /// Spawn outcome.
    pub spawned: SpawnStamp,
    /// File locations.
    pub paths: PathsStamp,
    /// Ownership.
    pub owner: OwnerStamp,
    /// Sidecar snapshot, when the source carried one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_yard_config: Option<SidecarConfig>,
    /// User-specified SQL snapshots keyed by query text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spawned_ctx: Option<BTreeMap<String, serde_json::Value>>,
    /// Last time a reconciliation pass saw the service desired and alive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at_ms: Option<i64>,
}

/// The context/log file trio for one service under a session home.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextPaths {
    /// Manifest path.
    pub context: PathBuf,
    /// Stdout log path.
    pub stdout: PathBuf,
    /// Stderr log path.
    pub stderr: PathBuf,
}

/// Compute the manifest and log paths for a service.
///
/// The source file's path relative to its best-matching root is mirrored
/// under the session home; the manifest is `<basename>.context.json`. When
/// a sidecar id override detaches the id from the relative path, the
/// deterministic 32-bit id hash joins the filename so two services never
/// share a manifest.
#[must_use]
pub fn context_paths(
    home: &SessionHome,
    service: &ExposableService,
    roots: &[PathBuf],
) -> ContextPaths {
    let rel = pathing::best_matching_root(&service.location, roots).map_or_else(
        || {
            PathBuf::from(
                service
                    .location
                    .file_name()
                    .unwrap_or(service.location.as_os_str()),
            )
        },
        |root| pathing::rel_to_root(&service.location, root),
    );

    let rel_str = pathing::normalize_slashes(&rel.to_string_lossy());
    let dir = rel.parent().map_or_else(
        || home.path().to_path_buf(),
        |parent| home.path().join(parent),
    );
    let basename = rel
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| service.id.clone());

    let stem = if service.id == rel_str {
        basename
    } else {
        format!("{basename}.{:08x}", pathing::fnv1a32(&service.id))
    };

    ContextPaths {
        context: dir.join(format!("{stem}{CONTEXT_SUFFIX}")),
        stdout: dir.join(format!("{stem}.stdout.log")),
        stderr: dir.join(format!("{stem}.stderr.log")),
    }
}

/// Write a manifest atomically to its own `paths.context` location.
///
/// # Errors
///
/// Returns [`LedgerError::Serialize`] or [`LedgerError::Io`].
pub fn write_context(context: &SpawnedContext) -> Result<(), LedgerError> {
    let bytes = serde_json::to_vec_pretty(context)?;
    atomic_write(&context.paths.context, &bytes)
}

/// Remove a manifest; a missing file is a success.
///
/// # Errors
///
/// Returns [`LedgerError::Io`] for failures other than the file being gone.
pub fn remove_context(path: &Path) -> Result<(), LedgerError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(path, err)),
    }
}

// ---------------------------------------------------------------------------
// Pid-file
// ---------------------------------------------------------------------------

/// Rewrite the pid-file as the sorted, deduplicated pid list.
///
/// Content identical to what is already on disk is not rewritten.
///
/// # Errors
///
/// Returns [`LedgerError::Io`] on write failure.
pub fn write_pid_file(home: &SessionHome, pids: &[u32]) -> Result<(), LedgerError> {
    let mut sorted: Vec<u32> = pids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let content = sorted
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ");

    let path = home.pid_file();
    if let Ok(existing) = std::fs::read_to_string(&path) {
        if existing == content {
            return Ok(());
        }
    }
    atomic_write(&path, content.as_bytes())
}

/// Read the pid-file; missing or malformed entries are dropped.
#[must_use]
pub fn read_pid_file(home: &SessionHome) -> Vec<u32> {
    std::fs::read_to_string(home.pid_file())
        .map(|content| {
            content
                .split_whitespace()
                .filter_map(|tok| tok.parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Scan
// ---------------------------------------------------------------------------

/// One scanned ledger record with liveness decoration.
#[derive(Debug, Clone, Serialize)]
pub struct SpawnedState {
    /// Path of the manifest.
    pub context_path: PathBuf,

    /// Parsed manifest; `None` when the record is broken.
    pub context: Option<SpawnedContext>,

    /// The recorded pid, when parseable.
    pub pid: Option<u32>,

    /// Whether the recorded pid is alive right now.
    pub alive: bool,

    /// Best-effort command line of the pid.
    pub cmdline: Option<String>,

    /// Why the record is broken, when it is.
    pub error: Option<String>,
}

impl SpawnedState {
    /// Whether this record was written under a different owner token.
    #[must_use]
    pub fn is_foreign(&self, owner_token: &str) -> bool {
        self.context
            .as_ref()
            .is_none_or(|c| c.owner.owner_token != owner_token)
    }

    /// The service id, when the record parses.
    #[must_use]
    pub fn service_id(&self) -> Option<&str> {
        self.context.as_ref().map(|c| c.service.id.as_str())
    }
}

/// Scan a session home (or a whole ledger root) for manifests.
///
/// Invalid JSON and missing pids yield broken items; the scan never
/// aborts. Results are sorted by manifest path.
#[must_use]
pub fn scan(root: &Path) -> Vec<SpawnedState> {
    let mut states = Vec::new();

    for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !path.to_string_lossy().ends_with(CONTEXT_SUFFIX) {
            continue;
        }
        states.push(scan_one(path));
    }

    states.sort_by(|a, b| a.context_path.cmp(&b.context_path));
    states
}

fn scan_one(path: &Path) -> SpawnedState {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            return SpawnedState {
                context_path: path.to_path_buf(),
                context: None,
                pid: None,
                alive: false,
                cmdline: None,
                error: Some(format!("unreadable: {err}")),
            };
        }
    };

    match serde_json::from_str::<SpawnedContext>(&raw) {
        Ok(context) => {
            let pid = context.spawned.pid;
            let alive = spawner::is_pid_alive(pid);
            SpawnedState {
                context_path: path.to_path_buf(),
                context: Some(context),
                pid: Some(pid),
                alive,
                cmdline: alive.then(|| spawner::process_cmdline(pid)).flatten(),
                error: None,
            }
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "broken context record");
            SpawnedState {
                context_path: path.to_path_buf(),
                context: None,
                pid: None,
                alive: false,
                cmdline: None,
                error: Some(format!("invalid context JSON: {err}")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::classify::{ServiceKind, SupplierNature};

    use super::*;

    fn sample_service(location: &Path) -> ExposableService {
        ExposableService {
            id: "app.db".to_string(),
            kind: ServiceKind::Sqlpage,
            label: "app.db".to_string(),
            proxy_endpoint_prefix: "/app".to_string(),
            location: location.to_path_buf(),
            size: 10,
            mtime_ms: 1000,
            nature: SupplierNature::Sqlite,
        }
    }

    fn sample_context(paths: ContextPaths, token: &str, pid: u32) -> SpawnedContext {
        SpawnedContext {
            started_at: Utc::now(),
            session: SessionStamp {
                session_id: "s1".to_string(),
                host: "test".to_string(),
                started_at: Utc::now(),
            },
            service: ServiceStamp {
                id: "app.db".to_string(),
                kind: "sqlpage".to_string(),
                label: "app.db".to_string(),
                proxy_endpoint_prefix: "/app".to_string(),
                upstream_url: "http://127.0.0.1:4100/app".to_string(),
            },
            supplier: SupplierStamp {
                location: PathBuf::from("/srv/app.db"),
                size: 10,
                mtime: 1000,
                kind: "sqlpage".to_string(),
                nature: "sqlite".to_string(),
            },
            listen: ListenStamp {
                host: "127.0.0.1".to_string(),
                port: 4100,
                base_url: "http://127.0.0.1:4100".to_string(),
                probe_url: "http://127.0.0.1:4100/".to_string(),
            },
            spawned: SpawnStamp {
                pid,
                plan: SpawnPlan {
                    command: "sqlpage".to_string(),
                    args: Vec::new(),
                    env: BTreeMap::new(),
                    cwd: None,
                },
            },
            paths: PathsStamp {
                context: paths.context,
                stdout: paths.stdout,
                stderr: paths.stderr,
            },
            owner: OwnerStamp {
                owner_token: token.to_string(),
                supervisor_pid: std::process::id(),
                host: "test".to_string(),
                started_at_ms: 0,
            },
            db_yard_config: None,
            spawned_ctx: None,
            last_seen_at_ms: None,
        }
    }

    #[test]
    fn test_create_session_writes_pointer_and_token() {
        let dir = TempDir::new().unwrap();
        let session = create_session(dir.path()).unwrap();

        let pointer = std::fs::read_to_string(dir.path().join(CURRENT_SESSION_FILE)).unwrap();
        assert_eq!(pointer.trim(), session.home.name());
        assert_eq!(session.home.owner_token().unwrap(), session.owner_token);
    }

    #[test]
    fn test_create_session_name_collision_gets_suffix() {
        let dir = TempDir::new().unwrap();
        let first = create_session(dir.path()).unwrap();
        let second = create_session(dir.path()).unwrap();
        assert_ne!(first.home.name(), second.home.name());
    }

    #[test]
    fn test_resolve_session_home_from_ledger_root() {
        let dir = TempDir::new().unwrap();
        let session = create_session(dir.path()).unwrap();
        let resolved = resolve_session_home(dir.path());
        assert_eq!(resolved.path(), session.home.path());

        // A session home resolves to itself.
        let direct = resolve_session_home(session.home.path());
        assert_eq!(direct.path(), session.home.path());
    }

    #[test]
    fn test_context_paths_mirror_relative_path() {
        let home = SessionHome::at("/ledger/2025-01-01-00-00-00");
        let roots = vec![PathBuf::from("/srv")];
        let mut service = sample_service(Path::new("/srv/sub/app.db"));
        service.id = "sub/app.db".to_string();

        let paths = context_paths(&home, &service, &roots);
        assert_eq!(
            paths.context,
            PathBuf::from("/ledger/2025-01-01-00-00-00/sub/app.db.context.json")
        );
        assert_eq!(
            paths.stdout,
            PathBuf::from("/ledger/2025-01-01-00-00-00/sub/app.db.stdout.log")
        );
    }

    #[test]
    fn test_context_paths_id_override_adds_hash() {
        let home = SessionHome::at("/ledger/s");
        let roots = vec![PathBuf::from("/srv")];
        let mut service = sample_service(Path::new("/srv/app.db"));
        service.id = "custom".to_string();

        let paths = context_paths(&home, &service, &roots);
        let name = paths.context.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("app.db."));
        assert!(name.ends_with(CONTEXT_SUFFIX));
        assert_ne!(name, format!("app.db{CONTEXT_SUFFIX}"));
    }

    #[test]
    fn test_context_roundtrip() {
        let dir = TempDir::new().unwrap();
        let paths = ContextPaths {
            context: dir.path().join("app.db.context.json"),
            stdout: dir.path().join("app.db.stdout.log"),
            stderr: dir.path().join("app.db.stderr.log"),
        };
        let context = sample_context(paths.clone(), "token", std::process::id());

        write_context(&context).unwrap();
        let raw = std::fs::read_to_string(&paths.context).unwrap();
        let reread: SpawnedContext = serde_json::from_str(&raw).unwrap();
        assert_eq!(reread, context);
    }

    #[test]
    fn test_context_json_uses_camel_case_keys() {
        let dir = TempDir::new().unwrap();
        let paths = ContextPaths {
            context: dir.path().join("a.context.json"),
            stdout: dir.path().join("a.stdout.log"),
            stderr: dir.path().join("a.stderr.log"),
        };
        let context = sample_context(paths.clone(), "token", 1);
        write_context(&context).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&paths.context).unwrap()).unwrap();
        assert!(value.get("startedAt").is_some());
        assert!(value["service"].get("proxyEndpointPrefix").is_some());
        assert!(value["owner"].get("ownerToken").is_some());
        assert!(value["owner"].get("startedAtMs").is_some());
    }

    #[test]
    fn test_pid_file_sorted_dedup_and_stable() {
        let dir = TempDir::new().unwrap();
        let home = SessionHome::at(dir.path());

        write_pid_file(&home, &[30, 10, 20, 10]).unwrap();
        let content = std::fs::read_to_string(home.pid_file()).unwrap();
        assert_eq!(content, "10 20 30");

        // Same set again must not change the file's mtime-relevant content.
        write_pid_file(&home, &[10, 20, 30]).unwrap();
        assert_eq!(std::fs::read_to_string(home.pid_file()).unwrap(), "10 20 30");
        assert_eq!(read_pid_file(&home), vec![10, 20, 30]);
    }

    #[test]
    fn test_scan_isolates_broken_records() {
        let dir = TempDir::new().unwrap();
        let good_paths = ContextPaths {
            context: dir.path().join("good.db.context.json"),
            stdout: dir.path().join("good.db.stdout.log"),
            stderr: dir.path().join("good.db.stderr.log"),
        };
        write_context(&sample_context(good_paths, "token", std::process::id())).unwrap();
        std::fs::write(dir.path().join("bad.db.context.json"), b"{ not json").unwrap();

        let states = scan(dir.path());
        assert_eq!(states.len(), 2);

        let broken: Vec<_> = states.iter().filter(|s| s.error.is_some()).collect();
        assert_eq!(broken.len(), 1);
        let good: Vec<_> = states.iter().filter(|s| s.error.is_none()).collect();
        assert_eq!(good.len(), 1);
        assert!(good[0].alive, "supervisor's own pid must read as alive");
    }

    #[test]
    fn test_foreign_detection() {
        let dir = TempDir::new().unwrap();
        let paths = ContextPaths {
            context: dir.path().join("a.context.json"),
            stdout: dir.path().join("a.stdout.log"),
            stderr: dir.path().join("a.stderr.log"),
        };
        write_context(&sample_context(paths, "theirs", 1)).unwrap();

        let states = scan(dir.path());
        assert!(states[0].is_foreign("ours"));
        assert!(!states[0].is_foreign("theirs"));
    }

    #[test]
    fn test_remove_context_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.context.json");
        std::fs::write(&path, b"{}").unwrap();
        remove_context(&path).unwrap();
        remove_context(&path).unwrap();
    }
}
