//! Process tag index.
//!
//! Enumerates operating-system processes that carry this supervisor's
//! identifying environment tags. The index is the authoritative source of
//! "processes owned by db-yard" and is deliberately independent of the
//! ledger: a tagged process missing from the ledger (or the reverse) is a
//! discrepancy the reconciler reports.
//!
//! Requires per-process environment visibility (`/proc/<pid>/environ`).

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::trace;

use crate::ledger::SpawnedContext;
use crate::spawner::{ENV_CONTEXT_PATH, ENV_SERVICE_ID, ENV_SESSION_ID};

/// One process observed to carry db-yard ownership tags.
#[derive(Debug, Clone, Serialize)]
pub struct TaggedProcess {
    /// Observed pid.
    pub pid: u32,

    /// `DB_YARD_SESSION_ID` tag, when present.
    pub session_id: Option<String>,

    /// `DB_YARD_SERVICE_ID` tag, when present.
    pub service_id: Option<String>,

    /// `DB_YARD_CONTEXT_PATH` tag (required for inclusion).
    pub context_path: PathBuf,

    /// Parsed context file, best effort.
    pub context: Option<SpawnedContext>,

    /// Best-effort command line.
    pub cmdline: Option<String>,

    /// Why enrichment is incomplete or inconsistent, when it is.
    pub issue: Option<String>,
}

/// Walk `/proc` and return every process tagged with
/// `DB_YARD_CONTEXT_PATH`, sorted by pid.
///
/// Processes we cannot inspect (permissions, races with exit) are simply
/// skipped; a tagged process whose context file is unreadable, unparseable,
/// or disagrees about the pid is returned with its `issue` field set.
#[must_use]
pub fn list_tagged_processes() -> Vec<TaggedProcess> {
    list_tagged_processes_in(Path::new("/proc"))
}

/// Testable variant of [`list_tagged_processes`] with an explicit proc
/// root.
#[must_use]
pub fn list_tagged_processes_in(proc_root: &Path) -> Vec<TaggedProcess> {
    let mut tagged = Vec::new();

    let Ok(entries) = std::fs::read_dir(proc_root) else {
        return tagged;
    };

    for entry in entries.filter_map(Result::ok) {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };

        let Some(env) = read_environ(&entry.path().join("environ")) else {
            continue;
        };
        let Some(context_path) = env_value(&env, ENV_CONTEXT_PATH) else {
            continue;
        };

        trace!(pid, context = %context_path, "found tagged process");
        tagged.push(enrich(
            pid,
            PathBuf::from(context_path),
            env_value(&env, ENV_SESSION_ID),
            env_value(&env, ENV_SERVICE_ID),
        ));
    }

    tagged.sort_by_key(|t| t.pid);
    tagged
}

fn enrich(
    pid: u32,
    context_path: PathBuf,
    session_id: Option<String>,
    service_id: Option<String>,
) -> TaggedProcess {
    let mut issue = None;
    let context = match std::fs::read_to_string(&context_path) {
        Ok(raw) => match serde_json::from_str::<SpawnedContext>(&raw) {
            Ok(context) => {
                if context.spawned.pid != pid {
                    issue = Some(format!(
                        "context records pid {} but process is {pid}; record is stale or rewritten",
                        context.spawned.pid
                    ));
                }
                Some(context)
            }
            Err(err) => {
                issue = Some(format!("context unparseable: {err}"));
                None
            }
        },
        Err(err) => {
            issue = Some(format!("context unreadable: {err}"));
            None
        }
    };

    TaggedProcess {
        pid,
        session_id,
        service_id,
        context_path,
        context,
        cmdline: crate::spawner::process_cmdline(pid),
        issue,
    }
}

fn read_environ(path: &Path) -> Option<Vec<(String, String)>> {
    let raw = std::fs::read(path).ok()?;
    let mut pairs = Vec::new();
    for chunk in raw.split(|b| *b == 0) {
        if chunk.is_empty() {
            continue;
        }
        let text = String::from_utf8_lossy(chunk);
        if let Some((key, value)) = text.split_once('=') {
            pairs.push((key.to_string(), value.to_string()));
        }
    }
    Some(pairs)
}

fn env_value(env: &[(String, String)], key: &str) -> Option<String> {
    env.iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn fake_proc_entry(root: &Path, pid: u32, env: &[(&str, &str)]) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        let mut blob = Vec::new();
        for (key, value) in env {
            blob.extend_from_slice(key.as_bytes());
            blob.push(b'=');
            blob.extend_from_slice(value.as_bytes());
            blob.push(0);
        }
        fs::write(dir.join("environ"), blob).unwrap();
    }

    #[test]
    fn test_untagged_processes_skipped() {
        let proc_root = TempDir::new().unwrap();
        fake_proc_entry(proc_root.path(), 100, &[("PATH", "/usr/bin")]);

        let tagged = list_tagged_processes_in(proc_root.path());
        assert!(tagged.is_empty());
    }

    #[test]
    fn test_tagged_process_with_missing_context_has_issue() {
        let proc_root = TempDir::new().unwrap();
        fake_proc_entry(
            proc_root.path(),
            200,
            &[
                (ENV_CONTEXT_PATH, "/nonexistent/ctx.context.json"),
                (ENV_SESSION_ID, "s1"),
                (ENV_SERVICE_ID, "svc"),
            ],
        );

        let tagged = list_tagged_processes_in(proc_root.path());
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].pid, 200);
        assert_eq!(tagged[0].session_id.as_deref(), Some("s1"));
        assert!(tagged[0].issue.as_deref().unwrap().contains("unreadable"));
    }

    #[test]
    fn test_pid_mismatch_flagged_not_fatal() {
        let proc_root = TempDir::new().unwrap();
        let ctx_dir = TempDir::new().unwrap();
        let ctx_path = ctx_dir.path().join("svc.context.json");

        // Minimal valid context recording a different pid.
        let json = serde_json::json!({
            "startedAt": "2025-01-01T00:00:00Z",
            "session": {"sessionId": "s1", "host": "h", "startedAt": "2025-01-01T00:00:00Z"},
            "service": {
                "id": "svc", "kind": "sqlpage", "label": "svc",
                "proxyEndpointPrefix": "/svc", "upstreamUrl": "http://127.0.0.1:1/svc"
            },
            "supplier": {"location": "/srv/svc.db", "size": 1, "mtime": 1, "kind": "sqlpage", "nature": "sqlite"},
            "listen": {"host": "127.0.0.1", "port": 1, "baseUrl": "http://127.0.0.1:1", "probeUrl": "http://127.0.0.1:1/"},
            "spawned": {"pid": 999, "plan": {"command": "sqlpage", "args": [], "env": {}}},
            "paths": {"context": ctx_path, "stdout": "/s.log", "stderr": "/e.log"},
            "owner": {"ownerToken": "t", "supervisorPid": 1, "host": "h", "startedAtMs": 0}
        });
        fs::write(&ctx_path, serde_json::to_vec(&json).unwrap()).unwrap();

        fake_proc_entry(
            proc_root.path(),
            300,
            &[(ENV_CONTEXT_PATH, ctx_path.to_str().unwrap())],
        );

        let tagged = list_tagged_processes_in(proc_root.path());
        assert_eq!(tagged.len(), 1);
        assert!(tagged[0].context.is_some());
        assert!(tagged[0].issue.as_deref().unwrap().contains("stale"));
    }

    #[test]
    fn test_sorted_by_pid() {
        let proc_root = TempDir::new().unwrap();
        for pid in [500u32, 100, 300] {
            fake_proc_entry(proc_root.path(), pid, &[(ENV_CONTEXT_PATH, "/x.context.json")]);
        }
        let tagged = list_tagged_processes_in(proc_root.path());
        let pids: Vec<_> = tagged.iter().map(|t| t.pid).collect();
        assert_eq!(pids, vec![100, 300, 500]);
    }
}
