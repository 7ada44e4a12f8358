//! Discovery module.
//!
//! Walks watch roots, matches database globs, stats files, and yields
//! candidates. Filesystem errors are collected into a non-fatal issue list
//! so one unreadable directory never halts a pass, and the candidate list is
//! sorted by path so traversal order cannot leak into downstream
//! identifiers.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use glob::Pattern;
use serde::Serialize;
use walkdir::WalkDir;

/// Default glob set for database files.
pub const DEFAULT_GLOBS: [&str; 3] = ["**/*.db", "**/*.sqlite", "**/*.sqlite.db"];

/// A root directory the supervisor watches, with its glob set.
#[derive(Debug, Clone)]
pub struct WatchRoot {
    /// Absolute path of the root.
    pub path: PathBuf,

    /// Globs matched against paths relative to the root.
    pub globs: Vec<String>,
}

impl WatchRoot {
    /// Create a watch root with the default database globs.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            globs: DEFAULT_GLOBS.iter().map(ToString::to_string).collect(),
        }
    }

    /// Replace the glob set.
    #[must_use]
    pub fn with_globs<I, S>(mut self, globs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.globs = globs.into_iter().map(Into::into).collect();
        self
    }
}

/// A file encountered by discovery. Transient; lives only for one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Absolute path of the file.
    pub path: PathBuf,

    /// File size in bytes.
    pub size: u64,

    /// Modification time in milliseconds since the epoch.
    pub mtime_ms: i64,

    /// The watch root this candidate was found under.
    pub root: PathBuf,
}

/// A non-fatal problem encountered while walking a root.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryIssue {
    /// Path the problem occurred at, when known.
    pub path: Option<PathBuf>,

    /// Human-readable description.
    pub message: String,
}

/// Everything one discovery sweep produced.
#[derive(Debug, Default)]
pub struct DiscoveryOutcome {
    /// Files that matched a glob, sorted by path.
    pub candidates: Vec<Candidate>,

    /// Regular files seen but matched by no glob.
    pub unhandled: Vec<PathBuf>,

    /// Errors converted into report items.
    pub issues: Vec<DiscoveryIssue>,
}

/// Walk every root and collect candidates.
///
/// Missing roots, unreadable directories, and stat failures become
/// [`DiscoveryIssue`] entries; the sweep always completes. Only regular
/// files are emitted, never a path that does not exist on disk.
#[must_use]
pub fn discover(roots: &[WatchRoot]) -> DiscoveryOutcome {
    let mut outcome = DiscoveryOutcome::default();

    for root in roots {
        if !root.path.is_dir() {
            outcome.issues.push(DiscoveryIssue {
                path: Some(root.path.clone()),
                message: "watch root is not a directory".to_string(),
            });
            continue;
        }

        let patterns = compile_globs(&root.globs, &mut outcome.issues);

        for entry in WalkDir::new(&root.path).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    outcome.issues.push(DiscoveryIssue {
                        path: err.path().map(Path::to_path_buf),
                        message: err.to_string(),
                    });
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            // A symlinked file counts as its resolved target, so identity
            // follows the real location and the best-matching-root rule.
            let resolved;
            let path = if entry.path_is_symlink() {
                match std::fs::canonicalize(entry.path()) {
                    Ok(real) => {
                        resolved = real;
                        resolved.as_path()
                    }
                    Err(err) => {
                        outcome.issues.push(DiscoveryIssue {
                            path: Some(entry.path().to_path_buf()),
                            message: format!("broken symlink: {err}"),
                        });
                        continue;
                    }
                }
            } else {
                entry.path()
            };
            let rel = path.strip_prefix(&root.path).unwrap_or(path);
            let rel_str = rel.to_string_lossy();

            if !patterns.iter().any(|p| p.matches(&rel_str)) {
                outcome.unhandled.push(path.to_path_buf());
                continue;
            }

            match entry.metadata() {
                Ok(meta) => {
                    let mtime_ms = meta
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                        .and_then(|d| i64::try_from(d.as_millis()).ok())
                        .unwrap_or(0);

                    outcome.candidates.push(Candidate {
                        path: path.to_path_buf(),
                        size: meta.len(),
                        mtime_ms,
                        root: root.path.clone(),
                    });
                }
                Err(err) => {
                    outcome.issues.push(DiscoveryIssue {
                        path: Some(path.to_path_buf()),
                        message: format!("stat failed: {err}"),
                    });
                }
            }
        }
    }

    outcome.candidates.sort_by(|a, b| a.path.cmp(&b.path));
    outcome.candidates.dedup_by(|a, b| a.path == b.path);
    outcome.unhandled.sort();
    outcome
}

fn compile_globs(globs: &[String], issues: &mut Vec<DiscoveryIssue>) -> Vec<Pattern> {
    let mut patterns = Vec::with_capacity(globs.len());
    for raw in globs {
        match Pattern::new(raw) {
            Ok(p) => patterns.push(p),
            Err(err) => issues.push(DiscoveryIssue {
                path: None,
                message: format!("invalid glob {raw:?}: {err}"),
            }),
        }
    }
    patterns
}
