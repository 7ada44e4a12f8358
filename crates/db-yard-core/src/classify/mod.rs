//! Classifier module.
//!
//! Decides whether a discovered candidate is an exposable service and which
//! driver kind applies. Cheap tests run first (extension), then SQLite
//! files get two table-presence probes through a read-only connection.
//! Unreadable databases classify as [`ServiceKind::Other`] with an error
//! note; classification never aborts a pass.

use std::path::PathBuf;

use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::discovery::Candidate;
use crate::pathing;
use crate::sidecar::SidecarConfig;

/// Driver kind of a classified file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    /// SQLite database carrying a `sqlpage_files` table.
    Sqlpage,
    /// SQLite database carrying a `uniform_resource` table.
    Surveilr,
    /// Readable SQLite database with neither marker table; not exposable.
    PlainSqlite,
    /// Not a readable SQLite database.
    Other,
}

impl ServiceKind {
    /// Parse a sidecar driver override.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sqlpage" => Some(Self::Sqlpage),
            "surveilr" => Some(Self::Surveilr),
            _ => None,
        }
    }

    /// Whether this kind can be spawned as a service.
    #[must_use]
    pub const fn is_exposable(&self) -> bool {
        matches!(self, Self::Sqlpage | Self::Surveilr)
    }

    /// Stable wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlpage => "sqlpage",
            Self::Surveilr => "surveilr",
            Self::PlainSqlite => "plain-sqlite",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of file supplied the classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SupplierNature {
    /// A SQLite database file.
    Sqlite,
    /// Something else (or unreadable).
    Unknown,
}

impl SupplierNature {
    /// Stable wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Unknown => "unknown",
        }
    }
}

/// Result of classifying one candidate.
#[derive(Debug, Clone)]
pub struct Classification {
    /// Decided driver kind.
    pub kind: ServiceKind,

    /// Nature of the supplying file.
    pub nature: SupplierNature,

    /// Non-fatal note explaining an `Other` outcome.
    pub note: Option<String>,
}

/// A classified candidate that can be spawned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposableService {
    /// Stable identifier derived from the path relative to the
    /// best-matching root. Identical byte-for-byte across runs given the
    /// same roots and file path.
    pub id: String,

    /// Driver kind.
    pub kind: ServiceKind,

    /// Human-readable label (the file basename).
    pub label: String,

    /// Proxy endpoint prefix: leading `/`, extension stripped.
    pub proxy_endpoint_prefix: String,

    /// Absolute path of the originating database file.
    pub location: PathBuf,

    /// Size of the originating file at discovery time.
    pub size: u64,

    /// Modification time of the originating file, ms since epoch.
    pub mtime_ms: i64,

    /// Nature of the supplying file.
    pub nature: SupplierNature,
}

/// Classify a candidate file.
///
/// Extension gate first; files that look like SQLite get a read-only open
/// and two table probes: `uniform_resource` marks surveilr, otherwise
/// `sqlpage_files` marks sqlpage, otherwise the file is a plain SQLite
/// database. Open or query failures classify as `Other`, never an error.
#[must_use]
pub fn classify(candidate: &Candidate) -> Classification {
    let name = candidate.path.to_string_lossy();
    let looks_sqlite = [".db", ".sqlite", ".sqlite3"]
        .iter()
        .any(|ext| name.ends_with(ext));

    if !looks_sqlite {
        return Classification {
            kind: ServiceKind::Other,
            nature: SupplierNature::Unknown,
            note: Some("extension is not a known database extension".to_string()),
        };
    }

    match open_read_only(&candidate.path) {
        Ok(conn) => {
            let kind = if table_exists(&conn, "uniform_resource") {
                ServiceKind::Surveilr
            } else if table_exists(&conn, "sqlpage_files") {
                ServiceKind::Sqlpage
            } else {
                ServiceKind::PlainSqlite
            };
            debug!(path = %candidate.path.display(), kind = %kind, "classified");
            Classification {
                kind,
                nature: SupplierNature::Sqlite,
                note: None,
            }
        }
        Err(err) => Classification {
            kind: ServiceKind::Other,
            nature: SupplierNature::Unknown,
            note: Some(format!("unreadable database: {err}")),
        },
    }
}

/// Read the optional `.db-yard` sidecar table.
///
/// A missing table or unreadable database yields an empty config.
#[must_use]
pub fn load_sidecar(candidate: &Candidate) -> SidecarConfig {
    let mut config = SidecarConfig::default();

    let Ok(conn) = open_read_only(&candidate.path) else {
        return config;
    };
    if !table_exists(&conn, ".db-yard") {
        return config;
    }

    let Ok(mut stmt) = conn.prepare("SELECT key, value FROM \".db-yard\"") else {
        return config;
    };
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    });
    if let Ok(rows) = rows {
        for row in rows.flatten() {
            config.insert_raw(row.0, &row.1);
        }
    }
    config
}

/// Resolve a classified candidate into an exposable service, or nothing.
///
/// `PlainSqlite` and `Other` yield `None`. The id derives from the path
/// relative to the best-matching root (longest prefix, lexicographic
/// tie-break), falling back to the basename; a sidecar `instance.id`
/// overrides it. The sidecar `driver` key overrides the classified kind.
#[must_use]
pub fn to_exposable(
    classification: &Classification,
    candidate: &Candidate,
    sidecar: &SidecarConfig,
    roots: &[PathBuf],
) -> Option<ExposableService> {
    let kind = sidecar
        .driver_override()
        .and_then(ServiceKind::from_name)
        .unwrap_or(classification.kind);

    if !kind.is_exposable() {
        return None;
    }

    let root = pathing::best_matching_root(&candidate.path, roots);
    let rel = root.map_or_else(
        || {
            PathBuf::from(
                candidate
                    .path
                    .file_name()
                    .unwrap_or(candidate.path.as_os_str()),
            )
        },
        |root| pathing::rel_to_root(&candidate.path, root),
    );
    let rel_str = pathing::normalize_slashes(&rel.to_string_lossy());

    let id = sidecar
        .instance_id()
        .map_or_else(|| rel_str.clone(), ToString::to_string);

    let label = candidate
        .path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| id.clone());

    Some(ExposableService {
        id,
        kind,
        label,
        proxy_endpoint_prefix: pathing::proxy_prefix_from_rel(&rel_str),
        location: candidate.path.clone(),
        size: candidate.size,
        mtime_ms: candidate.mtime_ms,
        nature: classification.nature,
    })
}

fn open_read_only(path: &std::path::Path) -> Result<Connection, rusqlite::Error> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
}

fn table_exists(conn: &Connection, table: &str) -> bool {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |_| Ok(()),
    )
    .is_ok()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tempfile::TempDir;

    use super::*;

    fn make_db(dir: &Path, name: &str, schema: &str) -> Candidate {
        let path = dir.join(name);
        let conn = Connection::open(&path).unwrap();
        if !schema.is_empty() {
            conn.execute_batch(schema).unwrap();
        }
        drop(conn);
        let meta = std::fs::metadata(&path).unwrap();
        Candidate {
            path,
            size: meta.len(),
            mtime_ms: 0,
            root: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_classify_sqlpage() {
        let dir = TempDir::new().unwrap();
        let candidate = make_db(
            dir.path(),
            "app.db",
            "CREATE TABLE sqlpage_files (path TEXT, contents BLOB);",
        );
        let c = classify(&candidate);
        assert_eq!(c.kind, ServiceKind::Sqlpage);
        assert_eq!(c.nature, SupplierNature::Sqlite);
    }

    #[test]
    fn test_classify_surveilr_wins_over_sqlpage() {
        let dir = TempDir::new().unwrap();
        let candidate = make_db(
            dir.path(),
            "both.db",
            "CREATE TABLE uniform_resource (uri TEXT); CREATE TABLE sqlpage_files (path TEXT);",
        );
        assert_eq!(classify(&candidate).kind, ServiceKind::Surveilr);
    }

    #[test]
    fn test_classify_plain_sqlite_not_exposable() {
        let dir = TempDir::new().unwrap();
        let candidate = make_db(dir.path(), "plain.db", "CREATE TABLE t (x);");
        let c = classify(&candidate);
        assert_eq!(c.kind, ServiceKind::PlainSqlite);
        assert!(!c.kind.is_exposable());
    }

    #[test]
    fn test_classify_garbage_is_other_with_note() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.db");
        std::fs::write(&path, b"this is not a sqlite file at all............").unwrap();
        let candidate = Candidate {
            path,
            size: 44,
            mtime_ms: 0,
            root: dir.path().to_path_buf(),
        };
        let c = classify(&candidate);
        assert_eq!(c.kind, ServiceKind::Other);
        assert!(c.note.is_some());
    }

    #[test]
    fn test_sidecar_roundtrip() {
        let dir = TempDir::new().unwrap();
        let candidate = make_db(
            dir.path(),
            "cfg.db",
            "CREATE TABLE sqlpage_files (path TEXT);
             CREATE TABLE \".db-yard\" (key TEXT, value TEXT);
             INSERT INTO \".db-yard\" VALUES ('driver', 'surveilr'), ('instance.id', 'alpha');",
        );
        let sidecar = load_sidecar(&candidate);
        assert_eq!(sidecar.driver_override(), Some("surveilr"));
        assert_eq!(sidecar.instance_id(), Some("alpha"));
    }

    #[test]
    fn test_missing_sidecar_is_empty() {
        let dir = TempDir::new().unwrap();
        let candidate = make_db(dir.path(), "bare.db", "CREATE TABLE t (x);");
        assert!(load_sidecar(&candidate).is_empty());
    }

    #[test]
    fn test_to_exposable_id_and_prefix() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir_all(&sub).unwrap();
        let candidate = make_db(&sub, "app.sqlpage.db", "CREATE TABLE sqlpage_files (path TEXT);");
        let classification = classify(&candidate);
        let roots = vec![dir.path().to_path_buf()];

        let service =
            to_exposable(&classification, &candidate, &SidecarConfig::default(), &roots).unwrap();
        assert_eq!(service.id, "sub/app.sqlpage.db");
        assert_eq!(service.proxy_endpoint_prefix, "/sub/app.sqlpage");
        assert_eq!(service.label, "app.sqlpage.db");
    }

    #[test]
    fn test_to_exposable_sidecar_overrides() {
        let dir = TempDir::new().unwrap();
        let candidate = make_db(dir.path(), "x.db", "CREATE TABLE t (y);");
        let classification = classify(&candidate);
        assert_eq!(classification.kind, ServiceKind::PlainSqlite);

        let mut sidecar = SidecarConfig::default();
        sidecar.insert_raw("driver", "sqlpage");
        sidecar.insert_raw("instance.id", "forced");

        let roots = vec![dir.path().to_path_buf()];
        let service = to_exposable(&classification, &candidate, &sidecar, &roots).unwrap();
        assert_eq!(service.kind, ServiceKind::Sqlpage);
        assert_eq!(service.id, "forced");
    }

    #[test]
    fn test_plain_and_other_yield_nothing() {
        let dir = TempDir::new().unwrap();
        let candidate = make_db(dir.path(), "p.db", "CREATE TABLE t (y);");
        let classification = classify(&candidate);
        let roots = vec![dir.path().to_path_buf()];
        assert!(to_exposable(&classification, &candidate, &SidecarConfig::default(), &roots)
            .is_none());
    }
}
