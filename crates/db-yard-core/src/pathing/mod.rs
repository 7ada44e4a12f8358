//! Path and URL utilities.
//!
//! Slash normalization, proxy-prefix derivation, best-matching-root
//! selection, and lexical path containment. Everything here is pure: no
//! filesystem access, so identifiers derived from paths are stable across
//! runs and platforms.

use std::path::{Component, Path, PathBuf};

/// Normalize a path-ish string to forward slashes and collapse duplicate
/// separators.
#[must_use]
pub fn normalize_slashes(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut prev_slash = false;
    for ch in raw.chars() {
        let slash = ch == '/' || ch == '\\';
        if slash {
            if !prev_slash {
                out.push('/');
            }
        } else {
            out.push(ch);
        }
        prev_slash = slash;
    }
    out
}

/// Derive a proxy endpoint prefix from a path relative to its root.
///
/// The outermost extension of the final component is stripped, the result is
/// slash-normalized and given a leading `/`. An empty relative path yields
/// `"/"`. The result never ends with `/` unless it equals `/`, and the
/// function is a fixed point under repeated application.
#[must_use]
pub fn proxy_prefix_from_rel(rel: &str) -> String {
    let normalized = normalize_slashes(rel);
    let trimmed = normalized.trim_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }

    let mut parts: Vec<&str> = trimmed.split('/').filter(|p| !p.is_empty()).collect();
    let stripped;
    if let Some(last) = parts.pop() {
        stripped = strip_outer_extension(last);
        if stripped.is_empty() && parts.is_empty() {
            return "/".to_string();
        }
    } else {
        return "/".to_string();
    }

    let mut prefix = String::from("/");
    for part in &parts {
        prefix.push_str(part);
        prefix.push('/');
    }
    prefix.push_str(&stripped);
    if prefix.is_empty() {
        "/".to_string()
    } else {
        prefix
    }
}

/// Extensions that mark a component as a database file. Longest match is
/// stripped first so `x.sqlite.db` loses the whole compound suffix.
const DB_EXTENSIONS: [&str; 4] = [".sqlite.db", ".sqlite3", ".sqlite", ".db"];

/// Strip the outermost database extension of a single path component.
///
/// `app.sqlpage.db` becomes `app.sqlpage`; non-database suffixes are left
/// alone so repeated prefix derivation is stable.
fn strip_outer_extension(name: &str) -> String {
    for ext in DB_EXTENSIONS {
        if let Some(stem) = name.strip_suffix(ext) {
            if !stem.is_empty() {
                return stem.to_string();
            }
        }
    }
    name.to_string()
}

/// Pick the root with the longest absolute-path prefix of `path`.
///
/// Ties on prefix length resolve lexicographically so the choice is
/// deterministic regardless of iteration order.
#[must_use]
pub fn best_matching_root<'a>(path: &Path, roots: &'a [PathBuf]) -> Option<&'a PathBuf> {
    let mut best: Option<&'a PathBuf> = None;
    for root in roots {
        if !path.starts_with(root) {
            continue;
        }
        match best {
            None => best = Some(root),
            Some(current) => {
                let root_len = root.as_os_str().len();
                let current_len = current.as_os_str().len();
                if root_len > current_len || (root_len == current_len && root < current) {
                    best = Some(root);
                }
            }
        }
    }
    best
}

/// Path of `path` relative to `root`; falls back to the basename when the
/// path is outside every root.
#[must_use]
pub fn rel_to_root(path: &Path, root: &Path) -> PathBuf {
    path.strip_prefix(root).map_or_else(
        |_| PathBuf::from(path.file_name().unwrap_or(path.as_os_str())),
        Path::to_path_buf,
    )
}

/// Lexical containment check: does `candidate`, resolved against `base`,
/// stay inside `base`?
///
/// Rejects absolute candidates and any `..` traversal that would escape.
/// Used by the admin file endpoint before serving session files.
#[must_use]
pub fn contains_path(base: &Path, candidate: &str) -> Option<PathBuf> {
    let rel = Path::new(candidate);
    if rel.is_absolute() {
        return None;
    }

    let mut depth: i32 = 0;
    for component in rel.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    Some(base.join(rel))
}

/// Join a base URL and a path, collapsing the duplicate slash at the seam.
#[must_use]
pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.is_empty() || path == "/" {
        return format!("{base}/");
    }
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

/// 32-bit FNV-1a hash, used to stamp deterministic short ids into
/// generated filenames.
#[must_use]
pub fn fnv1a32(input: &str) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET;
    for byte in input.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Reduce a service id to a filename-safe form: alphanumerics, `-`, `_`
/// and `.` survive, everything else becomes `_`.
#[must_use]
pub fn safe_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_slashes() {
        assert_eq!(normalize_slashes("a//b\\c"), "a/b/c");
        assert_eq!(normalize_slashes("/a/b/"), "/a/b/");
        assert_eq!(normalize_slashes(""), "");
    }

    #[test]
    fn test_proxy_prefix_basic() {
        assert_eq!(proxy_prefix_from_rel("app.sqlpage.db"), "/app.sqlpage");
        assert_eq!(proxy_prefix_from_rel("sub/app.sqlpage.db"), "/sub/app.sqlpage");
        assert_eq!(proxy_prefix_from_rel("a/b/c.db"), "/a/b/c");
    }

    #[test]
    fn test_proxy_prefix_empty_is_root() {
        assert_eq!(proxy_prefix_from_rel(""), "/");
        assert_eq!(proxy_prefix_from_rel("/"), "/");
    }

    #[test]
    fn test_proxy_prefix_fixed_point() {
        for rel in [
            "app.sqlpage.db",
            "sub/x.db",
            "",
            "nested/deep/y.sqlite",
            "z.sqlite.db",
        ] {
            let once = proxy_prefix_from_rel(rel);
            assert_eq!(proxy_prefix_from_rel(&once), once, "not stable for {rel:?}");
        }
    }

    #[test]
    fn test_proxy_prefix_strips_compound_extension() {
        assert_eq!(proxy_prefix_from_rel("z.sqlite.db"), "/z");
        assert_eq!(proxy_prefix_from_rel("y.sqlite"), "/y");
    }

    #[test]
    fn test_proxy_prefix_no_trailing_slash() {
        let p = proxy_prefix_from_rel("sub/app.db");
        assert!(p.starts_with('/'));
        assert!(!p.ends_with('/'));
    }

    #[test]
    fn test_best_matching_root_longest_wins() {
        let roots = vec![PathBuf::from("/srv"), PathBuf::from("/srv/data")];
        let best = best_matching_root(Path::new("/srv/data/app.db"), &roots).unwrap();
        assert_eq!(best, &PathBuf::from("/srv/data"));
    }

    #[test]
    fn test_best_matching_root_tie_is_lexicographic() {
        let roots = vec![PathBuf::from("/bb"), PathBuf::from("/aa")];
        // Neither contains the path; no match at all.
        assert!(best_matching_root(Path::new("/cc/app.db"), &roots).is_none());
    }

    #[test]
    fn test_rel_to_root_fallback_is_basename() {
        let rel = rel_to_root(Path::new("/elsewhere/app.db"), Path::new("/srv"));
        assert_eq!(rel, PathBuf::from("app.db"));
    }

    #[test]
    fn test_contains_path_rejects_escape() {
        let base = Path::new("/var/lib/yard");
        assert!(contains_path(base, "a/b.json").is_some());
        assert!(contains_path(base, "a/../b.json").is_some());
        assert!(contains_path(base, "../escape").is_none());
        assert!(contains_path(base, "a/../../escape").is_none());
        assert!(contains_path(base, "/abs/path").is_none());
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://127.0.0.1:8080", "/app"), "http://127.0.0.1:8080/app");
        assert_eq!(join_url("http://127.0.0.1:8080/", "app"), "http://127.0.0.1:8080/app");
        assert_eq!(join_url("http://127.0.0.1:8080", "/"), "http://127.0.0.1:8080/");
    }

    #[test]
    fn test_fnv1a32_known_vectors() {
        // Standard FNV-1a test vectors.
        assert_eq!(fnv1a32(""), 0x811c_9dc5);
        assert_eq!(fnv1a32("a"), 0xe40c_292c);
        assert_eq!(fnv1a32("foobar"), 0xbf9c_f968);
    }

    #[test]
    fn test_safe_id() {
        assert_eq!(safe_id("sub/app.sqlpage"), "sub_app.sqlpage");
        assert_eq!(safe_id("a b:c"), "a_b_c");
    }
}
