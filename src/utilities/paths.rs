//! Filesystem layout helpers for the knowledge root and backup tree.

use std::path::{Component, Path, PathBuf};

use chrono::Utc;

/// Default knowledge root relative to the working directory.
pub const DEFAULT_KNOWLEDGE_ROOT: &str = "knowledge";

/// Default backup root relative to the working directory.
pub const DEFAULT_BACKUP_ROOT: &str = "backups";

/// Catalog file name inside the knowledge root.
pub const INDEX_FILE: &str = "index.json";

/// Proposals log file name inside the knowledge root.
pub const PROPOSALS_LOG_FILE: &str = "proposals_log.json";

/// Timestamped backup directory name, e.g. `20260801_142233`.
pub fn backup_dir_name() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Normalize a path without touching the filesystem, resolving `.` and `..`
/// components lexically. Absolute prefixes are preserved.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Resolve `candidate` against `root`, lexically.
///
/// Accepts three spellings of the same target: an absolute path, a path
/// already carrying the root (either the full root prefix or just the root
/// directory's name, as the evolution contract writes `knowledge/...`), and
/// a root-relative path.
fn rebase(root: &Path, candidate: &Path) -> PathBuf {
    let root = normalize(root);
    let candidate = normalize(candidate);
    if candidate.is_absolute() || candidate.starts_with(&root) {
        return candidate;
    }
    let stripped = match (root.file_name(), candidate.components().next()) {
        (Some(name), Some(Component::Normal(first))) if first == name => {
            candidate.components().skip(1).collect::<PathBuf>()
        }
        _ => candidate,
    };
    normalize(&root.join(stripped))
}

/// Whether `candidate` resolves to a location inside `root` (lexically).
///
/// Used to confine evolution writes to the knowledge root: any `..` escape or
/// absolute path outside the root is rejected before touching the disk.
pub fn is_within_root(root: &Path, candidate: &Path) -> bool {
    rebase(root, candidate).starts_with(normalize(root))
}

/// Strip `root` from `candidate`, returning the knowledge-relative path.
pub fn relative_to_root(root: &Path, candidate: &Path) -> Option<PathBuf> {
    rebase(root, candidate)
        .strip_prefix(normalize(root))
        .ok()
        .map(|p| p.to_path_buf())
}

/// Turn a free-form title into a slug suitable for a knowledge file name.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_dash = true;
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_root_accepts_plain_relative() {
        let root = Path::new("knowledge");
        assert!(is_within_root(root, Path::new("agents/research.md")));
        assert!(is_within_root(root, Path::new("knowledge/agents/research.md")));
    }

    #[test]
    fn test_within_root_rejects_escape() {
        let root = Path::new("knowledge");
        assert!(!is_within_root(root, Path::new("../config/agents.yaml")));
        assert!(!is_within_root(root, Path::new("agents/../../etc/passwd")));
        assert!(!is_within_root(root, Path::new("/etc/passwd")));
    }

    #[test]
    fn test_relative_to_root_strips_prefix() {
        let root = Path::new("knowledge");
        assert_eq!(
            relative_to_root(root, Path::new("knowledge/system/notes.md")),
            Some(PathBuf::from("system/notes.md"))
        );
        assert_eq!(
            relative_to_root(root, Path::new("system/notes.md")),
            Some(PathBuf::from("system/notes.md"))
        );
        assert_eq!(relative_to_root(root, Path::new("../outside.md")), None);
    }

    #[test]
    fn test_root_name_prefix_is_stripped_under_absolute_root() {
        let root = Path::new("/srv/okami/knowledge");
        assert_eq!(
            relative_to_root(root, Path::new("knowledge/agents/x.md")),
            Some(PathBuf::from("agents/x.md"))
        );
        assert!(is_within_root(root, Path::new("knowledge/agents/x.md")));
        assert!(!is_within_root(root, Path::new("../config/agents.yaml")));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("X guidance on Y"), "x-guidance-on-y");
        assert_eq!(slugify("  Weird -- punctuation!! "), "weird-punctuation");
        assert_eq!(slugify("***"), "untitled");
    }
}
