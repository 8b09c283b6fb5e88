use std::path::{Component, Path, PathBuf};

/// Whether a command token should be treated as a filesystem path.
pub fn token_is_path(token: &str) -> bool {
    if token.starts_with('-') {
        return false;
    }
    token.starts_with(['.', '/', '~']) || token.contains('/')
}

fn expand_home(raw: &str) -> PathBuf {
    if raw == "~" || raw.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(raw.trim_start_matches('~').trim_start_matches('/'));
        }
    }
    PathBuf::from(raw)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize as far as the filesystem allows: the longest existing ancestor
/// is resolved (following symlinks) and the rest is appended lexically.
fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut resolved = canonical;
            for part in rest.iter().rev() {
                resolved.push(part);
            }
            return resolved;
        }
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name);
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// Absolute form of `raw` as seen from `root`, with `~` expanded.
pub fn resolve(root: &Path, raw: &str) -> PathBuf {
    let expanded = expand_home(raw);
    let joined = if expanded.is_absolute() {
        expanded
    } else {
        root.join(expanded)
    };
    resolve_existing_prefix(&normalize(&joined))
}

/// `root` must already be canonical.
pub fn within_root(root: &Path, raw: &str) -> bool {
    resolve(root, raw).starts_with(root)
}

/// Canonical form of a workspace root, or the path unchanged when it does not exist.
pub fn canonical_root(root: &Path) -> PathBuf {
    root.canonicalize().unwrap_or_else(|_| normalize(root))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_token_detection() {
        assert!(token_is_path("./a.txt"));
        assert!(token_is_path("/etc/passwd"));
        assert!(token_is_path("~"));
        assert!(token_is_path("src/lib.rs"));
        assert!(token_is_path(".."));
        assert!(!token_is_path("-la"));
        assert!(!token_is_path("--file=/etc/passwd"));
        assert!(!token_is_path("ls"));
    }

    #[test]
    fn relative_paths_resolve_inside_root() {
        let root = canonical_root(&std::env::temp_dir());
        assert!(within_root(&root, "./new/file.txt"));
        assert!(within_root(&root, "a/b/../c"));
        assert!(within_root(&root, "."));
    }

    #[test]
    fn escapes_are_detected() {
        let root = canonical_root(&std::env::temp_dir()).join("conductor-paths-test");
        assert!(!within_root(&root, "../outside"));
        assert!(!within_root(&root, "/etc/passwd"));
        assert!(!within_root(&root, "a/../../b"));
    }
}
