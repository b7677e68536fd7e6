//! Path handling shared by all backends.

use std::path::{Component, Path, PathBuf};

/// Resolve a caller-supplied path against the sandbox work dir.
pub fn resolve(work_dir: &Path, path: &str) -> PathBuf {
    let trimmed = path.trim();
    if trimmed.is_empty() || trimmed == "." {
        return work_dir.to_path_buf();
    }
    let candidate = Path::new(trimmed);
    if candidate.is_absolute() {
        return normalize(candidate);
    }
    normalize(&work_dir.join(candidate))
}

/// Lexically normalize `.` and `..` components without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
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

/// Render `path` relative to the work dir; paths outside it are kept absolute.
pub fn relative_to(work_dir: &Path, path: &Path) -> String {
    match path.strip_prefix(work_dir) {
        Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Ok(rel) => rel.to_string_lossy().into_owned(),
        Err(_) => path.to_string_lossy().into_owned(),
    }
}

/// Parent directory of an absolute path, if it has one besides `/`.
pub fn parent_dir(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| p.parent().is_some())
}

/// Path as a UTF-8 string for wire protocols and shell scripts.
pub fn to_wire(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_and_dot() {
        let root = Path::new("/home/user");
        assert_eq!(resolve(root, "."), PathBuf::from("/home/user"));
        assert_eq!(resolve(root, ""), PathBuf::from("/home/user"));
        assert_eq!(resolve(root, "a/b.txt"), PathBuf::from("/home/user/a/b.txt"));
        assert_eq!(resolve(root, "./a"), PathBuf::from("/home/user/a"));
        assert_eq!(resolve(root, "a/../b"), PathBuf::from("/home/user/b"));
    }

    #[test]
    fn test_resolve_absolute_passes_through() {
        let root = Path::new("/home/user");
        assert_eq!(resolve(root, "/etc/hosts"), PathBuf::from("/etc/hosts"));
    }

    #[test]
    fn test_relative_to() {
        let root = Path::new("/home/user");
        assert_eq!(relative_to(root, Path::new("/home/user/d/f")), "d/f");
        assert_eq!(relative_to(root, Path::new("/home/user")), ".");
        assert_eq!(relative_to(root, Path::new("/tmp/x")), "/tmp/x");
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(
            parent_dir(Path::new("/home/user/a.txt")),
            Some(Path::new("/home/user"))
        );
        assert_eq!(parent_dir(Path::new("/a.txt")), None);
    }
}
