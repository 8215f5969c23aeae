//! Path containment for everything served or loaded from the files root.

use std::path::{Component, Path, PathBuf};

/// Join `path` onto `root` and normalise it lexically, following symlinks for paths that exist.
/// Returns `None` if the result is not inside `root`.
///
/// `root` is expected to be canonical. A leading `/` on `path` is ignored, so URL paths can be
/// passed directly.
pub fn contain(root: &Path, path: &str) -> Option<PathBuf> {
    let mut resolved = root.to_path_buf();
    for component in Path::new(path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if !resolved.starts_with(root) {
        return None;
    }
    match resolved.canonicalize() {
        Ok(real) if real.starts_with(root) => Some(real),
        Ok(_) => None,
        Err(_) => Some(resolved),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn keeps_paths_inside_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::write(root.join("index.html"), "hi").unwrap();

        assert_eq!(contain(&root, "/index.html"), Some(root.join("index.html")));
        assert_eq!(contain(&root, "a/../index.html"), Some(root.join("index.html")));
        assert_eq!(contain(&root, "missing/x"), Some(root.join("missing/x")));
        assert_eq!(contain(&root, ""), Some(root.clone()));
    }

    #[test]
    fn rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("files");
        fs::create_dir(&root).unwrap();
        let root = root.canonicalize().unwrap();
        fs::write(dir.path().join("secret"), "s").unwrap();

        for p in [
            "../secret",
            "/../secret",
            "a/../../secret",
            "../../../../../../etc/passwd",
            "../files-other/x",
        ] {
            assert_eq!(contain(&root, p), None, "{p}");
        }
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_escape() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("files");
        fs::create_dir(&root).unwrap();
        let root = root.canonicalize().unwrap();
        fs::write(dir.path().join("secret"), "s").unwrap();
        std::os::unix::fs::symlink(dir.path().join("secret"), root.join("link")).unwrap();

        assert_eq!(contain(&root, "link"), None);
    }
}
