//! Root-confined path resolution for the file tools (§4.D "Sandboxing").
//!
//! Normalizes by walking `Component`s (so it works for paths that don't
//! exist yet), then joins under the sandbox root and checks with
//! [`Path::starts_with`]. That check is component-wise, not string-wise,
//! so it is immune to the `/root` vs `/rootbar` partial-prefix bug — no
//! extra guard is needed beyond using `starts_with` as-is.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("path escapes the sandbox root: {0}")]
    Escape(String),
    #[error("failed to resolve sandbox root: {0}")]
    Root(String),
}

/// Collapses `.`/`..`/repeated separators without touching the filesystem,
/// so it works for write targets that don't exist yet.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolves `path_param` against `working_folder`, rejecting anything that
/// normalizes to outside the sandbox root.
pub fn resolve_path_under(
    working_folder: &Path,
    path_param: &str,
) -> Result<PathBuf, SandboxError> {
    let base = working_folder
        .canonicalize()
        .map_err(|e| SandboxError::Root(e.to_string()))?;

    let candidate = Path::new(path_param);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    };
    let normalized = normalize_path(&joined);

    if !normalized.starts_with(&base) {
        return Err(SandboxError::Escape(path_param.to_string()));
    }

    match normalized.canonicalize() {
        Ok(canon) if canon.starts_with(&base) => Ok(canon),
        Ok(canon) => Err(SandboxError::Escape(canon.display().to_string())),
        // Target doesn't exist yet (write targets, new files): the
        // normalized, already-validated path is the answer.
        Err(_) => Ok(normalized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn rejects_dot_dot_escape() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_path_under(dir.path(), "../outside.txt");
        assert!(err.is_err());
    }

    #[test]
    fn rejects_partial_prefix_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let sibling = dir.path().join("rootbar");
        fs::create_dir(&root).unwrap();
        fs::create_dir(&sibling).unwrap();
        fs::write(sibling.join("secret.txt"), b"nope").unwrap();

        let escape = format!("../{}/secret.txt", sibling.file_name().unwrap().to_str().unwrap());
        let err = resolve_path_under(&root, &escape);
        assert!(err.is_err());
    }

    #[test]
    fn allows_nested_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hi").unwrap();
        let resolved = resolve_path_under(dir.path(), "a.txt").unwrap();
        assert!(resolved.ends_with("a.txt"));
    }

    #[test]
    fn allows_nonexistent_write_target() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_path_under(dir.path(), "new/nested/file.txt").unwrap();
        assert!(resolved.starts_with(dir.path().canonicalize().unwrap()));
    }
}
