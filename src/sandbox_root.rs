//! Shared per-user transfer-root path sandboxing (spec §4.7 "Path
//! sandboxing"), reused by both the SFTP loop and the FTP listener
//! (SPEC_FULL.md "Supplemented features").
//!
//! All client-supplied paths are resolved relative to a transfer root:
//! absolute paths are rebased onto it, and any path whose resolved
//! components would climb above the root is rejected outright. This is
//! plain component-wise traversal, not `fs::canonicalize`, since the
//! target path may not exist yet (e.g. `MKD`/`STOR` of a new name).

use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathEscapesRoot;

impl std::fmt::Display for PathEscapesRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "path escapes the transfer root")
    }
}

impl std::error::Error for PathEscapesRoot {}

/// Resolves `client_path` (absolute or relative to `cwd`, itself root-
/// relative) against `root`, rejecting any `..` that would climb above
/// it. Returns the resolved absolute filesystem path under `root`.
pub fn resolve(root: &Path, cwd: &Path, client_path: &str) -> Result<PathBuf, PathEscapesRoot> {
    let input = Path::new(client_path);
    // Start from `cwd` for relative paths, from the root for absolute
    // ones — either way the accumulator below is root-relative.
    let mut stack: Vec<String> = if input.is_absolute() {
        Vec::new()
    } else {
        cwd.components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect()
    };

    for component in input.components() {
        match component {
            Component::Normal(s) => stack.push(s.to_string_lossy().into_owned()),
            Component::ParentDir => {
                if stack.pop().is_none() {
                    return Err(PathEscapesRoot);
                }
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }

    let mut resolved = root.to_path_buf();
    for part in stack {
        resolved.push(part);
    }
    Ok(resolved)
}

/// The root-relative virtual path (what a client should see as its
/// current location), given a resolved absolute filesystem path.
pub fn virtual_path(root: &Path, resolved: &Path) -> PathBuf {
    match resolved.strip_prefix(root) {
        Ok(rel) => Path::new("/").join(rel),
        Err(_) => PathBuf::from("/"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_resolves_under_cwd() {
        let root = Path::new("/srv/transfer");
        let resolved = resolve(root, Path::new("/"), "docs").unwrap();
        assert_eq!(resolved, Path::new("/srv/transfer/docs"));
    }

    #[test]
    fn absolute_path_is_rebased_onto_root() {
        let root = Path::new("/srv/transfer");
        let resolved = resolve(root, Path::new("/docs"), "/etc/passwd").unwrap();
        assert_eq!(resolved, Path::new("/srv/transfer/etc/passwd"));
    }

    #[test]
    fn dotdot_within_bounds_ascends_one_level() {
        let root = Path::new("/srv/transfer");
        let resolved = resolve(root, Path::new("/docs/sub"), "..").unwrap();
        assert_eq!(resolved, Path::new("/srv/transfer/docs"));
    }

    #[test]
    fn dotdot_escaping_root_is_rejected() {
        let root = Path::new("/srv/transfer");
        assert_eq!(resolve(root, Path::new("/"), "..").unwrap_err(), PathEscapesRoot);
    }

    #[test]
    fn deeply_nested_dotdot_escape_is_rejected() {
        let root = Path::new("/srv/transfer");
        assert_eq!(resolve(root, Path::new("/a/b"), "../../../../etc").unwrap_err(), PathEscapesRoot);
    }

    #[test]
    fn virtual_path_strips_root_prefix() {
        let root = Path::new("/srv/transfer");
        let v = virtual_path(root, Path::new("/srv/transfer/docs/file.txt"));
        assert_eq!(v, Path::new("/docs/file.txt"));
    }
}
