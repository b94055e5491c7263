//! Path expansion, canonicalization, and read/write authorization.
//!
//! Every filesystem access in the runtime funnels through [`authorize`]; a
//! symlink-based escape here would undermine every other guarantee, so the
//! canonical form of the *target* is what gets compared against the allowed
//! roots, never the literal input.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use crate::error::Result;
use crate::error::SandboxErr;
use crate::error::SafeshErr;
use crate::policy::EffectivePolicy;

/// Which side of the permission table an access consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsOp {
    Read,
    Write,
}

/// Substitute the recognized placeholders in a path template.
///
/// Only `~` (leading component), `${CWD}`, and `${HOME}` are honored; any
/// other `${...}` is an error rather than being passed through, so a typo in
/// a config cannot silently widen or narrow a root.
pub fn expand(input: &str, cwd: &Path, home: Option<&Path>) -> Result<PathBuf> {
    let mut expanded = input.to_string();

    if expanded == "~" || expanded.starts_with("~/") {
        let home = home.ok_or_else(|| {
            SafeshErr::InvalidConfig(format!("cannot expand `~` in {input}: no home directory"))
        })?;
        let rest = expanded[1..].trim_start_matches('/');
        expanded = if rest.is_empty() {
            home.display().to_string()
        } else {
            home.join(rest).display().to_string()
        };
    }

    if expanded.contains("${CWD}") {
        expanded = expanded.replace("${CWD}", &cwd.display().to_string());
    }
    if expanded.contains("${HOME}") {
        let home = home.ok_or_else(|| {
            SafeshErr::InvalidConfig(format!(
                "cannot expand `${{HOME}}` in {input}: no home directory"
            ))
        })?;
        expanded = expanded.replace("${HOME}", &home.display().to_string());
    }

    if let Some(start) = expanded.find("${") {
        let placeholder = match expanded[start..].find('}') {
            Some(end) => expanded[start..start + end + 1].to_string(),
            None => expanded[start..].to_string(),
        };
        return Err(SafeshErr::UnknownPlaceholder(placeholder));
    }

    Ok(PathBuf::from(expanded))
}

/// Expand `input` and make it absolute against `cwd`.
pub fn resolve(input: &str, cwd: &Path, home: Option<&Path>) -> Result<PathBuf> {
    let expanded = expand(input, cwd, home)?;
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(cwd.join(expanded))
    }
}

/// Resolve `.` and `..` segments without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::ParentDir => {
                // Clamp at the root rather than escaping above it.
                if !out.pop() {
                    out.push(Component::RootDir);
                }
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize `abs`, following symlinks through every component that
/// exists on disk and normalizing the non-existing tail lexically.
///
/// On [`FsOp::Read`] the parent of the path must exist; on [`FsOp::Write`]
/// an arbitrarily deep missing tail is acceptable because the caller may be
/// about to create it.
pub fn canonicalize_for(abs: &Path, op: FsOp) -> Result<PathBuf> {
    let norm = normalize_lexically(abs);
    let (canon_prefix, tail) = split_existing_prefix(&norm)?;

    if op == FsOp::Read && tail.len() > 1 {
        return Err(SandboxErr::CanonicalizeFailed {
            path: abs.to_path_buf(),
            source: io::Error::new(io::ErrorKind::NotFound, "parent directory does not exist"),
        }
        .into());
    }

    let mut out = canon_prefix;
    for comp in tail {
        out.push(comp);
    }
    Ok(out)
}

/// Walk up from `norm` until a prefix canonicalizes, collecting the missing
/// components. `norm` must already be lexically normalized.
fn split_existing_prefix(norm: &Path) -> Result<(PathBuf, VecDeque<OsString>)> {
    let mut current = norm.to_path_buf();
    let mut tail = VecDeque::new();

    loop {
        match std::fs::canonicalize(&current) {
            Ok(canon) => return Ok((canon, tail)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                match (current.file_name(), current.parent()) {
                    (Some(name), Some(parent)) => {
                        tail.push_front(name.to_os_string());
                        current = parent.to_path_buf();
                    }
                    _ => {
                        return Err(SandboxErr::CanonicalizeFailed {
                            path: norm.to_path_buf(),
                            source: err,
                        }
                        .into());
                    }
                }
            }
            Err(err) => {
                return Err(SandboxErr::CanonicalizeFailed {
                    path: norm.to_path_buf(),
                    source: err,
                }
                .into());
            }
        }
    }
}

/// `true` when `path` equals `root` or is a descendant of it. Both sides
/// must already be canonical; comparison is component-wise so `/tmp/all`
/// does not contain `/tmp/allowed`.
pub fn is_contained(path: &Path, root: &Path) -> bool {
    path == root || path.starts_with(root)
}

/// Authorize `abs` for `op` against the policy's canonicalized roots.
///
/// Returns the canonical form of the path on success so callers perform the
/// actual filesystem operation on the same target that was checked.
pub fn authorize(abs: &Path, op: FsOp, policy: &EffectivePolicy) -> Result<PathBuf> {
    let canonical = canonicalize_for(abs, op)?;
    let roots = match op {
        FsOp::Read => &policy.permissions.read,
        FsOp::Write => &policy.permissions.write,
    };

    if roots.iter().any(|root| is_contained(&canonical, root)) {
        return Ok(canonical);
    }

    tracing::debug!(
        "denied {op:?} of {} (canonical {})",
        abs.display(),
        canonical.display()
    );
    Err(SandboxErr::PathViolation {
        path: canonical,
        roots: roots.clone(),
    }
    .into())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::policy::EffectivePolicy;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn policy_with_roots(read: Vec<PathBuf>, write: Vec<PathBuf>) -> EffectivePolicy {
        let mut policy = EffectivePolicy::empty();
        policy.permissions.read = read;
        policy.permissions.write = write;
        policy
    }

    #[test]
    fn expand_tilde_and_placeholders() {
        let cwd = Path::new("/work/proj");
        let home = Path::new("/home/u");
        assert_eq!(
            expand("~/notes", cwd, Some(home)).unwrap(),
            PathBuf::from("/home/u/notes")
        );
        assert_eq!(
            expand("${CWD}/out", cwd, Some(home)).unwrap(),
            PathBuf::from("/work/proj/out")
        );
        assert_eq!(
            expand("${HOME}/.config", cwd, Some(home)).unwrap(),
            PathBuf::from("/home/u/.config")
        );
    }

    #[test]
    fn unknown_placeholder_is_an_error() {
        let err = expand("${TMPDIR}/x", Path::new("/"), None).unwrap_err();
        assert!(matches!(err, SafeshErr::UnknownPlaceholder(p) if p == "${TMPDIR}"));
    }

    #[test]
    fn normalize_clamps_traversal_at_root() {
        assert_eq!(
            normalize_lexically(Path::new("/a/../../b")),
            PathBuf::from("/b")
        );
        assert_eq!(
            normalize_lexically(Path::new("/a/./b/../c")),
            PathBuf::from("/a/c")
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_denied_with_canonical_target() {
        let allowed = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let secret = outside.path().join("secret.txt");
        std::fs::write(&secret, "s3cret").unwrap();
        let link = allowed.path().join("link");
        std::os::unix::fs::symlink(&secret, &link).unwrap();

        let allowed_root = allowed.path().canonicalize().unwrap();
        let policy = policy_with_roots(vec![allowed_root.clone()], vec![]);

        let err = authorize(&link, FsOp::Read, &policy).unwrap_err();
        match err {
            SafeshErr::Sandbox(SandboxErr::PathViolation { path, roots }) => {
                assert_eq!(path, secret.canonicalize().unwrap());
                assert_eq!(roots, vec![allowed_root]);
            }
            other => panic!("expected PathViolation, got {other}"),
        }
    }

    #[test]
    fn dotdot_write_escape_is_denied() {
        let allowed = TempDir::new().unwrap();
        let allowed_root = allowed.path().canonicalize().unwrap();
        let policy = policy_with_roots(vec![], vec![allowed_root.clone()]);

        let escape = allowed_root.join("../../etc/shadow");
        let err = authorize(&escape, FsOp::Write, &policy).unwrap_err();
        assert!(matches!(
            err,
            SafeshErr::Sandbox(SandboxErr::PathViolation { .. })
        ));
    }

    #[test]
    fn reading_the_root_itself_is_allowed() {
        let allowed = TempDir::new().unwrap();
        let allowed_root = allowed.path().canonicalize().unwrap();
        let policy = policy_with_roots(vec![allowed_root.clone()], vec![]);

        let canonical = authorize(allowed.path(), FsOp::Read, &policy).unwrap();
        assert_eq!(canonical, allowed_root);
    }

    #[test]
    fn write_with_missing_tail_under_allowed_ancestor() {
        let allowed = TempDir::new().unwrap();
        let allowed_root = allowed.path().canonicalize().unwrap();
        let policy = policy_with_roots(vec![], vec![allowed_root.clone()]);

        let target = allowed.path().join("deep/nested/out.txt");
        let canonical = authorize(&target, FsOp::Write, &policy).unwrap();
        assert_eq!(canonical, allowed_root.join("deep/nested/out.txt"));
    }

    #[test]
    fn read_with_missing_parent_is_canonicalize_failure_not_violation() {
        let allowed = TempDir::new().unwrap();
        let allowed_root = allowed.path().canonicalize().unwrap();
        let policy = policy_with_roots(vec![allowed_root.clone()], vec![]);

        let target = allowed.path().join("missing-dir/file.txt");
        let err = authorize(&target, FsOp::Read, &policy).unwrap_err();
        assert!(matches!(
            err,
            SafeshErr::Sandbox(SandboxErr::CanonicalizeFailed { .. })
        ));
    }

    #[test]
    fn sibling_with_shared_prefix_is_not_contained() {
        assert!(!is_contained(
            Path::new("/tmp/allowed-evil"),
            Path::new("/tmp/allowed")
        ));
        assert!(is_contained(
            Path::new("/tmp/allowed/sub"),
            Path::new("/tmp/allowed")
        ));
    }
}
