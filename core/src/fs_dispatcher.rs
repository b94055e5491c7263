//! The single routing point for filesystem access.
//!
//! A [`SandboxFs`] owns the session's VFS and a [`SandboxContext`]; every
//! path either matches the VFS prefix and is served from memory, or falls
//! through to the host filesystem behind [`path_resolver::authorize`]. The
//! context travels as a value rather than as process-global state, so the
//! enforcement point is visible at every call site.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::SystemTime;

use crate::error::Result;
use crate::error::SafeshErr;
use crate::path_resolver;
use crate::path_resolver::FsOp;
use crate::policy::EffectivePolicy;
use crate::vfs::EntryKind;
use crate::vfs::Vfs;
use crate::vfs::VfsDirEntry;
use crate::vfs::VfsStat;

/// Immutable bundle of the policy reference and the session cwd, created
/// once per session and passed to every operation.
#[derive(Debug, Clone)]
pub struct SandboxContext {
    pub policy: Arc<EffectivePolicy>,
    pub cwd: PathBuf,
}

impl SandboxContext {
    pub fn new(policy: Arc<EffectivePolicy>, cwd: PathBuf) -> Self {
        Self { policy, cwd }
    }

    /// Authorize a host-side read; returns the canonical path to operate on.
    pub fn authorize_read(&self, path: &Path) -> Result<PathBuf> {
        let abs = self.absolutize(path);
        path_resolver::authorize(&abs, FsOp::Read, &self.policy)
    }

    /// Authorize a host-side write; returns the canonical path to operate on.
    pub fn authorize_write(&self, path: &Path) -> Result<PathBuf> {
        let abs = self.absolutize(path);
        path_resolver::authorize(&abs, FsOp::Write, &self.policy)
    }

    fn absolutize(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }
}

pub struct SandboxFs {
    vfs: Mutex<Vfs>,
    ctx: SandboxContext,
}

impl SandboxFs {
    pub fn new(vfs: Vfs, ctx: SandboxContext) -> Self {
        Self {
            vfs: Mutex::new(vfs),
            ctx,
        }
    }

    pub fn context(&self) -> &SandboxContext {
        &self.ctx
    }

    pub fn vfs_prefix(&self) -> String {
        self.lock_vfs().prefix().to_string()
    }

    fn lock_vfs(&self) -> std::sync::MutexGuard<'_, Vfs> {
        self.vfs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, path: &Path) -> Option<String> {
        let text = path.to_string_lossy();
        let vfs = self.lock_vfs();
        if vfs.matches(&text) {
            Some(text.into_owned())
        } else {
            None
        }
    }

    // ------------------------------------------------------------------
    // Sync variants
    // ------------------------------------------------------------------

    pub fn read(&self, path: &Path) -> Result<Vec<u8>> {
        match self.route(path) {
            Some(virt) => self.lock_vfs().read(&virt),
            None => {
                let canonical = self.ctx.authorize_read(path)?;
                Ok(std::fs::read(canonical)?)
            }
        }
    }

    /// UTF-8 text read; invalid sequences are an error.
    pub fn read_to_string(&self, path: &Path) -> Result<String> {
        let bytes = self.read(path)?;
        String::from_utf8(bytes).map_err(|err| {
            SafeshErr::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}: {err}", path.display()),
            ))
        })
    }

    /// Text read with U+FFFD replacement, for listings of mixed-encoding
    /// content.
    pub fn read_to_string_lossy(&self, path: &Path) -> Result<String> {
        let bytes = self.read(path)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        match self.route(path) {
            Some(virt) => self.lock_vfs().write(&virt, data),
            None => {
                let canonical = self.ctx.authorize_write(path)?;
                Ok(std::fs::write(canonical, data)?)
            }
        }
    }

    pub fn stat(&self, path: &Path) -> Result<VfsStat> {
        match self.route(path) {
            Some(virt) => self.lock_vfs().stat(&virt),
            None => {
                let canonical = self.ctx.authorize_read(path)?;
                host_stat(std::fs::metadata(canonical)?)
            }
        }
    }

    pub fn lstat(&self, path: &Path) -> Result<VfsStat> {
        match self.route(path) {
            Some(virt) => self.lock_vfs().lstat(&virt),
            None => {
                let canonical = self.ctx.authorize_read(path)?;
                host_stat(std::fs::symlink_metadata(canonical)?)
            }
        }
    }

    /// Access denied is equated with non-existence so a probe cannot be
    /// used to map the filesystem outside the sandbox.
    pub fn exists(&self, path: &Path) -> bool {
        match self.route(path) {
            Some(virt) => self.lock_vfs().exists(&virt),
            None => self
                .ctx
                .authorize_read(path)
                .map(|canonical| canonical.exists())
                .unwrap_or(false),
        }
    }

    pub fn remove(&self, path: &Path, recursive: bool) -> Result<()> {
        match self.route(path) {
            Some(virt) => self.lock_vfs().remove(&virt, recursive),
            None => {
                let canonical = self.ctx.authorize_write(path)?;
                let meta = std::fs::symlink_metadata(&canonical)?;
                if meta.is_dir() {
                    if recursive {
                        std::fs::remove_dir_all(canonical)?;
                    } else {
                        std::fs::remove_dir(canonical)?;
                    }
                } else {
                    std::fs::remove_file(canonical)?;
                }
                Ok(())
            }
        }
    }

    pub fn mkdir(&self, path: &Path, recursive: bool) -> Result<()> {
        match self.route(path) {
            Some(virt) => self.lock_vfs().mkdir(&virt, recursive),
            None => {
                let canonical = self.ctx.authorize_write(path)?;
                if recursive {
                    std::fs::create_dir_all(canonical)?;
                } else {
                    std::fs::create_dir(canonical)?;
                }
                Ok(())
            }
        }
    }

    pub fn read_dir(&self, path: &Path) -> Result<Vec<VfsDirEntry>> {
        match self.route(path) {
            Some(virt) => self.lock_vfs().read_dir(&virt),
            None => {
                let canonical = self.ctx.authorize_read(path)?;
                let mut out = Vec::new();
                for dirent in std::fs::read_dir(canonical)? {
                    let dirent = dirent?;
                    let file_type = dirent.file_type()?;
                    let kind = if file_type.is_symlink() {
                        EntryKind::Symlink
                    } else if file_type.is_dir() {
                        EntryKind::Directory
                    } else {
                        EntryKind::File
                    };
                    out.push(VfsDirEntry {
                        // Lossy by design: a listing should not fail because
                        // one sibling has a non-UTF-8 name.
                        name: dirent.file_name().to_string_lossy().into_owned(),
                        kind,
                    });
                }
                out.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(out)
            }
        }
    }

    pub fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        match self.route(link) {
            Some(virt) => self
                .lock_vfs()
                .symlink(&target.to_string_lossy(), &virt),
            None => {
                let canonical_link = self.ctx.authorize_write(link)?;
                host_symlink(target, &canonical_link)
            }
        }
    }

    pub fn read_link(&self, path: &Path) -> Result<PathBuf> {
        match self.route(path) {
            Some(virt) => Ok(PathBuf::from(self.lock_vfs().read_link(&virt)?)),
            None => {
                let abs = if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    self.ctx.cwd.join(path)
                };
                // Deliberately not canonicalized: that would resolve the
                // very link being inspected. Authorize the parent instead.
                let parent = abs.parent().unwrap_or(Path::new("/"));
                self.ctx.authorize_read(parent)?;
                Ok(std::fs::read_link(abs)?)
            }
        }
    }

    /// Truncate to zero length.
    pub fn truncate(&self, path: &Path) -> Result<()> {
        match self.route(path) {
            Some(virt) => {
                let mut vfs = self.lock_vfs();
                let fd = vfs.open(&virt, crate::vfs::flags::O_WRONLY | crate::vfs::flags::O_TRUNC)?;
                vfs.close(fd)
            }
            None => {
                let canonical = self.ctx.authorize_write(path)?;
                let file = std::fs::OpenOptions::new()
                    .write(true)
                    .truncate(true)
                    .open(canonical)?;
                drop(file);
                Ok(())
            }
        }
    }

    /// Run `f` against the owned VFS. The escape hatch for descriptor-level
    /// work (`open`/`read_fd`/…) that has no host-side counterpart here.
    pub fn with_vfs<T>(&self, f: impl FnOnce(&mut Vfs) -> T) -> T {
        f(&mut self.lock_vfs())
    }

    // ------------------------------------------------------------------
    // Async variants
    // ------------------------------------------------------------------

    pub async fn read_async(&self, path: &Path) -> Result<Vec<u8>> {
        match self.route(path) {
            Some(virt) => self.lock_vfs().read(&virt),
            None => {
                let canonical = self.ctx.authorize_read(path)?;
                Ok(tokio::fs::read(canonical).await?)
            }
        }
    }

    pub async fn write_async(&self, path: &Path, data: &[u8]) -> Result<()> {
        match self.route(path) {
            Some(virt) => self.lock_vfs().write(&virt, data),
            None => {
                let canonical = self.ctx.authorize_write(path)?;
                Ok(tokio::fs::write(canonical, data).await?)
            }
        }
    }

    pub async fn remove_async(&self, path: &Path, recursive: bool) -> Result<()> {
        match self.route(path) {
            Some(virt) => self.lock_vfs().remove(&virt, recursive),
            None => {
                let canonical = self.ctx.authorize_write(path)?;
                let meta = tokio::fs::symlink_metadata(&canonical).await?;
                if meta.is_dir() {
                    if recursive {
                        tokio::fs::remove_dir_all(canonical).await?;
                    } else {
                        tokio::fs::remove_dir(canonical).await?;
                    }
                } else {
                    tokio::fs::remove_file(canonical).await?;
                }
                Ok(())
            }
        }
    }

    pub async fn mkdir_async(&self, path: &Path, recursive: bool) -> Result<()> {
        match self.route(path) {
            Some(virt) => self.lock_vfs().mkdir(&virt, recursive),
            None => {
                let canonical = self.ctx.authorize_write(path)?;
                if recursive {
                    tokio::fs::create_dir_all(canonical).await?;
                } else {
                    tokio::fs::create_dir(canonical).await?;
                }
                Ok(())
            }
        }
    }
}

// ----------------------------------------------------------------------
// Process-global installation
// ----------------------------------------------------------------------

static INSTALLED: Mutex<Option<Arc<SandboxFs>>> = Mutex::new(None);

/// Handle returned by [`install`]; restoring it uninstalls the dispatcher.
#[must_use = "dropping the handle without restore() leaves the dispatcher installed"]
pub struct RestoreHandle {
    _private: (),
}

impl RestoreHandle {
    pub fn restore(self) {
        let mut slot = INSTALLED.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = None;
    }
}

/// Install `fs` as the process-wide dispatcher for host shims that cannot
/// thread a context value. At most one installation per process; a second
/// call is rejected rather than nested.
pub fn install(fs: Arc<SandboxFs>) -> Result<RestoreHandle> {
    let mut slot = INSTALLED.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_some() {
        return Err(SafeshErr::AlreadyInstalled);
    }
    *slot = Some(fs);
    Ok(RestoreHandle { _private: () })
}

pub fn installed() -> Option<Arc<SandboxFs>> {
    INSTALLED
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

fn host_stat(meta: std::fs::Metadata) -> Result<VfsStat> {
    let kind = if meta.file_type().is_symlink() {
        EntryKind::Symlink
    } else if meta.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    };
    Ok(VfsStat {
        kind,
        size: meta.len() as usize,
        created: meta.created().unwrap_or(SystemTime::UNIX_EPOCH),
        modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        accessed: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
        mode: host_mode(&meta),
    })
}

#[cfg(unix)]
fn host_symlink(target: &Path, link: &Path) -> Result<()> {
    Ok(std::os::unix::fs::symlink(target, link)?)
}

#[cfg(not(unix))]
fn host_symlink(_target: &Path, _link: &Path) -> Result<()> {
    Err(SafeshErr::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks are not supported on this platform",
    )))
}

#[cfg(unix)]
fn host_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn host_mode(_meta: &std::fs::Metadata) -> u32 {
    0
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::error::SandboxErr;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn sandbox(read: Vec<PathBuf>, write: Vec<PathBuf>, cwd: PathBuf) -> SandboxFs {
        let mut policy = EffectivePolicy::empty();
        policy.permissions.read = read;
        policy.permissions.write = write;
        SandboxFs::new(Vfs::default(), SandboxContext::new(Arc::new(policy), cwd))
    }

    #[test]
    fn vfs_prefix_routes_to_memory() {
        let cwd = TempDir::new().unwrap();
        let fs = sandbox(vec![], vec![], cwd.path().to_path_buf());
        // No host roots at all, yet VFS traffic is fine.
        fs.write(Path::new("/@vfs/a.txt"), b"hi").unwrap();
        assert_eq!(fs.read(Path::new("/@vfs/a.txt")).unwrap(), b"hi");
        assert!(fs.exists(Path::new("/@vfs/a.txt")));
        assert_eq!(fs.stat(Path::new("/@vfs/a.txt")).unwrap().size, 2);
    }

    #[test]
    fn host_paths_fall_through_under_policy() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::write(root.join("real.txt"), b"host data").unwrap();

        let fs = sandbox(vec![root.clone()], vec![root.clone()], root.clone());
        assert_eq!(fs.read(Path::new("real.txt")).unwrap(), b"host data");

        fs.write(Path::new("out.txt"), b"written").unwrap();
        assert_eq!(std::fs::read(root.join("out.txt")).unwrap(), b"written");
    }

    #[test]
    fn denied_host_read_is_a_path_violation() {
        let dir = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        std::fs::write(other.path().join("secret.txt"), b"no").unwrap();

        let root = dir.path().canonicalize().unwrap();
        let fs = sandbox(vec![root.clone()], vec![], root);
        let err = fs.read(&other.path().join("secret.txt")).unwrap_err();
        assert!(matches!(
            err,
            SafeshErr::Sandbox(SandboxErr::PathViolation { .. })
        ));
        // Denial reads as absence.
        assert!(!fs.exists(&other.path().join("secret.txt")));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_through_host_fs_is_denied() {
        let allowed = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let secret = outside.path().join("passwd");
        std::fs::write(&secret, "root:x").unwrap();
        let root = allowed.path().canonicalize().unwrap();
        std::os::unix::fs::symlink(&secret, root.join("link")).unwrap();

        let fs = sandbox(vec![root.clone()], vec![], root.clone());
        assert!(fs.read(Path::new("link")).is_err());
        assert!(!fs.exists(Path::new("link")));
    }

    #[test]
    fn second_install_is_rejected() {
        let cwd = TempDir::new().unwrap();
        let fs = Arc::new(sandbox(vec![], vec![], cwd.path().to_path_buf()));
        let handle = install(fs.clone()).unwrap();
        assert!(matches!(
            install(fs.clone()),
            Err(SafeshErr::AlreadyInstalled)
        ));
        assert!(installed().is_some());
        handle.restore();
        assert!(installed().is_none());
        // Reinstall after restore is fine.
        install(fs).unwrap().restore();
    }

    #[test]
    fn mixed_vfs_and_host_traffic() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::write(root.join("host.txt"), b"from host").unwrap();

        let fs = sandbox(vec![root.clone()], vec![root.clone()], root);
        fs.write(Path::new("/@vfs/mem.txt"), b"from vfs").unwrap();

        assert_eq!(fs.read(Path::new("/@vfs/mem.txt")).unwrap(), b"from vfs");
        assert_eq!(fs.read(Path::new("host.txt")).unwrap(), b"from host");

        let names: Vec<String> = fs
            .read_dir(Path::new("/@vfs/"))
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["mem.txt".to_string()]);
    }

    #[tokio::test]
    async fn async_variants_route_identically() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let fs = sandbox(vec![root.clone()], vec![root.clone()], root.clone());

        fs.write_async(Path::new("/@vfs/x.txt"), b"v").await.unwrap();
        assert_eq!(fs.read_async(Path::new("/@vfs/x.txt")).await.unwrap(), b"v");

        fs.write_async(&root.join("y.txt"), b"h").await.unwrap();
        assert_eq!(fs.read_async(&root.join("y.txt")).await.unwrap(), b"h");
    }
}
