//! Bounded in-memory filesystem served under a reserved path prefix.
//!
//! Paths are normalized on entry (prefix stripped, `.`/`..` resolved with
//! traversal clamped at the root, duplicate slashes collapsed) so the entry
//! map is keyed by exactly one spelling per file. Ceilings on total byte
//! size and entry count are enforced at write time and a failed operation
//! never leaves the tree partially mutated.

mod entry;
mod fd;

pub use entry::EntryKind;
pub use entry::FileEntry;
pub use entry::Metadata;
pub use entry::VfsEntry;
pub use fd::FIRST_FD;
pub use fd::MAX_OPEN_FDS;
pub use fd::flags;

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::io;
use std::time::SystemTime;

use fd::FdTable;

use crate::error::OverflowKind;
use crate::error::Result;
use crate::error::SandboxErr;

pub const DEFAULT_VFS_PREFIX: &str = "/@vfs/";
pub const DEFAULT_MAX_SIZE: usize = 64 * 1024 * 1024;
pub const DEFAULT_MAX_FILES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// What `stat` reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsStat {
    pub kind: EntryKind,
    pub size: usize,
    pub created: SystemTime,
    pub modified: SystemTime,
    pub accessed: SystemTime,
    pub mode: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsDirEntry {
    pub name: String,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsStats {
    /// Sum of all file sizes (not capacities).
    pub total_size: usize,
    /// Entries excluding the root directory.
    pub entry_count: usize,
    pub open_fds: usize,
    pub max_size: usize,
    pub max_files: usize,
}

#[derive(Debug)]
pub struct Vfs {
    prefix: String,
    entries: BTreeMap<String, VfsEntry>,
    total_size: usize,
    max_size: usize,
    max_files: usize,
    fds: FdTable,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new(DEFAULT_VFS_PREFIX, DEFAULT_MAX_SIZE, DEFAULT_MAX_FILES)
    }
}

impl Vfs {
    /// `prefix` must end with `/`; one is appended if omitted.
    pub fn new(prefix: &str, max_size: usize, max_files: usize) -> Self {
        let prefix = if prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{prefix}/")
        };
        let mut entries = BTreeMap::new();
        entries.insert("/".to_string(), VfsEntry::new_dir());
        Self {
            prefix,
            entries,
            total_size: 0,
            max_size,
            max_files,
            fds: FdTable::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether a host-side path should be routed into this VFS.
    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.prefix) || path == self.prefix.trim_end_matches('/')
    }

    /// Strip the prefix (when present), coerce to `/`-rooted, and resolve
    /// `.`/`..` lexically. Traversal above the root clamps to the root.
    pub fn normalize(&self, path: &str) -> String {
        let stripped = if let Some(rest) = path.strip_prefix(&self.prefix) {
            rest
        } else if path == self.prefix.trim_end_matches('/') {
            ""
        } else {
            path
        };
        normalize_virtual(stripped)
    }

    // ------------------------------------------------------------------
    // Whole-file operations
    // ------------------------------------------------------------------

    /// Create-or-replace with parent auto-create. Writing through a symlink
    /// writes its target.
    pub fn write(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let norm = self.normalize(path);
        let resolved = self.resolve(&norm, true)?;
        match self.entries.get_mut(&resolved) {
            Some(VfsEntry::Directory(_)) => Err(is_a_directory(&resolved).into()),
            Some(VfsEntry::File(file)) => {
                let projected = self.total_size - file.size() + data.len();
                if projected > self.max_size {
                    return Err(SandboxErr::Overflow {
                        kind: OverflowKind::Size,
                    }
                    .into());
                }
                let (old, new) = file.replace(data);
                self.total_size = self.total_size - old + new;
                Ok(())
            }
            Some(VfsEntry::Symlink(_)) => unreachable!("resolve() follows symlinks"),
            None => {
                let missing_parents = self.missing_parents(&resolved)?;
                self.check_entry_budget(missing_parents.len() + 1)?;
                if self.total_size + data.len() > self.max_size {
                    return Err(SandboxErr::Overflow {
                        kind: OverflowKind::Size,
                    }
                    .into());
                }
                for parent in missing_parents {
                    self.entries.insert(parent, VfsEntry::new_dir());
                }
                let mut file = FileEntry::new(0o644);
                file.replace(data);
                self.total_size += data.len();
                self.entries.insert(resolved, VfsEntry::File(file));
                Ok(())
            }
        }
    }

    pub fn read(&mut self, path: &str) -> Result<Vec<u8>> {
        let norm = self.normalize(path);
        let resolved = self.resolve(&norm, true)?;
        match self.entries.get_mut(&resolved) {
            Some(VfsEntry::File(file)) => {
                file.meta.touch_accessed();
                Ok(file.contents().to_vec())
            }
            Some(VfsEntry::Directory(_)) => Err(is_a_directory(&resolved).into()),
            Some(VfsEntry::Symlink(_)) => unreachable!("resolve() follows symlinks"),
            None => Err(not_found(&resolved).into()),
        }
    }

    pub fn stat(&self, path: &str) -> Result<VfsStat> {
        let norm = self.normalize(path);
        let resolved = self.resolve(&norm, true)?;
        let entry = self.entries.get(&resolved).ok_or_else(|| not_found(&resolved))?;
        Ok(stat_of(entry))
    }

    /// Like `stat` but does not follow a final symlink.
    pub fn lstat(&self, path: &str) -> Result<VfsStat> {
        let norm = self.normalize(path);
        let resolved = self.resolve(&norm, false)?;
        let entry = self.entries.get(&resolved).ok_or_else(|| not_found(&resolved))?;
        Ok(stat_of(entry))
    }

    /// `false` for anything that cannot be statted, including dangling
    /// symlinks and cycles.
    pub fn exists(&self, path: &str) -> bool {
        self.stat(path).is_ok()
    }

    pub fn remove(&mut self, path: &str, recursive: bool) -> Result<()> {
        let norm = self.normalize(path);
        // A symlink argument removes the link itself, never the target.
        let resolved = self.resolve(&norm, false)?;
        if resolved == "/" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot remove the VFS root; use clear()",
            )
            .into());
        }
        match self.entries.get(&resolved) {
            None => Err(not_found(&resolved).into()),
            Some(VfsEntry::File(file)) => {
                self.total_size -= file.size();
                self.entries.remove(&resolved);
                Ok(())
            }
            Some(VfsEntry::Symlink(_)) => {
                self.entries.remove(&resolved);
                Ok(())
            }
            Some(VfsEntry::Directory(_)) => {
                let child_prefix = format!("{}/", resolved.trim_end_matches('/'));
                let children: Vec<String> = self
                    .entries
                    .range(child_prefix.clone()..)
                    .take_while(|(key, _)| key.starts_with(&child_prefix))
                    .map(|(key, _)| key.clone())
                    .collect();
                if !children.is_empty() && !recursive {
                    return Err(io::Error::new(
                        io::ErrorKind::DirectoryNotEmpty,
                        format!("directory not empty: {resolved}"),
                    )
                    .into());
                }
                for child in children {
                    if let Some(VfsEntry::File(file)) = self.entries.remove(&child) {
                        self.total_size -= file.size();
                    }
                }
                self.entries.remove(&resolved);
                Ok(())
            }
        }
    }

    pub fn mkdir(&mut self, path: &str, recursive: bool) -> Result<()> {
        let norm = self.normalize(path);
        let resolved = self.resolve(&norm, true)?;
        if self.entries.contains_key(&resolved) {
            return Err(already_exists(&resolved).into());
        }
        let missing_parents = self.missing_parents(&resolved)?;
        if !missing_parents.is_empty() && !recursive {
            return Err(not_found(&parent_of(&resolved)).into());
        }
        self.check_entry_budget(missing_parents.len() + 1)?;
        for parent in missing_parents {
            self.entries.insert(parent, VfsEntry::new_dir());
        }
        self.entries.insert(resolved, VfsEntry::new_dir());
        Ok(())
    }

    pub fn read_dir(&mut self, path: &str) -> Result<Vec<VfsDirEntry>> {
        let norm = self.normalize(path);
        let resolved = self.resolve(&norm, true)?;
        match self.entries.get(&resolved) {
            Some(VfsEntry::Directory(_)) => {}
            Some(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::NotADirectory,
                    format!("not a directory: {resolved}"),
                )
                .into());
            }
            None => return Err(not_found(&resolved).into()),
        }
        let child_prefix = if resolved == "/" {
            "/".to_string()
        } else {
            format!("{resolved}/")
        };
        let mut out = Vec::new();
        for (key, entry) in self
            .entries
            .range(child_prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&child_prefix))
        {
            let rest = &key[child_prefix.len()..];
            if rest.is_empty() || rest.contains('/') {
                continue;
            }
            out.push(VfsDirEntry {
                name: rest.to_string(),
                kind: entry.into(),
            });
        }
        if let Some(entry) = self.entries.get_mut(&resolved) {
            entry.meta_mut().touch_accessed();
        }
        Ok(out)
    }

    /// Create a symlink at `link` whose target is stored verbatim. The
    /// target need not exist; only follow-through operations care.
    pub fn symlink(&mut self, target: &str, link: &str) -> Result<()> {
        let norm = self.normalize(link);
        if norm == "/" || self.entries.contains_key(&norm) {
            return Err(already_exists(&norm).into());
        }
        let missing_parents = self.missing_parents(&norm)?;
        self.check_entry_budget(missing_parents.len() + 1)?;
        for parent in missing_parents {
            self.entries.insert(parent, VfsEntry::new_dir());
        }
        self.entries.insert(norm, VfsEntry::new_symlink(target));
        Ok(())
    }

    /// Read a symlink's target without following it.
    pub fn read_link(&self, path: &str) -> Result<String> {
        let norm = self.normalize(path);
        let resolved = self.resolve(&norm, false)?;
        match self.entries.get(&resolved) {
            Some(VfsEntry::Symlink(link)) => Ok(link.target.clone()),
            Some(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a symlink: {resolved}"),
            )
            .into()),
            None => Err(not_found(&resolved).into()),
        }
    }

    // ------------------------------------------------------------------
    // File descriptors
    // ------------------------------------------------------------------

    pub fn open(&mut self, path: &str, fd_flags: u32) -> Result<u32> {
        let norm = self.normalize(path);
        let resolved = self.resolve(&norm, true)?;
        let writable = matches!(
            fd_flags & flags::O_ACCMODE,
            flags::O_WRONLY | flags::O_RDWR
        );

        let size = match self.entries.get_mut(&resolved) {
            Some(VfsEntry::File(file)) => {
                if fd_flags & flags::O_CREAT != 0 && fd_flags & flags::O_EXCL != 0 {
                    return Err(already_exists(&resolved).into());
                }
                if fd_flags & flags::O_TRUNC != 0 && writable {
                    let freed = file.truncate();
                    self.total_size -= freed;
                    0
                } else {
                    file.size()
                }
            }
            Some(VfsEntry::Directory(_)) => return Err(is_a_directory(&resolved).into()),
            Some(VfsEntry::Symlink(_)) => unreachable!("resolve() follows symlinks"),
            None => {
                if fd_flags & flags::O_CREAT == 0 {
                    return Err(not_found(&resolved).into());
                }
                let missing_parents = self.missing_parents(&resolved)?;
                self.check_entry_budget(missing_parents.len() + 1)?;
                for parent in missing_parents {
                    self.entries.insert(parent, VfsEntry::new_dir());
                }
                self.entries
                    .insert(resolved.clone(), VfsEntry::new_file());
                0
            }
        };

        let position = if fd_flags & flags::O_APPEND != 0 { size } else { 0 };
        Ok(self.fds.alloc(resolved, fd_flags, position)?)
    }

    pub fn close(&mut self, fd: u32) -> Result<()> {
        self.fds
            .release(fd)
            .map(|_| ())
            .ok_or_else(|| bad_fd(fd).into())
    }

    pub fn read_fd(&mut self, fd: u32, out: &mut [u8]) -> Result<usize> {
        let (path, position) = {
            let entry = self.fds.get(fd).ok_or_else(|| bad_fd(fd))?;
            if !entry.readable() {
                return Err(access_denied(fd).into());
            }
            (entry.path.clone(), entry.position)
        };
        let n = match self.entries.get_mut(&path) {
            Some(VfsEntry::File(file)) => {
                file.meta.touch_accessed();
                file.read_at(position, out)
            }
            _ => return Err(not_found(&path).into()),
        };
        if let Some(entry) = self.fds.get_mut(fd) {
            entry.position += n;
        }
        Ok(n)
    }

    pub fn write_fd(&mut self, fd: u32, data: &[u8]) -> Result<usize> {
        let (path, position, append) = {
            let entry = self.fds.get(fd).ok_or_else(|| bad_fd(fd))?;
            if !entry.writable() {
                return Err(access_denied(fd).into());
            }
            (entry.path.clone(), entry.position, entry.append())
        };
        let Some(VfsEntry::File(file)) = self.entries.get_mut(&path) else {
            return Err(not_found(&path).into());
        };
        // O_APPEND snaps the cursor to the current size before each write.
        let position = if append { file.size() } else { position };
        let projected_growth = (position + data.len()).saturating_sub(file.size());
        if self.total_size + projected_growth > self.max_size {
            return Err(SandboxErr::Overflow {
                kind: OverflowKind::Size,
            }
            .into());
        }
        let grown = file.write_at(position, data);
        self.total_size += grown;
        if let Some(entry) = self.fds.get_mut(fd) {
            entry.position = position + data.len();
        }
        Ok(data.len())
    }

    pub fn seek(&mut self, fd: u32, offset: i64, whence: Whence) -> Result<u64> {
        let size = {
            let entry = self.fds.get(fd).ok_or_else(|| bad_fd(fd))?;
            match self.entries.get(&entry.path) {
                Some(VfsEntry::File(file)) => file.size() as i64,
                _ => return Err(not_found(&entry.path).into()),
            }
        };
        let entry = self.fds.get_mut(fd).ok_or_else(|| bad_fd(fd))?;
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => entry.position as i64,
            Whence::End => size,
        };
        let target = base + offset;
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            )
            .into());
        }
        entry.position = target as usize;
        Ok(target as u64)
    }

    // ------------------------------------------------------------------
    // Whole-VFS operations
    // ------------------------------------------------------------------

    /// Invalidate every descriptor and drop every entry, zeroing the used
    /// region of each file buffer first.
    pub fn clear(&mut self) {
        for entry in self.entries.values_mut() {
            if let VfsEntry::File(file) = entry {
                file.scrub();
            }
        }
        self.entries.clear();
        self.entries.insert("/".to_string(), VfsEntry::new_dir());
        self.total_size = 0;
        self.fds.clear();
    }

    pub fn stats(&self) -> VfsStats {
        VfsStats {
            total_size: self.total_size,
            entry_count: self.entries.len() - 1,
            open_fds: self.fds.open_count(),
            max_size: self.max_size,
            max_files: self.max_files,
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Resolve symlinks in `norm`, including intermediate components. A
    /// visited set bounds the walk: revisiting a link is a cycle.
    fn resolve(&self, norm: &str, follow_final: bool) -> Result<String> {
        if norm == "/" {
            return Ok("/".to_string());
        }
        let mut visited: HashSet<String> = HashSet::new();
        let mut components: Vec<String> = split_components(norm);
        components.reverse();
        let mut current = String::new();

        while let Some(component) = components.pop() {
            let candidate = format!("{current}/{component}");
            let is_final = components.is_empty();
            match self.entries.get(&candidate) {
                Some(VfsEntry::Symlink(link)) if !is_final || follow_final => {
                    if !visited.insert(candidate.clone()) {
                        return Err(SandboxErr::SymlinkCycle(candidate.into()).into());
                    }
                    let target = if link.target.starts_with('/') {
                        normalize_virtual(&link.target)
                    } else {
                        normalize_virtual(&format!("{current}/{}", link.target))
                    };
                    // The stack already holds the unconsumed components;
                    // push the target's components on top so they are walked
                    // first, then restart from the root.
                    let mut target_components = split_components(&target);
                    target_components.reverse();
                    components.extend(target_components);
                    current = String::new();
                }
                _ => current = candidate,
            }
        }
        Ok(current)
    }

    /// Ancestors of `path` that do not exist yet, shallowest first. Errors
    /// if an existing ancestor is not a directory.
    fn missing_parents(&self, path: &str) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        let mut current = String::new();
        let components = split_components(path);
        for component in &components[..components.len().saturating_sub(1)] {
            current = format!("{current}/{component}");
            match self.entries.get(&current) {
                Some(entry) if entry.is_dir() => {}
                Some(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotADirectory,
                        format!("ancestor is not a directory: {current}"),
                    )
                    .into());
                }
                None => missing.push(current.clone()),
            }
        }
        Ok(missing)
    }

    fn check_entry_budget(&self, additional: usize) -> Result<()> {
        // The root is not counted against the ceiling.
        if self.entries.len() - 1 + additional > self.max_files {
            return Err(SandboxErr::Overflow {
                kind: OverflowKind::Files,
            }
            .into());
        }
        Ok(())
    }
}

fn stat_of(entry: &VfsEntry) -> VfsStat {
    let meta = entry.meta();
    VfsStat {
        kind: entry.into(),
        size: match entry {
            VfsEntry::File(file) => file.size(),
            _ => 0,
        },
        created: meta.created,
        modified: meta.modified,
        accessed: meta.accessed,
        mode: meta.mode,
    }
}

/// Lexical normalization for virtual paths: leading `/` enforced, `.`
/// dropped, `..` clamped at the root, duplicate slashes collapsed.
fn normalize_virtual(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    if out.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", out.join("/"))
    }
}

fn split_components(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

fn not_found(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no such file: {path}"))
}

fn already_exists(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::AlreadyExists, format!("file exists: {path}"))
}

fn is_a_directory(path: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::IsADirectory,
        format!("is a directory: {path}"),
    )
}

fn bad_fd(fd: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("bad file descriptor: {fd}"),
    )
}

fn access_denied(fd: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        format!("descriptor {fd} not opened for that access"),
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::error::SafeshErr;
    use pretty_assertions::assert_eq;

    fn vfs() -> Vfs {
        Vfs::default()
    }

    #[test]
    fn write_then_read_is_byte_identical() {
        let mut fs = vfs();
        let payload: Vec<u8> = (0..=255u8).collect();
        fs.write("/@vfs/data/blob.bin", &payload).unwrap();
        assert_eq!(fs.read("/@vfs/data/blob.bin").unwrap(), payload);
        // Prefix-less spelling reaches the same entry.
        assert_eq!(fs.read("/data/blob.bin").unwrap(), payload);
    }

    #[test]
    fn parents_are_created_on_demand() {
        let mut fs = vfs();
        fs.write("/a/b/c/file.txt", b"x").unwrap();
        assert!(fs.stat("/a").unwrap().kind == EntryKind::Directory);
        assert!(fs.stat("/a/b").unwrap().kind == EntryKind::Directory);
        assert_eq!(fs.stats().entry_count, 4);
    }

    #[test]
    fn traversal_above_root_is_clamped() {
        let mut fs = vfs();
        fs.write("/../../evil.txt", b"ok").unwrap();
        assert_eq!(fs.read("/evil.txt").unwrap(), b"ok");
        assert_eq!(fs.normalize("/.."), "/");
    }

    #[test]
    fn size_ceiling_is_strict_and_atomic() {
        let mut fs = Vfs::new("/@vfs/", 10, 16);
        fs.write("/a.txt", b"12345").unwrap();
        let err = fs.write("/b.txt", b"123456789").unwrap_err();
        assert!(matches!(
            err,
            SafeshErr::Sandbox(SandboxErr::Overflow {
                kind: OverflowKind::Size
            })
        ));
        // The failed write must not have registered the entry.
        assert!(!fs.exists("/b.txt"));
        assert_eq!(fs.stats().total_size, 5);

        // Replacing within budget is fine even when the sum of old+new
        // would not be.
        fs.write("/a.txt", b"1234567890").unwrap();
        assert_eq!(fs.stats().total_size, 10);
    }

    #[test]
    fn file_count_ceiling_counts_autocreated_parents() {
        let mut fs = Vfs::new("/@vfs/", 1024, 2);
        let err = fs.write("/d1/d2/file.txt", b"x").unwrap_err();
        assert!(matches!(
            err,
            SafeshErr::Sandbox(SandboxErr::Overflow {
                kind: OverflowKind::Files
            })
        ));
        assert_eq!(fs.stats().entry_count, 0);
    }

    #[test]
    fn total_size_tracks_sizes_not_capacities() {
        let mut fs = vfs();
        fs.write("/a.txt", &[1u8; 100]).unwrap();
        fs.write("/a.txt", b"tiny").unwrap();
        let stats = fs.stats();
        assert_eq!(stats.total_size, 4);
        assert_eq!(fs.stat("/a.txt").unwrap().size, 4);
    }

    #[test]
    fn symlink_follows_and_read_link_does_not() {
        let mut fs = vfs();
        fs.write("/real.txt", b"payload").unwrap();
        fs.symlink("/real.txt", "/link.txt").unwrap();
        assert_eq!(fs.read("/link.txt").unwrap(), b"payload");
        assert_eq!(fs.read_link("/link.txt").unwrap(), "/real.txt");
        assert_eq!(fs.stat("/link.txt").unwrap().kind, EntryKind::File);
        assert_eq!(fs.lstat("/link.txt").unwrap().kind, EntryKind::Symlink);
        assert!(matches!(
            fs.read_link("/real.txt").unwrap_err(),
            SafeshErr::Io(_)
        ));
    }

    #[test]
    fn relative_symlink_resolves_against_its_parent() {
        let mut fs = vfs();
        fs.write("/dir/real.txt", b"here").unwrap();
        fs.symlink("real.txt", "/dir/alias.txt").unwrap();
        assert_eq!(fs.read("/dir/alias.txt").unwrap(), b"here");
    }

    #[test]
    fn dangling_symlink_errors_only_on_follow() {
        let mut fs = vfs();
        fs.symlink("/nowhere.txt", "/dangling").unwrap();
        assert_eq!(fs.read_link("/dangling").unwrap(), "/nowhere.txt");
        assert!(!fs.exists("/dangling"));
        assert!(fs.read("/dangling").is_err());
        // Writing through the dangling link creates the target.
        fs.write("/dangling", b"now real").unwrap();
        assert_eq!(fs.read("/nowhere.txt").unwrap(), b"now real");
    }

    #[test]
    fn symlink_cycle_is_detected() {
        let mut fs = vfs();
        fs.symlink("/b", "/a").unwrap();
        fs.symlink("/c", "/b").unwrap();
        fs.symlink("/a", "/c").unwrap();
        for op in ["read", "stat", "open"] {
            let err = match op {
                "read" => fs.read("/a").unwrap_err(),
                "stat" => fs.stat("/a").err().unwrap(),
                _ => fs.open("/a", flags::O_RDONLY).err().unwrap(),
            };
            assert!(
                matches!(err, SafeshErr::Sandbox(SandboxErr::SymlinkCycle(_))),
                "{op} should detect the cycle"
            );
        }
    }

    #[test]
    fn remove_dir_requires_recursive() {
        let mut fs = vfs();
        fs.write("/d/one.txt", b"1").unwrap();
        fs.write("/d/two.txt", b"2").unwrap();
        assert!(fs.remove("/d", false).is_err());
        fs.remove("/d", true).unwrap();
        assert!(!fs.exists("/d"));
        assert_eq!(fs.stats().total_size, 0);
    }

    #[test]
    fn read_dir_lists_direct_children_only() {
        let mut fs = vfs();
        fs.write("/top/a.txt", b"a").unwrap();
        fs.write("/top/sub/b.txt", b"b").unwrap();
        fs.symlink("/top/a.txt", "/top/link").unwrap();
        let names: Vec<(String, EntryKind)> = fs
            .read_dir("/top")
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.kind))
            .collect();
        assert_eq!(
            names,
            vec![
                ("a.txt".to_string(), EntryKind::File),
                ("link".to_string(), EntryKind::Symlink),
                ("sub".to_string(), EntryKind::Directory),
            ]
        );
    }

    #[test]
    fn mkdir_non_recursive_requires_parent() {
        let mut fs = vfs();
        assert!(fs.mkdir("/x/y", false).is_err());
        fs.mkdir("/x/y", true).unwrap();
        assert!(fs.mkdir("/x/y", false).is_err(), "already exists");
    }

    #[test]
    fn open_flag_semantics() {
        let mut fs = vfs();
        // O_CREAT on a missing file creates it empty.
        let fd = fs
            .open("/new.txt", flags::O_WRONLY | flags::O_CREAT)
            .unwrap();
        assert_eq!(fd, FIRST_FD);
        fs.write_fd(fd, b"hello").unwrap();
        fs.close(fd).unwrap();
        assert_eq!(fs.read("/new.txt").unwrap(), b"hello");

        // O_EXCL on an existing file refuses.
        assert!(fs
            .open("/new.txt", flags::O_WRONLY | flags::O_CREAT | flags::O_EXCL)
            .is_err());

        // O_TRUNC resets size, not capacity.
        let fd = fs.open("/new.txt", flags::O_WRONLY | flags::O_TRUNC).unwrap();
        fs.close(fd).unwrap();
        assert_eq!(fs.stat("/new.txt").unwrap().size, 0);

        // Plain open of a missing file fails.
        assert!(fs.open("/missing.txt", flags::O_RDONLY).is_err());
    }

    #[test]
    fn append_snaps_position_to_size() {
        let mut fs = vfs();
        fs.write("/log.txt", b"one\n").unwrap();
        let fd = fs
            .open("/log.txt", flags::O_WRONLY | flags::O_APPEND)
            .unwrap();
        fs.write_fd(fd, b"two\n").unwrap();
        // Even after an explicit rewind, append writes go to the end.
        fs.seek(fd, 0, Whence::Set).unwrap();
        fs.write_fd(fd, b"three\n").unwrap();
        fs.close(fd).unwrap();
        assert_eq!(fs.read("/log.txt").unwrap(), b"one\ntwo\nthree\n");
    }

    #[test]
    fn fd_access_mode_is_enforced() {
        let mut fs = vfs();
        fs.write("/f.txt", b"data").unwrap();
        let rd = fs.open("/f.txt", flags::O_RDONLY).unwrap();
        assert!(fs.write_fd(rd, b"x").is_err());
        let mut buf = [0u8; 4];
        assert_eq!(fs.read_fd(rd, &mut buf).unwrap(), 4);

        let wr = fs.open("/f.txt", flags::O_WRONLY).unwrap();
        assert!(fs.read_fd(wr, &mut buf).is_err());
    }

    #[test]
    fn seek_and_sparse_read() {
        let mut fs = vfs();
        fs.write("/f.txt", b"0123456789").unwrap();
        let fd = fs.open("/f.txt", flags::O_RDWR).unwrap();
        assert_eq!(fs.seek(fd, -4, Whence::End).unwrap(), 6);
        let mut buf = [0u8; 16];
        assert_eq!(fs.read_fd(fd, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"6789");
        assert!(fs.seek(fd, -1, Whence::Set).is_err());
    }

    #[test]
    fn clear_invalidates_fds_and_resets_state() {
        let mut fs = vfs();
        fs.write("/a.txt", b"aaaa").unwrap();
        let fd = fs.open("/a.txt", flags::O_RDONLY).unwrap();
        fs.clear();
        assert!(fs.read_fd(fd, &mut [0u8; 4]).is_err());
        assert_eq!(fs.stats().entry_count, 0);
        assert_eq!(fs.stats().total_size, 0);
        assert!(fs.exists("/"));
    }

    #[test]
    fn bounded_memory_invariant_holds_across_mixed_writes() {
        let mut fs = vfs();
        fs.write("/a", &[1u8; 10]).unwrap();
        fs.write("/b", &[2u8; 20]).unwrap();
        fs.write("/a", &[3u8; 5]).unwrap();
        let fd = fs.open("/b", flags::O_WRONLY | flags::O_APPEND).unwrap();
        fs.write_fd(fd, &[4u8; 7]).unwrap();
        fs.close(fd).unwrap();

        let expected: usize = fs.stat("/a").unwrap().size + fs.stat("/b").unwrap().size;
        assert_eq!(fs.stats().total_size, expected);
        assert_eq!(expected, 5 + 27);
    }
}
