//! The core filesystem object.
//!
//! Grounded on `rcore-fs/src/vfs.rs`'s `INode::lookup_follow` for the
//! resolver shape and `rcore-fs-ramfs/src/lib.rs`'s `LockedINode` for the
//! per-node locking granularity, generalized to thread permission checks,
//! mount/shadow materialization, and inotify delivery through every
//! mutating operation the way a single-fs `lookup` never needs to.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use log::{debug, info, trace};

use crate::consts::{InotifyMask, OFlags, PathValidateFlags, F_OK, R_OK, S_ISGID, W_OK, X_OK};
use crate::error::{ErrnoKind, FsError, Result};
use crate::fd::{Descriptor, FdTable, InotifyEvent, OpenDescription};
use crate::inode::{next_fd, stat_of, Inode, InodeHeader, InodeRef, Stat};
use crate::path::{self, CaseMode, ParsedPath};
use crate::{bulk, inotify, mount};

/// Result of resolving a path: its normalized form, basename, the
/// directory it lives in, and the node itself.
#[derive(Clone)]
pub struct Entry {
    pub path: String,
    pub basename: String,
    pub parent: InodeRef,
    pub node: InodeRef,
}

/// `access_check(header, uid, gid, requested)`.
pub fn access_check(header: &InodeHeader, uid: u32, gid: u32, requested: u32) -> bool {
    let mode = header.mode & 0o777;
    let mut effective = mode & 0o007;
    if gid == header.gid {
        effective |= (mode >> 3) & 0o007;
    }
    if uid == header.uid {
        effective |= (mode >> 6) & 0o007;
    }
    (effective & requested) == requested
}

/// uid == 0 is required for chown/chmod of a file not owned by self and for
/// mount/mkdir of a filesystem root — it is never auto-granted at the
/// access-check call site itself.
pub fn require_root(uid: u32, syscall: &'static str) -> Result<()> {
    if uid != 0 {
        return Err(FsError::eperm(syscall));
    }
    Ok(())
}

fn find_child(dir_node: &InodeRef, name: &str) -> Option<InodeRef> {
    let guard = dir_node.read().unwrap();
    match &*guard {
        Inode::Dir(dir) => {
            let key = dir.case_mode.key(name);
            dir.children
                .as_ref()
                .and_then(|c| c.iter().find(|(n, _)| dir.case_mode.key(n) == key))
                .map(|(_, v)| v.clone())
        }
        _ => None,
    }
}

fn child_exists(dir_node: &InodeRef, name: &str) -> bool {
    find_child(dir_node, name).is_some()
}

/// The filesystem: a root map, a case-sensitivity policy fixed at
/// construction, a read-only barrier, an optional cwd, an effective
/// identity, and an owned descriptor table.
pub struct FileSystem {
    roots: RwLock<BTreeMap<String, InodeRef>>,
    case_mode: CaseMode,
    readonly: AtomicBool,
    cwd: RwLock<Option<String>>,
    uid: u32,
    gid: u32,
    fds: FdTable,
}

impl FileSystem {
    pub fn new(case_mode: CaseMode) -> Self {
        Self::with_root("/", case_mode)
    }

    pub fn with_root(root_name: &str, case_mode: CaseMode) -> Self {
        info!("new filesystem, root={root_name} case_mode={case_mode:?}");
        let mut roots = BTreeMap::new();
        roots.insert(root_name.to_string(), Inode::new_dir(0o755, 0, 0, case_mode));
        FileSystem {
            roots: RwLock::new(roots),
            case_mode,
            readonly: AtomicBool::new(false),
            cwd: RwLock::new(Some(root_name.to_string())),
            uid: 0,
            gid: 0,
            fds: FdTable::new(),
        }
    }

    pub fn with_identity(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn set_cwd(&self, path: &str) {
        *self.cwd.write().unwrap() = Some(path.to_string());
    }

    pub fn case_mode(&self) -> CaseMode {
        self.case_mode
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::SeqCst)
    }

    fn check_writable(&self, syscall: &'static str) -> Result<()> {
        if self.is_readonly() {
            return Err(FsError::erofs(syscall));
        }
        Ok(())
    }

    /// Reject forbidden characters and policy violations in a path that is
    /// about to be created, before any lookup touches the tree.
    fn validate_path(&self, path: &str, syscall: &'static str) -> Result<()> {
        path::validate(path, PathValidateFlags::RELATIVE_OR_ABSOLUTE)
            .map(|_| ())
            .map_err(|_| FsError::enoent(syscall, path))
    }

    // --- resolver --------------------------------------------------------

    /// Materialise a directory's children on first touch, whether that
    /// means faulting in from a mount source or copying headers down from
    /// a shadow root.
    fn ensure_children(&self, node: &InodeRef) -> Result<()> {
        let (has_pending, needs_shadow) = {
            let guard = node.read().unwrap();
            match &*guard {
                Inode::Dir(dir) => (
                    dir.pending.is_some(),
                    dir.children.is_none() && dir.shadow_root.is_some(),
                ),
                _ => (false, false),
            }
        };
        if has_pending {
            let (uid, gid) = {
                let guard = node.read().unwrap();
                (guard.header().uid, guard.header().gid)
            };
            mount::materialize_dir(node, uid, gid)
        } else if needs_shadow {
            crate::shadow::materialize_dir(node, |root| self.ensure_children(root))
        } else {
            Ok(())
        }
    }

    /// Materialise a file's bytes on first touch (mount source or shadow
    /// chain).
    fn ensure_content(&self, node: &InodeRef) -> Result<()> {
        let (has_pending, needs_shadow) = {
            let guard = node.read().unwrap();
            match &*guard {
                Inode::File(f) => (f.pending.is_some(), f.content.is_none() && f.shadow_root.is_some()),
                _ => (false, false),
            }
        };
        if has_pending {
            mount::materialize_file(node)
        } else if needs_shadow {
            crate::shadow::materialize_file(node, |root| self.ensure_content(root))
        } else {
            Ok(())
        }
    }

    fn ensure_materialized(&self, node: &InodeRef) -> Result<()> {
        let is_dir = node.read().unwrap().is_dir();
        if is_dir {
            self.ensure_children(node)
        } else if node.read().unwrap().is_file() {
            self.ensure_content(node)
        } else {
            Ok(())
        }
    }

    /// Walk `path` to `{path, basename, parent, node}`.
    pub fn resolve(&self, path: &str, no_follow: bool) -> Result<Entry> {
        self.resolve_as(path, no_follow, "resolve")
    }

    pub fn resolve_as(&self, path: &str, no_follow: bool, syscall: &'static str) -> Result<Entry> {
        trace!("{syscall}: resolve {path}");
        path::validate(path, PathValidateFlags::RELATIVE_OR_ABSOLUTE)
            .map_err(|_| FsError::enoent(syscall, path))?;
        let full = if path::is_absolute(path) {
            path::normalize(path)
        } else {
            let cwd = self.cwd.read().unwrap().clone().unwrap_or_default();
            path::resolve(&cwd, path)
        };

        let mut parsed = path::parse(&full);
        let mut depth: u32 = 0;

        loop {
            let root_key = parsed.root.clone().unwrap_or_default();
            let root_node = {
                let roots = self.roots.read().unwrap();
                roots.get(&root_key).cloned()
            };
            let root_node = root_node.ok_or_else(|| FsError::enoent(syscall, full.clone()))?;

            let segments = parsed.segments.clone();
            let n = segments.len();

            if n == 0 {
                return Ok(Entry {
                    path: full,
                    basename: root_key,
                    parent: root_node.clone(),
                    node: root_node,
                });
            }

            let mut current = root_node;
            let mut current_prefix = root_key;
            let mut restart: Option<ParsedPath> = None;
            let mut result: Option<Entry> = None;

            for (i, seg) in segments.iter().enumerate() {
                let is_last = i == n - 1;

                self.ensure_children(&current)?;

                let child =
                    find_child(&current, seg).ok_or_else(|| FsError::enoent(syscall, full.clone()))?;

                let is_symlink = child.read().unwrap().is_symlink();
                if is_symlink && !(no_follow && is_last) {
                    let target = match &*child.read().unwrap() {
                        Inode::Symlink(s) => s.target.clone(),
                        _ => unreachable!(),
                    };
                    let resolved = path::resolve(&current_prefix, &target);
                    if !path::is_absolute(&resolved) {
                        return Err(FsError::enoent(syscall, resolved));
                    }
                    depth += 1;
                    if depth >= 40 {
                        return Err(FsError::eloop(syscall, resolved));
                    }
                    let mut new_parsed = path::parse(&resolved);
                    new_parsed.segments.extend(segments[i + 1..].iter().cloned());
                    restart = Some(new_parsed);
                    break;
                }

                if !is_last {
                    if !child.read().unwrap().is_dir() {
                        return Err(FsError::enotdir(syscall, full.clone()));
                    }
                    {
                        let guard = child.read().unwrap();
                        if !access_check(guard.header(), self.uid, self.gid, X_OK) {
                            return Err(FsError::eacces(syscall, current_prefix.clone()));
                        }
                    }
                    current_prefix = join_prefix(&current_prefix, seg);
                    current = child;
                } else {
                    result = Some(Entry {
                        path: full.clone(),
                        basename: seg.clone(),
                        parent: current.clone(),
                        node: child,
                    });
                }
            }

            if let Some(entry) = result {
                return Ok(entry);
            }
            if let Some(p) = restart {
                parsed = p;
                continue;
            }
            unreachable!("segment loop exits only via result or restart");
        }
    }

    // --- directory operations --------------------------------------------

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        debug!("mkdir {path} mode={mode:o}");
        self.check_writable("mkdir")?;
        self.validate_path(path, "mkdir")?;
        let parent_path = path::dirname(path);
        let base = path::basename(path);
        if base.is_empty() {
            return Err(FsError::eexist("mkdir", path));
        }
        let parent_entry = self.resolve_as(&parent_path, false, "mkdir")?;
        {
            let guard = parent_entry.node.read().unwrap();
            if !guard.is_dir() {
                return Err(FsError::enotdir("mkdir", parent_path.clone()));
            }
            if !access_check(guard.header(), self.uid, self.gid, W_OK) {
                return Err(FsError::eacces("mkdir", parent_path.clone()));
            }
        }
        self.ensure_children(&parent_entry.node)?;
        if child_exists(&parent_entry.node, &base) {
            return Err(FsError::eexist("mkdir", path));
        }

        let (parent_gid, sgid, case_mode) = {
            let guard = parent_entry.node.read().unwrap();
            let case_mode = match &*guard {
                Inode::Dir(d) => d.case_mode,
                _ => self.case_mode,
            };
            (guard.header().gid, guard.header().mode & S_ISGID != 0, case_mode)
        };

        let mut new_mode = mode & 0o1777;
        let (new_uid, new_gid) = if sgid {
            new_mode |= S_ISGID;
            (self.uid, parent_gid)
        } else {
            (self.uid, self.gid)
        };
        let new_dir = Inode::new_dir(new_mode, new_uid, new_gid, case_mode);

        {
            let mut guard = parent_entry.node.write().unwrap();
            if let Inode::Dir(dir) = &mut *guard {
                dir.children
                    .get_or_insert_with(Default::default)
                    .insert(base.clone(), new_dir);
                dir.header.touch_mtime_ctime();
            }
        }
        inotify::notify(
            &self.fds,
            &parent_entry.node,
            InotifyMask::IN_CREATE | InotifyMask::IN_ISDIR,
            Some(base.as_str()),
            0,
        );
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        debug!("rmdir {path}");
        self.check_writable("rmdir")?;
        let entry = self.resolve_as(path, true, "rmdir")?;
        {
            let guard = entry.node.read().unwrap();
            if !guard.is_dir() {
                return Err(FsError::enotdir("rmdir", path));
            }
            if let Inode::Dir(dir) = &*guard {
                if dir.children.as_ref().map(|c| !c.is_empty()).unwrap_or(false) {
                    return Err(FsError::enotempty("rmdir", path));
                }
            }
        }
        {
            let mut guard = entry.parent.write().unwrap();
            if let Inode::Dir(dir) = &mut *guard {
                if let Some(children) = dir.children.as_mut() {
                    children.remove(&entry.basename);
                }
                dir.header.touch_mtime_ctime();
            }
        }
        let nlink_zero = {
            let mut guard = entry.node.write().unwrap();
            let header = guard.header_mut();
            header.nlink = header.nlink.saturating_sub(1);
            header.nlink == 0
        };
        inotify::notify(
            &self.fds,
            &entry.parent,
            InotifyMask::IN_DELETE | InotifyMask::IN_ISDIR,
            Some(entry.basename.as_str()),
            0,
        );
        inotify::notify(&self.fds, &entry.node, InotifyMask::IN_DELETE_SELF, None, 0);
        if nlink_zero {
            inotify::teardown_all_watches(&self.fds, &entry.node);
        }
        Ok(())
    }

    pub fn link(&self, old: &str, new: &str) -> Result<()> {
        debug!("link {old} -> {new}");
        self.check_writable("link")?;
        self.validate_path(new, "link")?;
        let old_entry = self.resolve_as(old, false, "link")?;
        if old_entry.node.read().unwrap().is_dir() {
            return Err(FsError::eperm("link"));
        }
        let new_parent_path = path::dirname(new);
        let new_base = path::basename(new);
        let new_parent_entry = self.resolve_as(&new_parent_path, false, "link")?;
        {
            let guard = new_parent_entry.node.read().unwrap();
            if !guard.is_dir() {
                return Err(FsError::enotdir("link", new_parent_path.clone()));
            }
            if !access_check(guard.header(), self.uid, self.gid, W_OK) {
                return Err(FsError::eacces("link", new_parent_path.clone()));
            }
        }
        self.ensure_children(&new_parent_entry.node)?;
        if child_exists(&new_parent_entry.node, &new_base) {
            return Err(FsError::eexist("link", new));
        }
        {
            let mut guard = new_parent_entry.node.write().unwrap();
            if let Inode::Dir(dir) = &mut *guard {
                dir.children
                    .get_or_insert_with(Default::default)
                    .insert(new_base.clone(), old_entry.node.clone());
                dir.header.touch_mtime_ctime();
            }
        }
        {
            let mut guard = old_entry.node.write().unwrap();
            let header = guard.header_mut();
            header.nlink += 1;
            header.touch_ctime();
        }
        inotify::notify(
            &self.fds,
            &new_parent_entry.node,
            InotifyMask::IN_CREATE,
            Some(new_base.as_str()),
            0,
        );
        inotify::notify(&self.fds, &old_entry.node, InotifyMask::IN_ATTRIB, None, 0);
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        debug!("unlink {path}");
        self.check_writable("unlink")?;
        let entry = self.resolve_as(path, true, "unlink")?;
        if entry.node.read().unwrap().is_dir() {
            return Err(FsError::eisdir("unlink", path));
        }
        {
            let mut guard = entry.parent.write().unwrap();
            if let Inode::Dir(dir) = &mut *guard {
                if let Some(children) = dir.children.as_mut() {
                    children.remove(&entry.basename);
                }
                dir.header.touch_mtime_ctime();
            }
        }
        let nlink_zero = {
            let mut guard = entry.node.write().unwrap();
            let header = guard.header_mut();
            header.nlink = header.nlink.saturating_sub(1);
            header.touch_ctime();
            header.nlink == 0
        };
        inotify::notify(&self.fds, &entry.parent, InotifyMask::IN_DELETE, Some(entry.basename.as_str()), 0);
        inotify::notify(&self.fds, &entry.node, InotifyMask::IN_ATTRIB, None, 0);
        if nlink_zero {
            inotify::notify(&self.fds, &entry.node, InotifyMask::IN_DELETE_SELF, None, 0);
            inotify::teardown_all_watches(&self.fds, &entry.node);
        }
        Ok(())
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        debug!("rename {old} -> {new}");
        self.check_writable("rename")?;
        self.validate_path(new, "rename")?;
        let old_entry = self.resolve_as(old, true, "rename")?;
        let new_parent_path = path::dirname(new);
        let new_base = path::basename(new);
        let new_parent_entry = self.resolve_as(&new_parent_path, false, "rename")?;
        if !new_parent_entry.node.read().unwrap().is_dir() {
            return Err(FsError::enotdir("rename", new_parent_path));
        }
        self.ensure_children(&new_parent_entry.node)?;

        let existing_dest = find_child(&new_parent_entry.node, &new_base);

        if let Some(dest) = &existing_dest {
            let old_is_dir = old_entry.node.read().unwrap().is_dir();
            let dest_is_dir = dest.read().unwrap().is_dir();
            if old_is_dir != dest_is_dir {
                return Err(FsError::enotdir("rename", new));
            }
            if dest_is_dir {
                let empty = match &*dest.read().unwrap() {
                    Inode::Dir(d) => d.children.as_ref().map(|c| c.is_empty()).unwrap_or(true),
                    _ => true,
                };
                if !empty {
                    return Err(FsError::enotempty("rename", new));
                }
            }
        }

        {
            let mut guard = old_entry.parent.write().unwrap();
            if let Inode::Dir(dir) = &mut *guard {
                if let Some(children) = dir.children.as_mut() {
                    children.remove(&old_entry.basename);
                }
                dir.header.touch_mtime_ctime();
            }
        }

        if let Some(dest) = &existing_dest {
            let nlink_zero = {
                let mut guard = dest.write().unwrap();
                let header = guard.header_mut();
                header.nlink = header.nlink.saturating_sub(1);
                header.nlink == 0
            };
            if nlink_zero {
                inotify::teardown_all_watches(&self.fds, dest);
            }
        }

        {
            let mut guard = new_parent_entry.node.write().unwrap();
            if let Inode::Dir(dir) = &mut *guard {
                dir.children
                    .get_or_insert_with(Default::default)
                    .insert(new_base.clone(), old_entry.node.clone());
                dir.header.touch_mtime_ctime();
            }
        }

        let cookie = inotify::new_cookie();
        inotify::notify(
            &self.fds,
            &old_entry.parent,
            InotifyMask::IN_MOVED_FROM,
            Some(old_entry.basename.as_str()),
            cookie,
        );
        inotify::notify(
            &self.fds,
            &new_parent_entry.node,
            InotifyMask::IN_MOVED_TO,
            Some(new_base.as_str()),
            cookie,
        );
        // rename does not ctime-bump the moved node, only its parents.
        inotify::notify(&self.fds, &old_entry.node, InotifyMask::IN_MOVE_SELF, None, cookie);
        Ok(())
    }

    pub fn symlink(&self, target: &str, link: &str) -> Result<()> {
        debug!("symlink {link} -> {target}");
        self.check_writable("symlink")?;
        self.validate_path(link, "symlink")?;
        let parent_path = path::dirname(link);
        let base = path::basename(link);
        let parent_entry = self.resolve_as(&parent_path, false, "symlink")?;
        {
            let guard = parent_entry.node.read().unwrap();
            if !guard.is_dir() {
                return Err(FsError::enotdir("symlink", parent_path.clone()));
            }
            if !access_check(guard.header(), self.uid, self.gid, W_OK) {
                return Err(FsError::eacces("symlink", parent_path.clone()));
            }
        }
        self.ensure_children(&parent_entry.node)?;
        if child_exists(&parent_entry.node, &base) {
            return Err(FsError::eexist("symlink", link));
        }
        let node = Inode::new_symlink(target.to_string(), self.uid, self.gid);
        {
            let mut guard = parent_entry.node.write().unwrap();
            if let Inode::Dir(dir) = &mut *guard {
                dir.children.get_or_insert_with(Default::default).insert(base.clone(), node);
                dir.header.touch_mtime_ctime();
            }
        }
        inotify::notify(
            &self.fds,
            &parent_entry.node,
            InotifyMask::IN_CREATE | InotifyMask::IN_ISDIR,
            Some(base.as_str()),
            0,
        );
        Ok(())
    }

    pub fn readlink(&self, path: &str) -> Result<String> {
        let entry = self.resolve_as(path, true, "readlink")?;
        match &*entry.node.read().unwrap() {
            Inode::Symlink(s) => Ok(s.target.clone()),
            _ => Err(FsError::einval("readlink")),
        }
    }

    // --- attributes --------------------------------------------------------

    pub fn stat(&self, path: &str) -> Result<Stat> {
        let entry = self.resolve_as(path, false, "stat")?;
        self.ensure_materialized(&entry.node)?;
        Ok(stat_of(&entry.node.read().unwrap()))
    }

    pub fn lstat(&self, path: &str) -> Result<Stat> {
        let entry = self.resolve_as(path, true, "lstat")?;
        Ok(stat_of(&entry.node.read().unwrap()))
    }

    pub fn access(&self, path: &str, mode: u32) -> Result<()> {
        let entry = self.resolve_as(path, false, "access")?;
        if mode == F_OK {
            return Ok(());
        }
        let guard = entry.node.read().unwrap();
        if access_check(guard.header(), self.uid, self.gid, mode) {
            Ok(())
        } else {
            Err(FsError::eacces("access", path))
        }
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        debug!("chmod {path} mode={mode:o}");
        self.check_writable("chmod")?;
        let entry = self.resolve_as(path, false, "chmod")?;
        {
            let guard = entry.node.read().unwrap();
            if guard.header().uid != self.uid {
                require_root(self.uid, "chmod")?;
            }
        }
        {
            let mut guard = entry.node.write().unwrap();
            let header = guard.header_mut();
            header.mode = (header.mode & !0o7777) | (mode & 0o7777);
            header.touch_ctime();
        }
        inotify::notify(&self.fds, &entry.node, InotifyMask::IN_ATTRIB, None, 0);
        Ok(())
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        debug!("chown {path} uid={uid} gid={gid}");
        self.check_writable("chown")?;
        let entry = self.resolve_as(path, false, "chown")?;
        {
            let guard = entry.node.read().unwrap();
            if guard.header().uid != self.uid {
                require_root(self.uid, "chown")?;
            }
        }
        {
            let mut guard = entry.node.write().unwrap();
            let header = guard.header_mut();
            header.uid = uid;
            header.gid = gid;
            header.touch_ctime();
        }
        inotify::notify(&self.fds, &entry.node, InotifyMask::IN_ATTRIB, None, 0);
        Ok(())
    }

    // --- file descriptor table ---------------------------------------------

    pub fn open(&self, path: &str, flags: OFlags, mode: u32) -> Result<u64> {
        trace!("open {path} flags={flags:?}");
        if flags.wants_write() || flags.contains(OFlags::O_CREAT) || flags.contains(OFlags::O_TRUNC) {
            self.check_writable("open")?;
        }
        let no_follow = flags.contains(OFlags::O_NOFOLLOW);

        let (parent, node, created) = match self.resolve_as(path, no_follow, "open") {
            Ok(entry) => {
                if flags.contains(OFlags::O_EXCL) && flags.contains(OFlags::O_CREAT) {
                    return Err(FsError::eexist("open", path));
                }
                (entry.parent, entry.node, false)
            }
            Err(e) if e.code == ErrnoKind::ENOENT && flags.contains(OFlags::O_CREAT) => {
                let parent_path = path::dirname(path);
                let base = path::basename(path);
                let parent_entry = self.resolve_as(&parent_path, false, "open")?;
                {
                    let guard = parent_entry.node.read().unwrap();
                    if !guard.is_dir() {
                        return Err(FsError::enotdir("open", parent_path.clone()));
                    }
                    if !access_check(guard.header(), self.uid, self.gid, W_OK) {
                        return Err(FsError::eacces("open", parent_path.clone()));
                    }
                }
                self.ensure_children(&parent_entry.node)?;
                let (sgid, parent_gid) = {
                    let guard = parent_entry.node.read().unwrap();
                    (guard.header().mode & S_ISGID != 0, guard.header().gid)
                };
                let new_mode = mode & 0o1777;
                let (uid, gid) = if sgid { (self.uid, parent_gid) } else { (self.uid, self.gid) };
                let node = Inode::new_file(new_mode, uid, gid);
                {
                    let mut guard = parent_entry.node.write().unwrap();
                    if let Inode::Dir(dir) = &mut *guard {
                        dir.children
                            .get_or_insert_with(Default::default)
                            .insert(base.clone(), node.clone());
                        dir.header.touch_mtime_ctime();
                    }
                }
                inotify::notify(&self.fds, &parent_entry.node, InotifyMask::IN_CREATE, Some(base.as_str()), 0);
                (parent_entry.node, node, true)
            }
            Err(e) => return Err(e),
        };

        let mut effective_flags = flags;
        if created {
            effective_flags.remove(OFlags::O_TRUNC);
        }

        {
            let guard = node.read().unwrap();
            if effective_flags.contains(OFlags::O_DIRECTORY) && !guard.is_dir() {
                return Err(FsError::enotdir("open", path));
            }
            if effective_flags.wants_write() && guard.is_dir() {
                return Err(FsError::eisdir("open", path));
            }
        }

        {
            let mut requested = 0u32;
            if effective_flags.wants_read() {
                requested |= R_OK;
            }
            if effective_flags.wants_write() {
                requested |= W_OK;
            }
            if requested != 0 {
                let guard = node.read().unwrap();
                if !access_check(guard.header(), self.uid, self.gid, requested) {
                    return Err(FsError::eacces("open", path));
                }
            }
        }

        let offset = if effective_flags.contains(OFlags::O_APPEND) && !effective_flags.contains(OFlags::O_TRUNC) {
            self.ensure_content(&node)?;
            node.read().unwrap().size()
        } else {
            0
        };

        let staged = if effective_flags.contains(OFlags::O_TRUNC) {
            Some(Vec::new())
        } else {
            None
        };

        let fd = next_fd();
        let basename = path::basename(path);
        self.fds.insert(
            fd,
            Descriptor::Open(OpenDescription {
                fd,
                path_at_open: path.to_string(),
                basename,
                parent: parent.clone(),
                node: node.clone(),
                flags: effective_flags,
                offset,
                dirty: false,
                staged,
            }),
        );

        inotify::notify(&self.fds, &parent, InotifyMask::IN_OPEN, Some(path::basename(path).as_str()), 0);
        inotify::notify(&self.fds, &node, InotifyMask::IN_OPEN, None, 0);

        Ok(fd)
    }

    pub fn open_with_alias(&self, path: &str, alias: &str, mode: u32) -> Result<u64> {
        let flags = OFlags::from_alias(alias).ok_or_else(|| FsError::einval("open"))?;
        self.open(path, flags, mode)
    }

    pub fn read(&self, fd: u64, dst: &mut [u8], dst_off: usize, len: usize, pos: Option<i64>) -> Result<usize> {
        trace!("read fd={fd} len={len} pos={pos:?}");
        if len == 0 {
            return Ok(0);
        }
        let node = self
            .fds
            .with_open(fd, |od| od.node.clone())
            .ok_or_else(|| FsError::ebadf("read"))?;
        self.ensure_content(&node)?;

        let (n, parent) = self
            .fds
            .with_open(fd, |od| {
                if od.staged.is_none() {
                    let bytes = match &*od.node.read().unwrap() {
                        Inode::File(f) => f.content.clone().unwrap_or_default(),
                        _ => Vec::new(),
                    };
                    od.staged = Some(bytes);
                }
                let start = match pos {
                    Some(p) if p >= 0 => p as usize,
                    _ => od.offset as usize,
                };
                let buf = od.staged.as_ref().unwrap();
                let avail = buf.len().saturating_sub(start);
                let to_copy = avail.min(len).min(dst.len().saturating_sub(dst_off));
                if to_copy > 0 {
                    dst[dst_off..dst_off + to_copy].copy_from_slice(&buf[start..start + to_copy]);
                }
                if pos.map(|p| p < 0).unwrap_or(true) {
                    od.offset += to_copy as u64;
                }
                (to_copy, od.parent.clone())
            })
            .ok_or_else(|| FsError::ebadf("read"))?;

        inotify::notify(&self.fds, &parent, InotifyMask::IN_ACCESS, None, 0);
        inotify::notify(&self.fds, &node, InotifyMask::IN_ACCESS, None, 0);
        Ok(n)
    }

    pub fn write(&self, fd: u64, src: &[u8], src_off: usize, len: usize, pos: Option<i64>) -> Result<usize> {
        trace!("write fd={fd} len={len} pos={pos:?}");
        self.check_writable("write")?;
        let node = self
            .fds
            .with_open(fd, |od| od.node.clone())
            .ok_or_else(|| FsError::ebadf("write"))?;
        self.ensure_content(&node)?;

        let (n, sync) = self
            .fds
            .with_open(fd, |od| {
                if od.staged.is_none() {
                    let bytes = match &*od.node.read().unwrap() {
                        Inode::File(f) => f.content.clone().unwrap_or_default(),
                        _ => Vec::new(),
                    };
                    od.staged = Some(bytes);
                }
                let start = match pos {
                    Some(p) if p >= 0 => p as usize,
                    _ => od.offset as usize,
                };
                let to_copy = len.min(src.len().saturating_sub(src_off));
                let buf = od.staged.as_mut().unwrap();
                if buf.len() < start + to_copy {
                    buf.resize(start + to_copy, 0);
                }
                buf[start..start + to_copy].copy_from_slice(&src[src_off..src_off + to_copy]);
                if pos.map(|p| p < 0).unwrap_or(true) {
                    od.offset = (start + to_copy) as u64;
                }
                od.dirty = true;
                (to_copy, od.flags.contains(OFlags::O_SYNC))
            })
            .ok_or_else(|| FsError::ebadf("write"))?;

        if sync {
            self.fsync(fd, true)?;
        }
        Ok(n)
    }

    pub fn fsync(&self, fd: u64, metadata: bool) -> Result<()> {
        self.check_writable("fsync")?;
        let (node, parent, staged) = self
            .fds
            .with_open(fd, |od| {
                let staged = od.staged.take();
                od.dirty = false;
                (od.node.clone(), od.parent.clone(), staged)
            })
            .ok_or_else(|| FsError::ebadf("fsync"))?;

        if let Some(bytes) = staged {
            debug!("fsync fd={fd}: publishing {} staged bytes", bytes.len());
            {
                let mut guard = node.write().unwrap();
                if let Inode::File(f) = &mut *guard {
                    f.content = Some(bytes);
                }
                let header = guard.header_mut();
                header.touch_mtime_ctime();
            }
            self.fds.with_open(fd, |od| {
                od.staged = Some(match &*od.node.read().unwrap() {
                    Inode::File(f) => f.content.clone().unwrap_or_default(),
                    _ => Vec::new(),
                });
            });
            inotify::notify(&self.fds, &parent, InotifyMask::IN_MODIFY, None, 0);
            inotify::notify(&self.fds, &node, InotifyMask::IN_MODIFY, None, 0);
        }
        let _ = metadata;
        Ok(())
    }

    pub fn fdatasync(&self, fd: u64) -> Result<()> {
        self.fsync(fd, false)
    }

    fn resize_file(&self, node: &InodeRef, len: u64, syscall: &'static str) -> Result<()> {
        self.ensure_content(node)?;
        {
            let mut guard = node.write().unwrap();
            match &mut *guard {
                Inode::File(f) => {
                    let mut content = f.content.take().unwrap_or_default();
                    content.resize(len as usize, 0);
                    f.content = Some(content);
                }
                _ => return Err(FsError::eisdir(syscall, "")),
            }
            guard.header_mut().touch_mtime_ctime();
        }
        inotify::notify(&self.fds, node, InotifyMask::IN_MODIFY, None, 0);
        Ok(())
    }

    pub fn truncate(&self, path: &str, len: u64) -> Result<()> {
        self.check_writable("truncate")?;
        let entry = self.resolve_as(path, false, "truncate")?;
        self.resize_file(&entry.node, len, "truncate")
    }

    pub fn ftruncate(&self, fd: u64, len: u64) -> Result<()> {
        self.check_writable("ftruncate")?;
        let node = self
            .fds
            .with_open(fd, |od| od.node.clone())
            .ok_or_else(|| FsError::ebadf("ftruncate"))?;
        self.resize_file(&node, len, "ftruncate")?;
        self.fds.with_open(fd, |od| {
            if let Some(buf) = od.staged.as_mut() {
                buf.resize(len as usize, 0);
            }
        });
        Ok(())
    }

    pub fn close(&self, fd: u64) -> Result<()> {
        trace!("close fd={fd}");
        if self.fds.with_open(fd, |_| ()).is_some() {
            self.fsync(fd, true)?;
            let od = match self.fds.remove(fd) {
                Some(Descriptor::Open(od)) => od,
                _ => return Err(FsError::ebadf("close")),
            };
            let mask = if od.flags.wants_write() {
                InotifyMask::IN_CLOSE_WRITE
            } else {
                InotifyMask::IN_CLOSE_NOWRITE
            };
            inotify::notify(&self.fds, &od.parent, mask, None, 0);
            inotify::notify(&self.fds, &od.node, mask, None, 0);
            return Ok(());
        }

        if self.fds.with_inotify(fd, |_| ()).is_some() {
            if let Some(Descriptor::Inotify(id)) = self.fds.remove(fd) {
                for (wd, entry) in id.by_wd {
                    let mut guard = entry.node.write().unwrap();
                    if let Some(watches) = &mut guard.header_mut().watches {
                        watches.remove(&(fd, wd));
                    }
                }
            }
            return Ok(());
        }

        Err(FsError::ebadf("close"))
    }

    // --- convenience wrappers ---------------------------------------------

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let fd = self.open(path, OFlags::O_RDONLY, 0)?;
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = self.read(fd, &mut chunk, 0, chunk.len(), None)?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        self.close(fd)?;
        Ok(buf)
    }

    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let fd = self.open(path, OFlags::O_WRONLY | OFlags::O_CREAT | OFlags::O_TRUNC, 0o666)?;
        let mut off = 0;
        while off < data.len() {
            let n = self.write(fd, data, off, data.len() - off, None)?;
            if n == 0 {
                break;
            }
            off += n;
        }
        self.close(fd)?;
        Ok(())
    }

    pub fn append_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let fd = self.open(path, OFlags::O_WRONLY | OFlags::O_CREAT | OFlags::O_APPEND, 0o666)?;
        let mut off = 0;
        while off < data.len() {
            let n = self.write(fd, data, off, data.len() - off, None)?;
            if n == 0 {
                break;
            }
            off += n;
        }
        self.close(fd)?;
        Ok(())
    }

    /// `mkdir -p`: create every missing path component.
    pub fn mkdirp(&self, path: &str) -> Result<()> {
        self.mkdirp_mode(path, 0o755)
    }

    pub fn mkdirp_mode(&self, path: &str, mode: u32) -> Result<()> {
        let parsed = path::parse(path);
        let root = parsed.root.clone().unwrap_or_default();
        let mut prefix = root;
        for seg in parsed.segments.iter() {
            prefix = join_prefix(&prefix, seg);
            match self.resolve(&prefix, false) {
                Ok(entry) => {
                    if !entry.node.read().unwrap().is_dir() {
                        return Err(FsError::enotdir("mkdirp", prefix));
                    }
                }
                Err(_) => {
                    self.mkdir(&prefix, mode)?;
                }
            }
        }
        Ok(())
    }

    /// rimraf: unlink a file or recursively empty and remove a directory.
    /// Silently succeeds if the path is already absent.
    pub fn remove_any(&self, path: &str) -> Result<()> {
        let entry = match self.resolve(path, true) {
            Ok(e) => e,
            Err(e) if e.code == ErrnoKind::ENOENT => return Ok(()),
            Err(e) => return Err(e),
        };
        let is_dir = entry.node.read().unwrap().is_dir();
        if is_dir {
            self.ensure_children(&entry.node)?;
            let names: Vec<String> = match &*entry.node.read().unwrap() {
                Inode::Dir(d) => d.children.as_ref().map(|c| c.keys().cloned().collect()).unwrap_or_default(),
                _ => Vec::new(),
            };
            for name in names {
                let child_path = path::combine(path, &name);
                self.remove_any(&child_path)?;
            }
            self.rmdir(path)
        } else {
            self.unlink(path)
        }
    }

    // --- inotify passthrough ------------------------------------------------

    pub fn inotify_init(&self, callback: Arc<dyn Fn(InotifyEvent) + Send + Sync>) -> u64 {
        inotify::inotify_init(&self.fds, callback)
    }

    pub fn inotify_add_watch(&self, inotify_fd: u64, path: &str, mask: InotifyMask) -> Result<u64> {
        let no_follow = mask.contains(InotifyMask::IN_DONT_FOLLOW);
        let entry = self.resolve_as(path, no_follow, "inotify_add_watch")?;
        inotify::add_watch(&self.fds, inotify_fd, path, &entry.node, mask)
    }

    pub fn inotify_rm_watch(&self, inotify_fd: u64, wd: u64) -> Result<()> {
        inotify::rm_watch(&self.fds, inotify_fd, wd)
    }

    // --- shadow / mount / bulk apply ----------------------------------------

    pub fn make_readonly(&self) {
        self.readonly.store(true, Ordering::SeqCst);
    }

    pub fn shadow(&self, case_mode: CaseMode) -> Result<FileSystem> {
        debug!("shadow case_mode={case_mode:?}");
        if !self.is_readonly() {
            return Err(FsError::erofs("shadow"));
        }
        crate::shadow::check_case_compat(self.case_mode, case_mode)?;
        let mut new_roots = BTreeMap::new();
        {
            let roots = self.roots.read().unwrap();
            for (name, root) in roots.iter() {
                new_roots.insert(name.clone(), crate::shadow::shadow_of(root));
            }
        }
        Ok(FileSystem {
            roots: RwLock::new(new_roots),
            case_mode,
            readonly: AtomicBool::new(false),
            cwd: RwLock::new(self.cwd.read().unwrap().clone()),
            uid: self.uid,
            gid: self.gid,
            fds: FdTable::new(),
        })
    }

    pub fn mount(&self, source: &str, target: &str, resolver: Arc<dyn mount::FsResolver>, mode: u32) -> Result<()> {
        debug!("mount {source} at {target}");
        self.check_writable("mount")?;
        require_root(self.uid, "mount")?;
        let parent_path = path::dirname(target);
        let base = path::basename(target);
        let parent_entry = self.resolve_as(&parent_path, false, "mount")?;
        self.ensure_children(&parent_entry.node)?;
        let case_mode = match &*parent_entry.node.read().unwrap() {
            Inode::Dir(d) => d.case_mode,
            _ => return Err(FsError::enotdir("mount", parent_path)),
        };
        let dir = mount::make_mount_dir(source, resolver, mode, self.uid, self.gid, case_mode);
        {
            let mut guard = parent_entry.node.write().unwrap();
            if let Inode::Dir(pd) = &mut *guard {
                pd.children.get_or_insert_with(Default::default).insert(base.clone(), dir);
                pd.header.touch_mtime_ctime();
            }
        }
        inotify::notify(
            &self.fds,
            &parent_entry.node,
            InotifyMask::IN_CREATE | InotifyMask::IN_ISDIR,
            Some(base.as_str()),
            0,
        );
        Ok(())
    }

    pub fn apply(&self, base: &str, map: &bulk::FileMap) -> Result<()> {
        debug!("apply at {base}");
        bulk::apply(self, base, map)
    }
}

fn join_prefix(prefix: &str, seg: &str) -> String {
    if prefix.ends_with('/') {
        format!("{}{}", prefix, seg)
    } else {
        format!("{}/{}", prefix, seg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_fs() -> FileSystem {
        FileSystem::new(CaseMode::Sensitive)
    }

    #[test]
    fn create_and_read() {
        let fs = new_fs();
        fs.mkdir("/a", 0o755).unwrap();
        fs.write_file("/a/f", b"hi").unwrap();
        assert_eq!(fs.read_file("/a/f").unwrap(), b"hi");
        assert_eq!(fs.stat("/a/f").unwrap().size, 2);
    }

    #[test]
    fn symlink_traversal() {
        let fs = new_fs();
        fs.mkdir("/a", 0o755).unwrap();
        fs.write_file("/a/f", b"hi").unwrap();
        fs.symlink("f", "/a/g").unwrap();
        assert_eq!(fs.read_file("/a/g").unwrap(), b"hi");
        assert!(fs.lstat("/a/g").unwrap().is_symbolic_link());
        assert!(fs.stat("/a/g").unwrap().is_file());
    }

    #[test]
    fn loop_detection() {
        let fs = new_fs();
        fs.mkdir("/a", 0o755).unwrap();
        fs.symlink("g", "/a/g").unwrap();
        let err = fs.stat("/a/g").unwrap_err();
        assert_eq!(err.code, ErrnoKind::ELOOP);
    }

    #[test]
    fn rename_cookies_match() {
        let fs = new_fs();
        fs.mkdir("/a", 0o755).unwrap();
        fs.write_file("/a/f", b"hi").unwrap();

        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let events2 = events.clone();
        let ifd = fs.inotify_init(Arc::new(move |e: InotifyEvent| events2.lock().unwrap().push(e)));
        fs.inotify_add_watch(ifd, "/a", InotifyMask::IN_MOVED_FROM | InotifyMask::IN_MOVED_TO)
            .unwrap();

        fs.rename("/a/f", "/a/h").unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name.as_deref(), Some("f"));
        assert_eq!(events[1].name.as_deref(), Some("h"));
        assert_eq!(events[0].cookie, events[1].cookie);
        assert_ne!(events[0].cookie, 0);
    }

    #[test]
    fn shadow_isolation() {
        let fs = new_fs();
        fs.mkdir("/a", 0o755).unwrap();
        fs.write_file("/a/f", b"hi").unwrap();
        fs.make_readonly();
        let g = fs.shadow(CaseMode::Sensitive).unwrap();
        g.write_file("/a/f", b"bye").unwrap();
        assert_eq!(fs.read_file("/a/f").unwrap(), b"hi");
        assert_eq!(g.read_file("/a/f").unwrap(), b"bye");
    }

    #[test]
    fn mount_lazy_materialization() {
        use crate::mount::{FsResolver, SourceKind, SourceStat};
        use std::sync::atomic::{AtomicUsize, Ordering as O};

        struct Resolver {
            readdir_calls: AtomicUsize,
            stat_calls: AtomicUsize,
        }
        impl FsResolver for Resolver {
            fn stat(&self, path: &str) -> Result<SourceStat> {
                self.stat_calls.fetch_add(1, O::SeqCst);
                if path == "/src/f" {
                    Ok(SourceStat { kind: SourceKind::File, size: 2 })
                } else {
                    Ok(SourceStat { kind: SourceKind::Dir, size: 0 })
                }
            }
            fn readdir(&self, _path: &str) -> Result<Vec<String>> {
                self.readdir_calls.fetch_add(1, O::SeqCst);
                Ok(vec!["f".to_string()])
            }
            fn read_file(&self, _path: &str) -> Result<Vec<u8>> {
                Ok(b"hi".to_vec())
            }
        }

        let fs = new_fs();
        let resolver = Arc::new(Resolver {
            readdir_calls: AtomicUsize::new(0),
            stat_calls: AtomicUsize::new(0),
        });
        fs.mount("/src", "/mnt", resolver.clone(), 0o755).unwrap();
        assert_eq!(resolver.readdir_calls.load(O::SeqCst), 0);

        let bytes = fs.read_file("/mnt/f").unwrap();
        assert_eq!(bytes, b"hi");
        assert_eq!(resolver.readdir_calls.load(O::SeqCst), 1);
        assert_eq!(resolver.stat_calls.load(O::SeqCst), 1);
    }
}
