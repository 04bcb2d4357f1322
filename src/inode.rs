//! The inode data model.
//!
//! Grounded on `rcore-fs-ramfs/src/lib.rs`'s `RamFSINode`/`LockedINode`
//! pair: a `RwLock`-guarded header+content struct behind an `Arc`, with a
//! process-wide `AtomicU64` id counter generalized here to five counters
//! (dev/ino/fd/wd/cookie).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::consts::{S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
use crate::path::CaseMode;

static NEXT_DEV: AtomicU64 = AtomicU64::new(1);
static NEXT_INO: AtomicU64 = AtomicU64::new(1);
static NEXT_FD: AtomicU64 = AtomicU64::new(1);
static NEXT_WD: AtomicU64 = AtomicU64::new(1);
static NEXT_COOKIE: AtomicU64 = AtomicU64::new(1);

pub fn next_dev() -> u64 {
    NEXT_DEV.fetch_add(1, Ordering::SeqCst)
}
pub fn next_ino() -> u64 {
    NEXT_INO.fetch_add(1, Ordering::SeqCst)
}
pub fn next_fd() -> u64 {
    NEXT_FD.fetch_add(1, Ordering::SeqCst)
}
pub fn next_wd() -> u64 {
    NEXT_WD.fetch_add(1, Ordering::SeqCst)
}
pub fn next_cookie() -> u64 {
    NEXT_COOKIE.fetch_add(1, Ordering::SeqCst)
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A reference-counted, interior-mutable inode handle. Directory entries
/// and open descriptors hold clones of this handle; none of them owns the
/// inode exclusively.
pub type InodeRef = Arc<RwLock<Inode>>;
pub type WeakInodeRef = Weak<RwLock<Inode>>;

/// Shared header, common to every inode kind.
pub struct InodeHeader {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32, // type bits + 12-bit permission bits
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime_ms: i64,
    pub mtime_ms: i64,
    pub ctime_ms: i64,
    pub birthtime_ms: i64,
    pub metadata_bag: Option<BTreeMap<String, Vec<u8>>>,
    /// (inotify fd, wd) -> mask, for every watcher on this inode.
    pub watches: Option<BTreeMap<(u64, u64), u32>>,
    pub rdev: u64,
}

impl InodeHeader {
    fn new(mode: u32, uid: u32, gid: u32) -> Self {
        let now = now_ms();
        InodeHeader {
            dev: next_dev(),
            ino: next_ino(),
            mode,
            nlink: 1,
            uid,
            gid,
            atime_ms: now,
            mtime_ms: now,
            ctime_ms: now,
            birthtime_ms: now,
            metadata_bag: None,
            watches: None,
            rdev: 0,
        }
    }

    pub fn file_type_bits(&self) -> u32 {
        self.mode & S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.file_type_bits() == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.file_type_bits() == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type_bits() == S_IFLNK
    }

    pub fn touch_mtime_ctime(&mut self) {
        let now = now_ms();
        self.mtime_ms = now;
        self.ctime_ms = now;
    }

    pub fn touch_atime(&mut self) {
        self.atime_ms = now_ms();
    }

    pub fn touch_ctime(&mut self) {
        self.ctime_ms = now_ms();
    }
}

/// Source used for lazy materialisation (mount) of a node that has no
/// content yet.
pub struct PendingSource {
    pub source_path: String,
    pub resolver: Arc<dyn crate::mount::FsResolver>,
}

pub struct RegularFile {
    pub header: InodeHeader,
    pub content: Option<Vec<u8>>,
    pub pending: Option<PendingSource>,
    pub shadow_root: Option<WeakInodeRef>,
}

pub struct Directory {
    pub header: InodeHeader,
    pub children: Option<BTreeMap<String, InodeRef>>,
    pub pending: Option<PendingSource>,
    pub shadow_root: Option<WeakInodeRef>,
    pub case_mode: CaseMode,
}

pub struct SymLink {
    pub header: InodeHeader,
    pub target: String,
    pub shadow_root: Option<WeakInodeRef>,
}

/// Tagged sum type: pattern-match at every use site, no inheritance.
pub enum Inode {
    File(RegularFile),
    Dir(Directory),
    Symlink(SymLink),
}

impl Inode {
    pub fn new_file(mode: u32, uid: u32, gid: u32) -> InodeRef {
        Arc::new(RwLock::new(Inode::File(RegularFile {
            header: InodeHeader::new(S_IFREG | (mode & 0o7777), uid, gid),
            content: Some(Vec::new()),
            pending: None,
            shadow_root: None,
        })))
    }

    pub fn new_dir(mode: u32, uid: u32, gid: u32, case_mode: CaseMode) -> InodeRef {
        Arc::new(RwLock::new(Inode::Dir(Directory {
            header: InodeHeader::new(S_IFDIR | (mode & 0o7777), uid, gid),
            children: Some(BTreeMap::new()),
            pending: None,
            shadow_root: None,
            case_mode,
        })))
    }

    pub fn new_symlink(target: String, uid: u32, gid: u32) -> InodeRef {
        Arc::new(RwLock::new(Inode::Symlink(SymLink {
            header: InodeHeader::new(S_IFLNK | 0o666, uid, gid),
            target,
            shadow_root: None,
        })))
    }

    pub fn header(&self) -> &InodeHeader {
        match self {
            Inode::File(f) => &f.header,
            Inode::Dir(d) => &d.header,
            Inode::Symlink(s) => &s.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut InodeHeader {
        match self {
            Inode::File(f) => &mut f.header,
            Inode::Dir(d) => &mut d.header,
            Inode::Symlink(s) => &mut s.header,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.header().is_dir()
    }

    pub fn is_file(&self) -> bool {
        self.header().is_file()
    }

    pub fn is_symlink(&self) -> bool {
        self.header().is_symlink()
    }

    pub fn size(&self) -> u64 {
        match self {
            Inode::File(f) => f.content.as_ref().map(|c| c.len() as u64).unwrap_or(0),
            Inode::Dir(d) => d.children.as_ref().map(|c| c.len() as u64).unwrap_or(0),
            Inode::Symlink(s) => s.target.len() as u64,
        }
    }

    pub fn shadow_root(&self) -> Option<&WeakInodeRef> {
        match self {
            Inode::File(f) => f.shadow_root.as_ref(),
            Inode::Dir(d) => d.shadow_root.as_ref(),
            Inode::Symlink(s) => s.shadow_root.as_ref(),
        }
    }
}

/// Stat record. `blksize` is fixed at 4096, `blocks` is fixed at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime_ms: i64,
    pub mtime_ms: i64,
    pub ctime_ms: i64,
    pub birthtime_ms: i64,
}

impl Stat {
    pub fn empty() -> Self {
        Stat {
            dev: 0,
            ino: 0,
            mode: 0,
            nlink: 0,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: 0,
            blksize: 4096,
            blocks: 0,
            atime_ms: 0,
            mtime_ms: 0,
            ctime_ms: 0,
            birthtime_ms: 0,
        }
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
    pub fn is_symbolic_link(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }
}

pub fn stat_of(node: &Inode) -> Stat {
    let h = node.header();
    Stat {
        dev: h.dev,
        ino: h.ino,
        mode: h.mode,
        nlink: h.nlink,
        uid: h.uid,
        gid: h.gid,
        rdev: h.rdev,
        size: node.size(),
        blksize: 4096,
        blocks: 0,
        atime_ms: h.atime_ms,
        mtime_ms: h.mtime_ms,
        ctime_ms: h.ctime_ms,
        birthtime_ms: h.birthtime_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_file_has_regular_type_bit() {
        let f = Inode::new_file(0o644, 0, 0);
        let guard = f.read().unwrap();
        assert!(guard.is_file());
        assert_eq!(guard.header().mode & 0o777, 0o644);
    }

    #[test]
    fn new_dir_children_start_empty() {
        let d = Inode::new_dir(0o755, 0, 0, CaseMode::Sensitive);
        let guard = d.read().unwrap();
        match &*guard {
            Inode::Dir(dir) => assert_eq!(dir.children.as_ref().unwrap().len(), 0),
            _ => panic!("expected dir"),
        }
    }

    #[test]
    fn ids_are_monotonic_and_unique() {
        let a = next_ino();
        let b = next_ino();
        assert!(b > a);
    }
}
