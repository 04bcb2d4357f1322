//! The open-file-description table.
//!
//! `rcore-fs`'s `INode::read_at`/`write_at` mutate the inode directly with
//! no descriptor indirection; this table adds one, keyed by an atomic id
//! counter the same way `rcore-fs-ramfs` allocates inode ids.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::consts::InotifyMask;
use crate::inode::InodeRef;

/// One entry in the descriptor table.
pub enum Descriptor {
    Open(OpenDescription),
    Inotify(InotifyDescription),
}

pub struct OpenDescription {
    pub fd: u64,
    pub path_at_open: String,
    pub basename: String,
    pub parent: InodeRef,
    pub node: InodeRef,
    pub flags: crate::consts::OFlags,
    pub offset: u64,
    pub dirty: bool,
    /// The descriptor's privately-owned staged buffer, allocated on first
    /// write (copy-before-write) or bound as a read view on first read.
    pub staged: Option<Vec<u8>>,
}

pub struct InotifyDescription {
    pub fd: u64,
    /// wd -> (watched inode, watched path, mask)
    pub by_wd: BTreeMap<u64, WatchEntry>,
    /// watched path -> wd, for fast lookup.
    pub by_path: BTreeMap<String, u64>,
    pub callback: Arc<dyn Fn(InotifyEvent) + Send + Sync>,
}

#[derive(Clone)]
pub struct WatchEntry {
    pub wd: u64,
    pub path: String,
    pub node: InodeRef,
    pub mask: InotifyMask,
}

#[derive(Debug, Clone)]
pub struct InotifyEvent {
    pub wd: u64,
    pub mask: u32,
    pub cookie: u64,
    pub name: Option<String>,
}

/// The descriptor table itself.
pub struct FdTable {
    entries: RwLock<BTreeMap<u64, Descriptor>>,
}

impl FdTable {
    pub fn new() -> Self {
        FdTable {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn insert(&self, fd: u64, desc: Descriptor) {
        self.entries.write().unwrap().insert(fd, desc);
    }

    pub fn remove(&self, fd: u64) -> Option<Descriptor> {
        self.entries.write().unwrap().remove(&fd)
    }

    pub fn with_open<R>(&self, fd: u64, f: impl FnOnce(&mut OpenDescription) -> R) -> Option<R> {
        let mut entries = self.entries.write().unwrap();
        match entries.get_mut(&fd) {
            Some(Descriptor::Open(od)) => Some(f(od)),
            _ => None,
        }
    }

    pub fn with_inotify<R>(
        &self,
        fd: u64,
        f: impl FnOnce(&mut InotifyDescription) -> R,
    ) -> Option<R> {
        let mut entries = self.entries.write().unwrap();
        match entries.get_mut(&fd) {
            Some(Descriptor::Inotify(id)) => Some(f(id)),
            _ => None,
        }
    }

    pub fn contains(&self, fd: u64) -> bool {
        self.entries.read().unwrap().contains_key(&fd)
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}
