//! The inotify subsystem.
//!
//! No sibling rcore-fs crate implements a watch facility; the lock-guarded
//! registry shape (map keyed by a small integer, looked up under a single
//! lock) is grounded on `darkfireeee-Exo-OS/libs/exo_service_registry`'s
//! service registry.

use std::sync::Arc;

use crate::consts::InotifyMask;
use crate::error::{FsError, Result};
use crate::fd::{Descriptor, FdTable, InotifyDescription, InotifyEvent, WatchEntry};
use crate::inode::{next_cookie, next_wd, InodeRef};

/// `inotify_add_watch(fd, path, mask)`.
///
/// Merges with an existing watch from the same watcher per spec: with
/// `IN_MASK_ADD` the new mask is OR'd in, otherwise it replaces the old
/// one.
pub fn add_watch(
    fds: &FdTable,
    inotify_fd: u64,
    path: &str,
    node: &InodeRef,
    mask: InotifyMask,
) -> Result<u64> {
    if mask.contains(InotifyMask::IN_ONLYDIR) {
        let guard = node.read().unwrap();
        if !guard.is_dir() {
            return Err(FsError::enotdir("inotify_add_watch", path));
        }
    }

    let existing_wd = {
        let mut header_wd = None;
        let guard = node.read().unwrap();
        if let Some(watches) = &guard.header().watches {
            for (&(owner, wd), _) in watches.iter() {
                if owner == inotify_fd {
                    header_wd = Some(wd);
                    break;
                }
            }
        }
        header_wd
    };

    let restricted = mask & InotifyMask::IN_ALL_EVENTS;

    if let Some(wd) = existing_wd {
        let mut node_guard = node.write().unwrap();
        let header = node_guard.header_mut();
        let watches = header.watches.get_or_insert_with(Default::default);
        let entry = watches.entry((inotify_fd, wd)).or_insert(0);
        let new_mask = if mask.contains(InotifyMask::IN_MASK_ADD) {
            *entry | restricted.bits()
        } else {
            restricted.bits()
        };
        *entry = new_mask;
        drop(node_guard);

        fds.with_inotify(inotify_fd, |id| {
            if let Some(w) = id.by_wd.get_mut(&wd) {
                w.mask = InotifyMask::from_bits_truncate(new_mask);
            }
        });
        return Ok(wd);
    }

    let wd = next_wd();
    {
        let mut node_guard = node.write().unwrap();
        let header = node_guard.header_mut();
        header
            .watches
            .get_or_insert_with(Default::default)
            .insert((inotify_fd, wd), restricted.bits());
    }

    fds.with_inotify(inotify_fd, |id| {
        id.by_wd.insert(
            wd,
            WatchEntry {
                wd,
                path: path.to_string(),
                node: node.clone(),
                mask: restricted,
            },
        );
        id.by_path.insert(path.to_string(), wd);
    });

    Ok(wd)
}

/// `inotify_rm_watch`: detach from the node and from both descriptor maps,
/// then deliver a final `IN_IGNORED`.
pub fn rm_watch(fds: &FdTable, inotify_fd: u64, wd: u64) -> Result<()> {
    let entry = fds
        .with_inotify(inotify_fd, |id| {
            let entry = id.by_wd.remove(&wd);
            if let Some(e) = &entry {
                id.by_path.remove(&e.path);
            }
            entry
        })
        .flatten();

    let entry = entry.ok_or_else(|| FsError::einval("inotify_rm_watch"))?;

    {
        let mut node_guard = entry.node.write().unwrap();
        if let Some(watches) = &mut node_guard.header_mut().watches {
            watches.remove(&(inotify_fd, wd));
        }
    }

    deliver(fds, inotify_fd, wd, InotifyMask::IN_IGNORED.bits(), None, 0);
    Ok(())
}

/// Deliver an event to one inotify descriptor's callback, if it still
/// exists.
fn deliver(fds: &FdTable, inotify_fd: u64, wd: u64, mask: u32, name: Option<String>, cookie: u64) {
    fds.with_inotify(inotify_fd, |id| {
        (id.callback)(InotifyEvent {
            wd,
            mask,
            cookie,
            name,
        });
    });
}

/// `_notify(node, mask, name, cookie)`: fan out to every watch on `node`.
///
/// `deliveredMask = (mask & watch.mask) | (mask & ~IN_ALL_EVENTS)`; skipped
/// when zero. `IN_ONESHOT` watches are removed after delivery without an
/// `IN_IGNORED`.
pub fn notify(fds: &FdTable, node: &InodeRef, mask: InotifyMask, name: Option<&str>, cookie: u64) {
    let watchers: Vec<(u64, u64, u32)> = {
        let guard = node.read().unwrap();
        match &guard.header().watches {
            Some(watches) => watches
                .iter()
                .map(|(&(owner, wd), &m)| (owner, wd, m))
                .collect(),
            None => Vec::new(),
        }
    };

    let mut oneshot_to_remove: Vec<(u64, u64)> = Vec::new();

    for (owner_fd, wd, watch_mask) in watchers {
        let in_all = InotifyMask::IN_ALL_EVENTS.bits();
        let delivered = (mask.bits() & watch_mask) | (mask.bits() & !in_all);
        if delivered == 0 {
            continue;
        }
        deliver(
            fds,
            owner_fd,
            wd,
            delivered,
            name.map(|n| n.to_string()),
            cookie,
        );
        if watch_mask & InotifyMask::IN_ONESHOT.bits() != 0 {
            oneshot_to_remove.push((owner_fd, wd));
        }
    }

    if !oneshot_to_remove.is_empty() {
        let mut node_guard = node.write().unwrap();
        if let Some(watches) = &mut node_guard.header_mut().watches {
            for key in &oneshot_to_remove {
                watches.remove(key);
            }
        }
        drop(node_guard);
        for (owner_fd, wd) in oneshot_to_remove {
            fds.with_inotify(owner_fd, |id| {
                if let Some(entry) = id.by_wd.remove(&wd) {
                    id.by_path.remove(&entry.path);
                }
            });
        }
    }
}

/// Tear down every watch on `node` (e.g. nlink reached 0), delivering
/// `IN_IGNORED` for each one.
pub fn teardown_all_watches(fds: &FdTable, node: &InodeRef) {
    let watchers: Vec<(u64, u64)> = {
        let guard = node.read().unwrap();
        match &guard.header().watches {
            Some(watches) => watches.keys().cloned().collect(),
            None => Vec::new(),
        }
    };

    {
        let mut node_guard = node.write().unwrap();
        node_guard.header_mut().watches = None;
    }

    for (owner_fd, wd) in watchers {
        fds.with_inotify(owner_fd, |id| {
            if let Some(entry) = id.by_wd.remove(&wd) {
                id.by_path.remove(&entry.path);
            }
        });
        deliver(fds, owner_fd, wd, InotifyMask::IN_IGNORED.bits(), None, 0);
    }
}

pub fn new_cookie() -> u64 {
    next_cookie()
}

pub fn inotify_init(fds: &FdTable, callback: Arc<dyn Fn(InotifyEvent) + Send + Sync>) -> u64 {
    let fd = crate::inode::next_fd();
    fds.insert(
        fd,
        Descriptor::Inotify(InotifyDescription {
            fd,
            by_wd: Default::default(),
            by_path: Default::default(),
            callback,
        }),
    );
    fd
}

/// A coarser view of a raw `InotifyEvent`, for callers that only care
/// whether something changed or was renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Change,
    Rename,
}

const RENAME_MASK: u32 = InotifyMask::IN_MOVED_FROM.bits()
    | InotifyMask::IN_MOVED_TO.bits()
    | InotifyMask::IN_MOVE_SELF.bits();

impl InotifyEvent {
    /// Collapse this event's raw mask into `Change`/`Rename`. `IN_IGNORED`
    /// (pure watch teardown, no content change) is suppressed entirely.
    pub fn kind(&self) -> Option<WatchEventKind> {
        if self.mask & InotifyMask::IN_IGNORED.bits() != 0 {
            return None;
        }
        if self.mask & RENAME_MASK != 0 {
            Some(WatchEventKind::Rename)
        } else {
            Some(WatchEventKind::Change)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::CaseMode;
    use std::sync::Mutex;

    #[test]
    fn add_watch_merges_mask_with_mask_add() {
        let fds = FdTable::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let events2 = events.clone();
        let fd = inotify_init(
            &fds,
            Arc::new(move |e: InotifyEvent| events2.lock().unwrap().push(e)),
        );
        let node = crate::inode::Inode::new_dir(0o755, 0, 0, CaseMode::Sensitive);

        let wd1 = add_watch(&fds, fd, "/a", &node, InotifyMask::IN_CREATE).unwrap();
        let wd2 = add_watch(
            &fds,
            fd,
            "/a",
            &node,
            InotifyMask::IN_DELETE | InotifyMask::IN_MASK_ADD,
        )
        .unwrap();
        assert_eq!(wd1, wd2);

        notify(&fds, &node, InotifyMask::IN_DELETE, Some("f"), 0);
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn event_kind_suppresses_ignored_and_distinguishes_rename() {
        let change = InotifyEvent { wd: 1, mask: InotifyMask::IN_MODIFY.bits(), cookie: 0, name: None };
        let rename = InotifyEvent { wd: 1, mask: InotifyMask::IN_MOVED_FROM.bits(), cookie: 7, name: None };
        let ignored = InotifyEvent { wd: 1, mask: InotifyMask::IN_IGNORED.bits(), cookie: 0, name: None };
        assert_eq!(change.kind(), Some(WatchEventKind::Change));
        assert_eq!(rename.kind(), Some(WatchEventKind::Rename));
        assert_eq!(ignored.kind(), None);
    }

    #[test]
    fn rm_watch_delivers_ignored() {
        let fds = FdTable::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let events2 = events.clone();
        let fd = inotify_init(
            &fds,
            Arc::new(move |e: InotifyEvent| events2.lock().unwrap().push(e)),
        );
        let node = crate::inode::Inode::new_dir(0o755, 0, 0, CaseMode::Sensitive);
        let wd = add_watch(&fds, fd, "/a", &node, InotifyMask::IN_CREATE).unwrap();
        rm_watch(&fds, fd, wd).unwrap();
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].mask, InotifyMask::IN_IGNORED.bits());
    }
}
