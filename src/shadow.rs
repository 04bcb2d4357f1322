//! The shadow (copy-on-read) overlay.
//!
//! Grounded on `rcore-fs-unionfs`'s `VirtualINode` (a real inode plus a
//! lazily-advanced distance to the nearest real ancestor) and the
//! `Arc`/`Weak` self-referential wrapping idiom both `rcore-fs-unionfs` and
//! `rcore-fs-mountfs` use (`wrap()` via `Arc::into_raw`/`Arc::from_raw`).
//! The "copy header, defer content" shape mirrors
//! `ensure_container_file_exist` copying an image-layer file into the
//! writable container layer on first write.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{FsError, Result};
use crate::inode::{Inode, InodeRef, WeakInodeRef};
use crate::path::CaseMode;

/// Build a single shadow node (file, dir, or symlink) pointing back at
/// `source`. Children/content are left empty; they fault in lazily.
pub fn shadow_of(source: &InodeRef) -> InodeRef {
    let guard = source.read().unwrap();
    let weak: WeakInodeRef = Arc::downgrade(source);
    match &*guard {
        Inode::File(f) => Arc::new(std::sync::RwLock::new(Inode::File(crate::inode::RegularFile {
            header: clone_header(&f.header),
            content: None,
            pending: None,
            shadow_root: Some(weak),
        }))),
        Inode::Dir(d) => Arc::new(std::sync::RwLock::new(Inode::Dir(crate::inode::Directory {
            header: clone_header(&d.header),
            children: None,
            pending: None,
            shadow_root: Some(weak),
            case_mode: d.case_mode,
        }))),
        Inode::Symlink(s) => Arc::new(std::sync::RwLock::new(Inode::Symlink(crate::inode::SymLink {
            header: clone_header(&s.header),
            target: s.target.clone(),
            shadow_root: Some(weak),
        }))),
    }
}

fn clone_header(h: &crate::inode::InodeHeader) -> crate::inode::InodeHeader {
    crate::inode::InodeHeader {
        dev: h.dev,
        ino: h.ino,
        mode: h.mode,
        nlink: h.nlink,
        uid: h.uid,
        gid: h.gid,
        atime_ms: h.atime_ms,
        mtime_ms: h.mtime_ms,
        ctime_ms: h.ctime_ms,
        birthtime_ms: h.birthtime_ms,
        metadata_bag: None,
        watches: None,
        rdev: h.rdev,
    }
}

/// Casing compatibility check run at `shadow()` construction: a
/// case-insensitive child atop a case-sensitive parent is rejected.
pub fn check_case_compat(parent: CaseMode, child: CaseMode) -> Result<()> {
    if parent == CaseMode::Sensitive && child == CaseMode::Insensitive {
        return Err(FsError::einval("shadow"));
    }
    Ok(())
}

/// Materialise a shadow directory's children: copy each child header from
/// the shadow root's children mapping, producing further shadow nodes.
/// `ensure_shadow_root_children` ensures the upstream root's own children
/// are materialised first (it may itself be a shadow/mount node).
pub fn materialize_dir(
    node: &InodeRef,
    ensure_shadow_root_children: impl FnOnce(&InodeRef) -> Result<()>,
) -> Result<()> {
    let shadow_root = {
        let guard = node.read().unwrap();
        match &*guard {
            Inode::Dir(dir) if dir.children.is_none() => dir.shadow_root.clone(),
            _ => return Ok(()),
        }
    };

    let shadow_root = match shadow_root.and_then(|w| w.upgrade()) {
        Some(r) => r,
        None => {
            let mut guard = node.write().unwrap();
            if let Inode::Dir(dir) = &mut *guard {
                if dir.children.is_none() {
                    dir.children = Some(BTreeMap::new());
                }
            }
            return Ok(());
        }
    };

    ensure_shadow_root_children(&shadow_root)?;

    let mut children = BTreeMap::new();
    {
        let root_guard = shadow_root.read().unwrap();
        if let Inode::Dir(root_dir) = &*root_guard {
            if let Some(root_children) = &root_dir.children {
                for (name, child) in root_children {
                    children.insert(name.clone(), shadow_of(child));
                }
            }
        }
    }

    let mut guard = node.write().unwrap();
    if let Inode::Dir(dir) = &mut *guard {
        dir.children = Some(children);
    }
    Ok(())
}

/// Materialise a shadow file's bytes from the shadow chain.
pub fn materialize_file(
    node: &InodeRef,
    ensure_shadow_root_content: impl FnOnce(&InodeRef) -> Result<()>,
) -> Result<()> {
    let shadow_root = {
        let guard = node.read().unwrap();
        match &*guard {
            Inode::File(f) if f.content.is_none() => f.shadow_root.clone(),
            _ => return Ok(()),
        }
    };

    let shadow_root = match shadow_root.and_then(|w| w.upgrade()) {
        Some(r) => r,
        None => {
            let mut guard = node.write().unwrap();
            if let Inode::File(f) = &mut *guard {
                if f.content.is_none() {
                    f.content = Some(Vec::new());
                }
            }
            return Ok(());
        }
    };

    ensure_shadow_root_content(&shadow_root)?;

    let bytes = {
        let root_guard = shadow_root.read().unwrap();
        match &*root_guard {
            Inode::File(f) => f.content.clone().unwrap_or_default(),
            _ => Vec::new(),
        }
    };

    let mut guard = node.write().unwrap();
    if let Inode::File(f) = &mut *guard {
        f.content = Some(bytes);
    }
    Ok(())
}

/// Metadata fall-through: look up `key` on `node`, then on its shadow chain.
pub fn get_metadata(node: &InodeRef, key: &str) -> Option<Vec<u8>> {
    let (local, shadow_root) = {
        let guard = node.read().unwrap();
        let header = guard.header();
        let local = header.metadata_bag.as_ref().and_then(|b| b.get(key).cloned());
        (local, guard.shadow_root().cloned())
    };
    if local.is_some() {
        return local;
    }
    shadow_root
        .and_then(|w| w.upgrade())
        .and_then(|root| get_metadata(&root, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_write_never_touches_parent() {
        let parent_root = Inode::new_dir(0o755, 0, 0, CaseMode::Sensitive);
        let file = Inode::new_file(0o644, 0, 0);
        if let Inode::File(f) = &mut *file.write().unwrap() {
            f.content = Some(b"hi".to_vec());
        }
        if let Inode::Dir(d) = &mut *parent_root.write().unwrap() {
            d.children.as_mut().unwrap().insert("f".to_string(), file.clone());
        }

        let child_root = shadow_of(&parent_root);
        materialize_dir(&child_root, |_| Ok(())).unwrap();

        let child_file = {
            let guard = child_root.read().unwrap();
            match &*guard {
                Inode::Dir(d) => d.children.as_ref().unwrap().get("f").unwrap().clone(),
                _ => panic!("expected dir"),
            }
        };

        materialize_file(&child_file, |_| Ok(())).unwrap();
        if let Inode::File(f) = &mut *child_file.write().unwrap() {
            f.content = Some(b"bye".to_vec());
        }

        let parent_bytes = match &*file.read().unwrap() {
            Inode::File(f) => f.content.clone().unwrap(),
            _ => unreachable!(),
        };
        assert_eq!(parent_bytes, b"hi".to_vec());
    }
}
