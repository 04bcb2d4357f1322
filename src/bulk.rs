//! Bulk tree application (`FileMap`/`apply`).
//!
//! No sibling rcore-fs crate builds a whole tree from a single in-memory
//! description; the two-pass "structure first, links second" shape is
//! grounded on `rcore-fs-mountfs/src/lib.rs`'s own two-step mount
//! (`mount()` binds the node, a later lookup fills in its contents) —
//! generalized here to an explicit deferred-operation queue so symlinks,
//! hard links and mounts can always find their target already built.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{FsError, Result};
use crate::fs::FileSystem;
use crate::mount;
use crate::path;

/// A directory/file tree description to apply atop a filesystem.
pub enum FileMap {
    /// Remove whatever currently lives at this path (rimraf). A no-op if
    /// nothing is there.
    Absent,
    /// A plain file with these bytes, default mode/ownership.
    Bytes(Vec<u8>),
    /// A directory with these named children, default mode/ownership.
    Dir(BTreeMap<String, FileMap>),
    /// An entry carrying explicit attributes or a link/mount tag.
    Tagged(TaggedEntry),
}

pub enum TaggedEntry {
    Directory {
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        children: BTreeMap<String, FileMap>,
    },
    File {
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        content: Vec<u8>,
    },
    /// A hard link to another path already present in this `apply` call's
    /// tree (resolved in the deferred pass).
    Link { target: String },
    Symlink { target: String },
    Mount {
        source: String,
        resolver: Arc<dyn mount::FsResolver>,
        mode: Option<u32>,
    },
}

enum Deferred {
    Link(String),
    Symlink(String),
    Mount(Arc<dyn mount::FsResolver>, String, u32),
}

/// Apply `map` rooted at `base`. Structural nodes
/// (directories, plain files) are created first; links, symlinks and
/// mounts are deferred to a second pass so their targets already exist.
/// A filesystem root can never be deleted, replaced by a file, or turned
/// into a link — any such attempt fails with `EPERM`.
pub fn apply(fs: &FileSystem, base: &str, map: &FileMap) -> Result<()> {
    let mut deferred = Vec::new();
    apply_pass1(fs, base, map, &mut deferred)?;
    for (path, op) in deferred {
        apply_deferred(fs, &path, op)?;
    }
    Ok(())
}

fn apply_pass1(fs: &FileSystem, path_str: &str, map: &FileMap, deferred: &mut Vec<(String, Deferred)>) -> Result<()> {
    match map {
        FileMap::Absent => {
            if path::is_root(path_str) {
                return Err(FsError::eperm("apply"));
            }
            fs.remove_any(path_str)
        }
        FileMap::Bytes(data) => {
            if path::is_root(path_str) {
                return Err(FsError::eperm("apply"));
            }
            fs.write_file(path_str, data)
        }
        FileMap::Dir(children) => {
            if !path::is_root(path_str) {
                fs.mkdirp(path_str)?;
            }
            apply_children(fs, path_str, children, deferred)
        }
        FileMap::Tagged(TaggedEntry::Directory { mode, children, .. }) => {
            if path::is_root(path_str) {
                if let Some(m) = mode {
                    fs.chmod(path_str, *m)?;
                }
            } else {
                fs.mkdirp_mode(path_str, mode.unwrap_or(0o755))?;
            }
            apply_children(fs, path_str, children, deferred)
        }
        FileMap::Tagged(TaggedEntry::File { content, mode, .. }) => {
            if path::is_root(path_str) {
                return Err(FsError::eperm("apply"));
            }
            fs.write_file(path_str, content)?;
            if let Some(m) = mode {
                fs.chmod(path_str, *m)?;
            }
            Ok(())
        }
        FileMap::Tagged(TaggedEntry::Link { target }) => {
            if path::is_root(path_str) {
                return Err(FsError::eperm("apply"));
            }
            deferred.push((path_str.to_string(), Deferred::Link(target.clone())));
            Ok(())
        }
        FileMap::Tagged(TaggedEntry::Symlink { target }) => {
            if path::is_root(path_str) {
                return Err(FsError::eperm("apply"));
            }
            deferred.push((path_str.to_string(), Deferred::Symlink(target.clone())));
            Ok(())
        }
        FileMap::Tagged(TaggedEntry::Mount { source, resolver, mode }) => {
            if path::is_root(path_str) {
                return Err(FsError::eperm("apply"));
            }
            deferred.push((
                path_str.to_string(),
                Deferred::Mount(resolver.clone(), source.clone(), mode.unwrap_or(0o755)),
            ));
            Ok(())
        }
    }
}

fn apply_children(
    fs: &FileSystem,
    parent: &str,
    children: &BTreeMap<String, FileMap>,
    deferred: &mut Vec<(String, Deferred)>,
) -> Result<()> {
    for (name, child) in children {
        let child_path = path::combine(parent, name);
        apply_pass1(fs, &child_path, child, deferred)?;
    }
    Ok(())
}

fn apply_deferred(fs: &FileSystem, path_str: &str, op: Deferred) -> Result<()> {
    match op {
        Deferred::Link(target) => fs.link(&target, path_str),
        Deferred::Symlink(target) => fs.symlink(&target, path_str),
        Deferred::Mount(resolver, source, mode) => fs.mount(&source, path_str, resolver, mode),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::CaseMode;

    fn dir(children: Vec<(&str, FileMap)>) -> FileMap {
        FileMap::Dir(children.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    #[test]
    fn creates_directories_files_before_links() {
        let fs = FileSystem::new(CaseMode::Sensitive);
        let map = dir(vec![
            ("a", dir(vec![("f", FileMap::Bytes(b"hi".to_vec()))])),
            (
                "g",
                FileMap::Tagged(TaggedEntry::Symlink {
                    target: "a/f".to_string(),
                }),
            ),
        ]);
        apply(&fs, "/", &map).unwrap();
        assert_eq!(fs.read_file("/a/f").unwrap(), b"hi");
        assert_eq!(fs.read_file("/g").unwrap(), b"hi");
    }

    #[test]
    fn root_cannot_be_removed_or_replaced() {
        let fs = FileSystem::new(CaseMode::Sensitive);
        assert!(apply(&fs, "/", &FileMap::Absent).is_err());
        assert!(apply(&fs, "/", &FileMap::Bytes(b"x".to_vec())).is_err());
        assert!(apply(
            &fs,
            "/",
            &FileMap::Tagged(TaggedEntry::Symlink { target: "a".to_string() })
        )
        .is_err());
    }

    #[test]
    fn hard_link_to_sibling_created_in_same_apply() {
        let fs = FileSystem::new(CaseMode::Sensitive);
        let map = dir(vec![
            ("f", FileMap::Bytes(b"hi".to_vec())),
            ("h", FileMap::Tagged(TaggedEntry::Link { target: "/f".to_string() })),
        ]);
        apply(&fs, "/", &map).unwrap();
        assert_eq!(fs.read_file("/h").unwrap(), b"hi");
        assert_eq!(fs.stat("/f").unwrap().nlink, 2);
    }
}
