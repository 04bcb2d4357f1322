//! The mount mechanism.
//!
//! Grounded on `rcore-fs-mountfs/src/lib.rs`'s `MNode::mount`, generalized
//! from "nest another `FileSystem` trait object under an inode" to
//! "lazily fault in children from an external stat/readdir/readFile
//! resolver" — closer to what `rcore-fs-hostfs` does by reaching straight
//! into `std::fs`; here that reach-out is an injected trait instead.

use std::sync::Arc;

use crate::error::Result;
use crate::inode::{Inode, InodeRef, PendingSource};
use crate::path::CaseMode;

/// Kind of a source-filesystem entry, as reported by [`FsResolver::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Dir,
}

#[derive(Debug, Clone, Copy)]
pub struct SourceStat {
    pub kind: SourceKind,
    pub size: u64,
}

/// Injected collaborator giving the mount point read-only access to an
/// external filesystem.
pub trait FsResolver: Send + Sync {
    fn stat(&self, path: &str) -> Result<SourceStat>;
    fn readdir(&self, path: &str) -> Result<Vec<String>>;
    fn read_file(&self, path: &str) -> Result<Vec<u8>>;
}

/// Build a directory inode whose children will be faulted in from
/// `resolver` lazily, the first time its `_getLinks` equivalent
/// ([`materialize_dir`]) is called.
pub fn make_mount_dir(
    source: &str,
    resolver: Arc<dyn FsResolver>,
    mode: u32,
    uid: u32,
    gid: u32,
    case_mode: CaseMode,
) -> InodeRef {
    let node = Inode::new_dir(mode, uid, gid, case_mode);
    {
        let mut guard = node.write().unwrap();
        if let Inode::Dir(dir) = &mut *guard {
            dir.children = None;
            dir.pending = Some(PendingSource {
                source_path: source.to_string(),
                resolver,
            });
        }
    }
    node
}

/// On first access of a mount directory's children: call `readdirSync` once,
/// `statSync` each entry once, and mint child file/dir inodes pointing at
/// the corresponding source path, clearing this node's own pending source.
pub fn materialize_dir(node: &InodeRef, uid: u32, gid: u32) -> Result<()> {
    let (source, resolver, case_mode) = {
        let guard = node.read().unwrap();
        match &*guard {
            Inode::Dir(dir) => match &dir.pending {
                Some(p) => (p.source_path.clone(), p.resolver.clone(), dir.case_mode),
                None => return Ok(()),
            },
            _ => return Ok(()),
        }
    };

    let names = resolver.readdir(&source)?;
    let mut children = std::collections::BTreeMap::new();
    for name in names {
        let child_source = crate::path::combine(&source, &name);
        let st = resolver.stat(&child_source)?;
        let child = match st.kind {
            SourceKind::Dir => make_mount_dir(&child_source, resolver.clone(), 0o755, uid, gid, case_mode),
            SourceKind::File => {
                let f = Inode::new_file(0o644, uid, gid);
                {
                    let mut guard = f.write().unwrap();
                    if let Inode::File(file) = &mut *guard {
                        file.content = None;
                        file.pending = Some(PendingSource {
                            source_path: child_source.clone(),
                            resolver: resolver.clone(),
                        });
                    }
                }
                f
            }
        };
        children.insert(name, child);
    }

    let mut guard = node.write().unwrap();
    if let Inode::Dir(dir) = &mut *guard {
        dir.children = Some(children);
        dir.pending = None;
    }
    Ok(())
}

/// On first read of a mounted file's bytes: fetch once from the source and
/// clear the pending source.
pub fn materialize_file(node: &InodeRef) -> Result<()> {
    let (source, resolver) = {
        let guard = node.read().unwrap();
        match &*guard {
            Inode::File(f) => match &f.pending {
                Some(p) => (p.source_path.clone(), p.resolver.clone()),
                None => return Ok(()),
            },
            _ => return Ok(()),
        }
    };

    let bytes = resolver.read_file(&source)?;
    let mut guard = node.write().unwrap();
    if let Inode::File(f) = &mut *guard {
        f.content = Some(bytes);
        f.pending = None;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingResolver {
        stat_calls: AtomicUsize,
        readdir_calls: AtomicUsize,
        files: Mutex<std::collections::BTreeMap<String, Vec<u8>>>,
    }

    impl FsResolver for CountingResolver {
        fn stat(&self, path: &str) -> Result<SourceStat> {
            self.stat_calls.fetch_add(1, Ordering::SeqCst);
            if self.files.lock().unwrap().contains_key(path) {
                Ok(SourceStat {
                    kind: SourceKind::File,
                    size: 0,
                })
            } else {
                Ok(SourceStat {
                    kind: SourceKind::Dir,
                    size: 0,
                })
            }
        }

        fn readdir(&self, path: &str) -> Result<Vec<String>> {
            self.readdir_calls.fetch_add(1, Ordering::SeqCst);
            if path == "/src" {
                Ok(vec!["a.txt".to_string()])
            } else {
                Ok(vec![])
            }
        }

        fn read_file(&self, path: &str) -> Result<Vec<u8>> {
            Ok(self
                .files
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .unwrap_or_default())
        }
    }

    #[test]
    fn materializes_lazily_and_once() {
        let mut files = std::collections::BTreeMap::new();
        files.insert("/src/a.txt".to_string(), b"hi".to_vec());
        let resolver = Arc::new(CountingResolver {
            stat_calls: AtomicUsize::new(0),
            readdir_calls: AtomicUsize::new(0),
            files: Mutex::new(files),
        });

        let dir = make_mount_dir("/src", resolver.clone(), 0o755, 0, 0, CaseMode::Sensitive);
        assert_eq!(resolver.readdir_calls.load(Ordering::SeqCst), 0);

        materialize_dir(&dir, 0, 0).unwrap();
        assert_eq!(resolver.readdir_calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.stat_calls.load(Ordering::SeqCst), 1);

        materialize_dir(&dir, 0, 0).unwrap();
        assert_eq!(resolver.readdir_calls.load(Ordering::SeqCst), 1);
    }
}
