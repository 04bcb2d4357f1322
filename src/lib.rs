//! An in-memory, POSIX-like virtual filesystem.
//!
//! A [`FileSystem`] holds a tree of inodes behind `Arc<RwLock<_>>` handles,
//! reached through a path resolver that expands symlinks and detects
//! loops, guarded by a 9-bit permission model. Mutating operations go
//! through an open-file-description table with copy-before-write
//! semantics and fan out change notifications through an inotify-style
//! watch facility and a poll-based `watchFile` facility. A read-only
//! filesystem can be cheaply [`FileSystem::shadow`]ed into a writable
//! copy-on-read overlay, and a directory can be bound to an external
//! resolver that lazily materialises its contents on first touch. A whole
//! tree can be created or torn down in one call via [`bulk::apply`].

pub mod bulk;
pub mod consts;
pub mod error;
pub mod fd;
pub mod fs;
pub mod inode;
pub mod inotify;
pub mod mount;
pub mod path;
pub mod poll;
pub mod shadow;

pub use bulk::{apply, FileMap, TaggedEntry};
pub use consts::{InotifyMask, OFlags};
pub use error::{ErrnoKind, FsError, Result};
pub use fd::InotifyEvent;
pub use inotify::WatchEventKind;
pub use fs::{access_check, require_root, Entry, FileSystem};
pub use inode::Stat;
pub use mount::{FsResolver, SourceKind, SourceStat};
pub use path::CaseMode;
pub use poll::{IntervalScheduler, PollWatcher};
