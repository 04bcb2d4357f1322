//! Error taxonomy.

use std::path::PathBuf;
use thiserror::Error;

/// POSIX-ish error code carried by every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrnoKind {
    ENOENT,
    ENOTDIR,
    EISDIR,
    EACCES,
    EPERM,
    EEXIST,
    EBADF,
    EINVAL,
    EROFS,
    ELOOP,
    ENOTEMPTY,
}

impl ErrnoKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrnoKind::ENOENT => "ENOENT",
            ErrnoKind::ENOTDIR => "ENOTDIR",
            ErrnoKind::EISDIR => "EISDIR",
            ErrnoKind::EACCES => "EACCES",
            ErrnoKind::EPERM => "EPERM",
            ErrnoKind::EEXIST => "EEXIST",
            ErrnoKind::EBADF => "EBADF",
            ErrnoKind::EINVAL => "EINVAL",
            ErrnoKind::EROFS => "EROFS",
            ErrnoKind::ELOOP => "ELOOP",
            ErrnoKind::ENOTEMPTY => "ENOTEMPTY",
        }
    }
}

/// A typed filesystem error: a code, an optional syscall label, and up to
/// two path arguments (mirrors libuv-style errors).
#[derive(Error, Debug, Clone)]
#[error("{code:?} ({syscall:?}): {path:?} -> {path2:?}")]
pub struct FsError {
    pub code: ErrnoKind,
    pub syscall: Option<&'static str>,
    pub path: Option<PathBuf>,
    pub path2: Option<PathBuf>,
}

impl FsError {
    pub fn new(code: ErrnoKind) -> Self {
        FsError {
            code,
            syscall: None,
            path: None,
            path2: None,
        }
    }

    pub fn with_syscall(mut self, syscall: &'static str) -> Self {
        self.syscall = Some(syscall);
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_path2(mut self, path: impl Into<PathBuf>) -> Self {
        self.path2 = Some(path.into());
        self
    }

    // --- constructors for the common call sites -------------------------

    pub fn enoent(syscall: &'static str, path: impl Into<PathBuf>) -> Self {
        Self::new(ErrnoKind::ENOENT)
            .with_syscall(syscall)
            .with_path(path)
    }

    pub fn enotdir(syscall: &'static str, path: impl Into<PathBuf>) -> Self {
        Self::new(ErrnoKind::ENOTDIR)
            .with_syscall(syscall)
            .with_path(path)
    }

    pub fn eisdir(syscall: &'static str, path: impl Into<PathBuf>) -> Self {
        Self::new(ErrnoKind::EISDIR)
            .with_syscall(syscall)
            .with_path(path)
    }

    pub fn eacces(syscall: &'static str, path: impl Into<PathBuf>) -> Self {
        Self::new(ErrnoKind::EACCES)
            .with_syscall(syscall)
            .with_path(path)
    }

    pub fn eperm(syscall: &'static str) -> Self {
        Self::new(ErrnoKind::EPERM).with_syscall(syscall)
    }

    pub fn eexist(syscall: &'static str, path: impl Into<PathBuf>) -> Self {
        Self::new(ErrnoKind::EEXIST)
            .with_syscall(syscall)
            .with_path(path)
    }

    pub fn ebadf(syscall: &'static str) -> Self {
        Self::new(ErrnoKind::EBADF).with_syscall(syscall)
    }

    pub fn einval(syscall: &'static str) -> Self {
        Self::new(ErrnoKind::EINVAL).with_syscall(syscall)
    }

    pub fn erofs(syscall: &'static str) -> Self {
        Self::new(ErrnoKind::EROFS).with_syscall(syscall)
    }

    pub fn eloop(syscall: &'static str, path: impl Into<PathBuf>) -> Self {
        Self::new(ErrnoKind::ELOOP)
            .with_syscall(syscall)
            .with_path(path)
    }

    pub fn enotempty(syscall: &'static str, path: impl Into<PathBuf>) -> Self {
        Self::new(ErrnoKind::ENOTEMPTY)
            .with_syscall(syscall)
            .with_path(path)
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
