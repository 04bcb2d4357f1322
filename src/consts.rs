//! Stable numeric constants and flag types for the filesystem boundary.

use bitflags::bitflags;

// --- mode_t type bits -------------------------------------------------

pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

pub const S_ISUID: u32 = 0o4000;
pub const S_ISGID: u32 = 0o2000;
pub const S_ISVTX: u32 = 0o1000;

pub const S_IRWXU: u32 = 0o700;
pub const S_IRWXG: u32 = 0o070;
pub const S_IRWXO: u32 = 0o007;

// --- access() modes -----------------------------------------------------

pub const F_OK: u32 = 0;
pub const R_OK: u32 = 4;
pub const W_OK: u32 = 2;
pub const X_OK: u32 = 1;

bitflags! {
    /// `open()` flags. The low two bits are the access mode
    /// (`O_RDONLY`/`O_WRONLY`/`O_RDWR`), masked out with `O_ACCMODE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OFlags: u32 {
        const O_RDONLY    = 0o0;
        const O_WRONLY    = 0o1;
        const O_RDWR      = 0o2;
        const O_CREAT     = 0o100;
        const O_EXCL      = 0o200;
        const O_TRUNC     = 0o1000;
        const O_APPEND    = 0o2000;
        const O_SYNC      = 0o4010000;
        const O_DIRECTORY = 0o200000;
        const O_NOFOLLOW  = 0o400000;
    }
}

pub const O_ACCMODE: u32 = 0o3;

impl OFlags {
    /// Parse one of the symbolic open aliases (`"r"`, `"r+"`, `"w"`, `"wx"`,
    /// `"w+"`, `"wx+"`, `"a"`, `"ax"`, `"a+"`, `"ax+"`, `"rs+"`).
    pub fn from_alias(alias: &str) -> Option<OFlags> {
        let bits = match alias {
            "r" => Self::O_RDONLY.bits(),
            "r+" | "rs+" => Self::O_RDWR.bits(),
            "w" => Self::O_WRONLY.bits() | Self::O_CREAT.bits() | Self::O_TRUNC.bits(),
            "wx" => Self::O_WRONLY.bits() | Self::O_CREAT.bits() | Self::O_TRUNC.bits() | Self::O_EXCL.bits(),
            "w+" => Self::O_RDWR.bits() | Self::O_CREAT.bits() | Self::O_TRUNC.bits(),
            "wx+" => Self::O_RDWR.bits() | Self::O_CREAT.bits() | Self::O_TRUNC.bits() | Self::O_EXCL.bits(),
            "a" => Self::O_WRONLY.bits() | Self::O_CREAT.bits() | Self::O_APPEND.bits(),
            "ax" => Self::O_WRONLY.bits() | Self::O_CREAT.bits() | Self::O_APPEND.bits() | Self::O_EXCL.bits(),
            "a+" => Self::O_RDWR.bits() | Self::O_CREAT.bits() | Self::O_APPEND.bits(),
            "ax+" => Self::O_RDWR.bits() | Self::O_CREAT.bits() | Self::O_APPEND.bits() | Self::O_EXCL.bits(),
            _ => return None,
        };
        Self::from_bits(bits)
    }

    pub fn access_mode(self) -> u32 {
        self.bits() & O_ACCMODE
    }

    pub fn wants_read(self) -> bool {
        let mode = self.access_mode();
        mode == Self::O_RDONLY.bits() || mode == Self::O_RDWR.bits()
    }

    pub fn wants_write(self) -> bool {
        let mode = self.access_mode();
        mode == Self::O_WRONLY.bits() || mode == Self::O_RDWR.bits()
    }
}

bitflags! {
    /// inotify event and control masks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InotifyMask: u32 {
        const IN_ACCESS        = 0x0000_0001;
        const IN_MODIFY        = 0x0000_0002;
        const IN_ATTRIB        = 0x0000_0004;
        const IN_CLOSE_WRITE   = 0x0000_0008;
        const IN_CLOSE_NOWRITE = 0x0000_0010;
        const IN_OPEN          = 0x0000_0020;
        const IN_MOVED_FROM    = 0x0000_0040;
        const IN_MOVED_TO      = 0x0000_0080;
        const IN_CREATE        = 0x0000_0100;
        const IN_DELETE        = 0x0000_0200;
        const IN_DELETE_SELF   = 0x0000_0400;
        const IN_MOVE_SELF     = 0x0000_0800;

        const IN_ISDIR         = 0x4000_0000;
        const IN_ONESHOT       = 0x8000_0000;
        const IN_ONLYDIR       = 0x0100_0000;
        const IN_DONT_FOLLOW   = 0x0200_0000;
        const IN_EXCL_UNLINK   = 0x0400_0000;
        const IN_MASK_ADD      = 0x2000_0000;
        const IN_IGNORED       = 0x0000_8000;

        const IN_ALL_EVENTS    = Self::IN_ACCESS.bits()
            | Self::IN_MODIFY.bits()
            | Self::IN_ATTRIB.bits()
            | Self::IN_CLOSE_WRITE.bits()
            | Self::IN_CLOSE_NOWRITE.bits()
            | Self::IN_OPEN.bits()
            | Self::IN_MOVED_FROM.bits()
            | Self::IN_MOVED_TO.bits()
            | Self::IN_CREATE.bits()
            | Self::IN_DELETE.bits()
            | Self::IN_DELETE_SELF.bits()
            | Self::IN_MOVE_SELF.bits();
    }
}

bitflags! {
    /// Flags for [`crate::path::validate`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PathValidateFlags: u32 {
        const REQUIRE_ROOT      = 0x0001;
        const ALLOW_ROOT        = 0x0002;
        const REQUIRE_DIRNAME   = 0x0004;
        const ALLOW_DIRNAME     = 0x0008;
        const REQUIRE_BASENAME  = 0x0010;
        const ALLOW_BASENAME    = 0x0020;
        const REQUIRE_EXTNAME   = 0x0040;
        const ALLOW_EXTNAME     = 0x0080;
        const REQUIRE_TRAILING_SEP = 0x0100;
        const ALLOW_TRAILING_SEP   = 0x0200;
        const ALLOW_NAVIGATION  = 0x0400;

        const ROOT = Self::REQUIRE_ROOT.bits() | Self::ALLOW_ROOT.bits() | Self::ALLOW_TRAILING_SEP.bits();
        const ABSOLUTE = Self::REQUIRE_ROOT.bits()
            | Self::ALLOW_ROOT.bits()
            | Self::ALLOW_DIRNAME.bits()
            | Self::ALLOW_BASENAME.bits()
            | Self::ALLOW_EXTNAME.bits()
            | Self::ALLOW_TRAILING_SEP.bits()
            | Self::ALLOW_NAVIGATION.bits();
        const RELATIVE_OR_ABSOLUTE = Self::ALLOW_ROOT.bits()
            | Self::ALLOW_DIRNAME.bits()
            | Self::ALLOW_BASENAME.bits()
            | Self::ALLOW_EXTNAME.bits()
            | Self::ALLOW_TRAILING_SEP.bits()
            | Self::ALLOW_NAVIGATION.bits();
        const BASENAME = Self::REQUIRE_BASENAME.bits() | Self::ALLOW_EXTNAME.bits();
    }
}

/// Characters forbidden in any navigable path component.
pub const FORBIDDEN_CHARS: &[char] = &[':', '*', '?', '"', '<', '>', '|'];
/// Additional characters forbidden in non-navigable path components.
pub const FORBIDDEN_CHARS_NON_NAVIGABLE: &[char] = &['.'];
