//! Path parsing, normalisation and validation.
//!
//! This module has no dependency on the rest of the crate — it is the
//! external collaborator the resolver consumes, kept separate the way
//! `rcore-fs-unionfs`'s internal `Path` helper is self-contained from the
//! rest of that crate.

use crate::consts::{PathValidateFlags, FORBIDDEN_CHARS, FORBIDDEN_CHARS_NON_NAVIGABLE};
use crate::error::FsError;
use std::cmp::Ordering;

/// A parsed path: an optional root component (`"/"`, `"c:/"`, `"//host/share/"`)
/// plus an ordered list of segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPath {
    pub root: Option<String>,
    pub segments: Vec<String>,
    pub trailing_sep: bool,
}

impl ParsedPath {
    pub fn is_absolute(&self) -> bool {
        self.root.is_some()
    }

    pub fn is_root(&self) -> bool {
        self.root.is_some() && self.segments.is_empty()
    }
}

/// Replace backslashes and whitespace-padded separators with `/`.
pub fn normalize_separators(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' || c == '/' {
            // trim whitespace around the separator
            while out.ends_with(' ') || out.ends_with('\t') {
                out.pop();
            }
            while matches!(chars.peek(), Some(' ') | Some('\t')) {
                chars.next();
            }
            out.push('/');
        } else {
            out.push(c);
        }
    }
    out
}

/// Detect whether `path` uses a POSIX `/...`, UNC `//host/share/...`, or
/// DOS `c:/...` root.
pub fn is_absolute(path: &str) -> bool {
    parse(path).is_absolute()
}

pub fn is_root(path: &str) -> bool {
    parse(path).is_root()
}

/// Split `path` into a root component and an ordered list of segments.
pub fn parse(path: &str) -> ParsedPath {
    let normalized = normalize_separators(path.trim());

    // DOS drive root: `c:/...`
    if normalized.len() >= 2 {
        let bytes = normalized.as_bytes();
        if bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
            let drive = &normalized[0..2];
            let rest = normalized[2..].trim_start_matches('/');
            let trailing = normalized.ends_with('/') && normalized.len() > 2;
            let segments = split_segments(rest);
            return ParsedPath {
                root: Some(format!("{}/", drive.to_string())),
                segments,
                trailing_sep: trailing,
            };
        }
    }

    // UNC root: `//host/share/...`
    if normalized.starts_with("//") {
        let rest = &normalized[2..];
        let mut parts = rest.splitn(3, '/');
        let host = parts.next().unwrap_or("");
        let share = parts.next().unwrap_or("");
        let remainder = parts.next().unwrap_or("");
        let trailing = normalized.ends_with('/') && !remainder.is_empty();
        let segments = split_segments(remainder);
        return ParsedPath {
            root: Some(format!("//{}/{}/", host, share)),
            segments,
            trailing_sep: trailing,
        };
    }

    // POSIX root: `/...`
    if normalized.starts_with('/') {
        let rest = &normalized[1..];
        let trailing = normalized.ends_with('/') && normalized.len() > 1;
        let segments = split_segments(rest);
        return ParsedPath {
            root: Some("/".to_string()),
            segments,
            trailing_sep: trailing,
        };
    }

    // relative path
    let trailing = normalized.ends_with('/') && !normalized.is_empty();
    ParsedPath {
        root: None,
        segments: split_segments(&normalized),
        trailing_sep: trailing,
    }
}

fn split_segments(s: &str) -> Vec<String> {
    s.split('/')
        .filter(|seg| !seg.is_empty())
        .map(|seg| seg.to_string())
        .collect()
}

/// Inverse of [`parse`].
pub fn format(parsed: &ParsedPath) -> String {
    let mut out = parsed.root.clone().unwrap_or_default();
    out.push_str(&parsed.segments.join("/"));
    if parsed.trailing_sep && !parsed.segments.is_empty() {
        out.push('/');
    }
    out
}

/// Collapse `.`/`..`, where `..` pops a prior non-`..` segment but never
/// escapes the root.
pub fn normalize(path: &str) -> String {
    let parsed = parse(path);
    let mut out_segments: Vec<String> = Vec::new();
    for seg in &parsed.segments {
        match seg.as_str() {
            "." => {}
            ".." => {
                if parsed.is_absolute() {
                    // never escape the root
                    if matches!(out_segments.last().map(|s| s.as_str()), Some(s) if s != "..") {
                        out_segments.pop();
                    }
                } else {
                    if matches!(out_segments.last().map(|s| s.as_str()), Some(s) if s != "..") {
                        out_segments.pop();
                    } else {
                        out_segments.push("..".to_string());
                    }
                }
            }
            _ => out_segments.push(seg.clone()),
        }
    }
    format(&ParsedPath {
        root: parsed.root,
        segments: out_segments,
        trailing_sep: parsed.trailing_sep,
    })
}

/// Join `base` and `more` the way `path.join` does, without normalising.
pub fn combine(base: &str, more: &str) -> String {
    if is_absolute(more) {
        return more.to_string();
    }
    if base.is_empty() {
        return more.to_string();
    }
    if base.ends_with('/') {
        format!("{}{}", base, more)
    } else {
        format!("{}/{}", base, more)
    }
}

/// Resolve `more` against `base`: if `more` is absolute, return it
/// normalised; otherwise join then normalise.
pub fn resolve(base: &str, more: &str) -> String {
    normalize(&combine(base, more))
}

pub fn dirname(path: &str) -> String {
    let parsed = parse(path);
    if parsed.segments.is_empty() {
        return parsed.root.unwrap_or_else(|| ".".to_string());
    }
    let mut segs = parsed.segments.clone();
    segs.pop();
    format(&ParsedPath {
        root: parsed.root,
        segments: segs,
        trailing_sep: false,
    })
}

pub fn basename(path: &str) -> String {
    parse(path).segments.last().cloned().unwrap_or_default()
}

pub fn extname(path: &str) -> String {
    let base = basename(path);
    match base.rfind('.') {
        Some(pos) if pos > 0 => base[pos..].to_string(),
        _ => String::new(),
    }
}

/// Whether `path`, as parsed, ends with a separator. Roots never count as
/// having a trailing separator.
pub fn has_trailing_separator(path: &str) -> bool {
    let parsed = parse(path);
    if parsed.is_root() {
        return false;
    }
    parsed.trailing_sep
}

fn has_forbidden_chars(segment: &str, navigable: bool) -> bool {
    if segment.chars().any(|c| FORBIDDEN_CHARS.contains(&c)) {
        return true;
    }
    if !navigable && segment.chars().any(|c| FORBIDDEN_CHARS_NON_NAVIGABLE.contains(&c)) {
        return true;
    }
    false
}

/// Validate `path` against a [`PathValidateFlags`] policy. Fails with
/// `ENOENT` when the policy is violated.
pub fn validate(path: &str, flags: PathValidateFlags) -> Result<ParsedPath, FsError> {
    let parsed = parse(path);
    let navigable = flags.contains(PathValidateFlags::ALLOW_NAVIGATION);

    if flags.contains(PathValidateFlags::REQUIRE_ROOT) && parsed.root.is_none() {
        return Err(FsError::enoent("validate", path));
    }
    if parsed.root.is_some() && !flags.contains(PathValidateFlags::ALLOW_ROOT) {
        return Err(FsError::enoent("validate", path));
    }
    if flags.contains(PathValidateFlags::REQUIRE_DIRNAME) && parsed.segments.len() < 2 {
        return Err(FsError::enoent("validate", path));
    }
    if flags.contains(PathValidateFlags::REQUIRE_BASENAME) && parsed.segments.is_empty() {
        return Err(FsError::enoent("validate", path));
    }
    if flags.contains(PathValidateFlags::REQUIRE_EXTNAME) && extname(path).is_empty() {
        return Err(FsError::enoent("validate", path));
    }
    if flags.contains(PathValidateFlags::REQUIRE_TRAILING_SEP) && !has_trailing_separator(path) {
        return Err(FsError::enoent("validate", path));
    }
    if has_trailing_separator(path) && !flags.contains(PathValidateFlags::ALLOW_TRAILING_SEP) {
        return Err(FsError::enoent("validate", path));
    }

    for seg in &parsed.segments {
        if (seg == "." || seg == "..") && !navigable {
            return Err(FsError::enoent("validate", path));
        }
        if has_forbidden_chars(seg, navigable) {
            return Err(FsError::enoent("validate", path));
        }
    }

    Ok(parsed)
}

/// Case-sensitive or case-insensitive name comparator, fixed at filesystem
/// construction: a filesystem cannot switch case sensitivity later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseMode {
    Sensitive,
    Insensitive,
}

impl CaseMode {
    pub fn compare(self, a: &str, b: &str) -> Ordering {
        match self {
            CaseMode::Sensitive => a.cmp(b),
            CaseMode::Insensitive => a.to_lowercase().cmp(&b.to_lowercase()),
        }
    }

    pub fn eq(self, a: &str, b: &str) -> bool {
        self.compare(a, b) == Ordering::Equal
    }

    pub fn key(self, name: &str) -> String {
        match self {
            CaseMode::Sensitive => name.to_string(),
            CaseMode::Insensitive => name.to_lowercase(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_posix_root() {
        let p = parse("/a/b/c");
        assert_eq!(p.root.as_deref(), Some("/"));
        assert_eq!(p.segments, vec!["a", "b", "c"]);
    }

    #[test]
    fn parse_relative() {
        let p = parse("a/b");
        assert_eq!(p.root, None);
        assert_eq!(p.segments, vec!["a", "b"]);
    }

    #[test]
    fn parse_unc_root() {
        let p = parse("//host/share/dir");
        assert_eq!(p.root.as_deref(), Some("//host/share/"));
        assert_eq!(p.segments, vec!["dir"]);
    }

    #[test]
    fn parse_dos_root() {
        let p = parse("c:/dir/file");
        assert_eq!(p.root.as_deref(), Some("c:/"));
        assert_eq!(p.segments, vec!["dir", "file"]);
    }

    #[test]
    fn normalize_collapses_dotdot_without_escaping_root() {
        assert_eq!(normalize("/a/../../b"), "/b");
        assert_eq!(normalize("/a/b/../c"), "/a/c");
    }

    #[test]
    fn normalize_relative_dotdot_can_remain() {
        assert_eq!(normalize("../a"), "../a");
        assert_eq!(normalize("a/../../b"), "../b");
    }

    #[test]
    fn normalize_idempotent() {
        let p = "/a/./b/../c/";
        assert_eq!(normalize(&normalize(p)), normalize(p));
    }

    #[test]
    fn format_roundtrips_parse() {
        let p = "/a/b/c";
        assert_eq!(format(&parse(p)), normalize_separators(p));
    }

    #[test]
    fn resolve_inverts_relative() {
        let a = "/a/b";
        let b = "/a/c/d";
        assert_eq!(resolve(a, "../c/d"), normalize(b));
    }

    #[test]
    fn dirname_basename_extname() {
        assert_eq!(dirname("/a/b/c.txt"), "/a/b");
        assert_eq!(basename("/a/b/c.txt"), "c.txt");
        assert_eq!(extname("/a/b/c.txt"), ".txt");
        assert_eq!(extname("/a/b/.hidden"), "");
    }

    #[test]
    fn validate_rejects_forbidden_chars() {
        let flags = PathValidateFlags::ABSOLUTE;
        assert!(validate("/a*b", flags).is_err());
        assert!(validate("/a/b", flags).is_ok());
    }

    #[test]
    fn case_insensitive_comparator() {
        assert!(CaseMode::Insensitive.eq("Foo", "foo"));
        assert!(!CaseMode::Sensitive.eq("Foo", "foo"));
    }

    #[test]
    fn trailing_separator_not_reported_for_root() {
        assert!(!has_trailing_separator("/"));
        assert!(has_trailing_separator("/a/"));
    }
}
