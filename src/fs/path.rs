//! Path resolution.
//!
//! Paths are `/`-separated byte strings, resolved component by component
//! from the root inode (absolute) or the caller's working directory. Each
//! directory is locked only while its entry table is scanned, so lookups
//! of long paths never hold more than one inode lock at a time.

use super::inode::{InodeTree, InodeType, RcInode};
use super::log::Op;
use crate::param::NAME_MAX;

/// One path component. Longer components are truncated to `NAME_MAX`
/// bytes without a separator.
#[derive(Clone, Copy)]
pub struct FileName {
    bytes: [u8; NAME_MAX],
    len: usize,
}

impl FileName {
    pub fn new(src: &[u8]) -> Self {
        let len = src.len().min(NAME_MAX);
        let mut bytes = [0; NAME_MAX];
        bytes[..len].copy_from_slice(&src[..len]);
        Self { bytes, len }
    }

    pub const fn empty() -> Self {
        Self {
            bytes: [0; NAME_MAX],
            len: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl PartialEq for FileName {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for FileName {}

/// Splits the next path element off `path`.
///
/// ```text
/// skip_elem(b"a/bb/c")  == Some(("a", b"bb/c"))
/// skip_elem(b"///a//bb") == Some(("a", b"bb"))
/// skip_elem(b"a")       == Some(("a", b""))
/// skip_elem(b"")        == skip_elem(b"////") == None
/// ```
pub fn skip_elem(path: &[u8]) -> Option<(FileName, &[u8])> {
    let start = path.iter().position(|&b| b != b'/')?;
    let path = &path[start..];
    let end = path
        .iter()
        .position(|&b| b == b'/')
        .unwrap_or(path.len());
    let name = FileName::new(&path[..end]);
    let rest = &path[end..];
    let next = rest.iter().position(|&b| b != b'/').unwrap_or(rest.len());
    Some((name, &rest[next..]))
}

impl InodeTree {
    /// Resolves `path` to an inode. Relative paths start at `cwd`.
    pub fn namei(
        &'static self,
        path: &[u8],
        cwd: Option<&RcInode>,
        op: &Op,
    ) -> Result<RcInode, ()> {
        self.namex(path, false, cwd, op).map(|(ip, _)| ip)
    }

    /// Resolves `path` to its parent directory, returning the final
    /// component. Fails for the root itself.
    pub fn nameiparent(
        &'static self,
        path: &[u8],
        cwd: Option<&RcInode>,
        op: &Op,
    ) -> Result<(RcInode, FileName), ()> {
        self.namex(path, true, cwd, op)
    }

    fn namex(
        &'static self,
        path: &[u8],
        want_parent: bool,
        cwd: Option<&RcInode>,
        op: &Op,
    ) -> Result<(RcInode, FileName), ()> {
        if path.is_empty() {
            return Err(());
        }

        let mut ip = if path[0] == b'/' {
            self.root()
        } else {
            match cwd {
                Some(ip) => ip.clone(),
                None => self.root(),
            }
        };

        let mut rest = path;
        loop {
            let (name, r) = match skip_elem(rest) {
                Some(x) => x,
                None => break,
            };
            rest = r;

            let mut guard = match ip.lock() {
                Ok(g) => g,
                Err(()) => {
                    ip.put(op);
                    return Err(());
                }
            };
            if guard.entry().typ() != InodeType::Directory {
                drop(guard);
                ip.put(op);
                return Err(());
            }
            if want_parent && skip_elem(rest).is_none() {
                drop(guard);
                return Ok((ip, name));
            }
            let ino = match guard.dir_lookup(&name) {
                Ok(Some((ino, _))) => ino,
                _ => {
                    drop(guard);
                    ip.put(op);
                    return Err(());
                }
            };
            drop(guard);
            let next = self.get(ino);
            ip.put(op);
            ip = next;
        }

        if want_parent {
            // "/" has no parent.
            ip.put(op);
            return Err(());
        }
        Ok((ip, FileName::empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> &[u8] {
        s.as_bytes()
    }

    #[test]
    fn skip_elem_splits_components() {
        let (n, rest) = skip_elem(name("a/bb/c")).unwrap();
        assert_eq!(n.as_bytes(), b"a");
        assert_eq!(rest, b"bb/c");

        let (n, rest) = skip_elem(name("///a//bb")).unwrap();
        assert_eq!(n.as_bytes(), b"a");
        assert_eq!(rest, b"bb");

        let (n, rest) = skip_elem(name("a")).unwrap();
        assert_eq!(n.as_bytes(), b"a");
        assert_eq!(rest, b"");

        assert!(skip_elem(name("")).is_none());
        assert!(skip_elem(name("////")).is_none());
    }

    #[test]
    fn long_components_truncate() {
        let long = "abcdefghijklmnopqrstuvwxyz";
        let (n, _) = skip_elem(name(long)).unwrap();
        assert_eq!(n.as_bytes(), &long.as_bytes()[..NAME_MAX]);
    }
}
