//! The guest file-descriptor table.
//!
//! Guest fds index a growable table whose entries carry the backing host
//! fd, an ops vtable, the open-flags snapshot and the close-on-exec bit.
//! The vtable lets an entry be served by something other than a plain
//! host file later (a pty, a virtual device) without the syscall layer
//! caring.

use nix::errno::Errno;
use nix::sys::termios::Termios;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::Arc;

/// Capability vtable for one guest fd.
pub trait FdOps: Send + Sync {
    fn read(&self, host: RawFd, buf: &mut [u8]) -> Result<usize, Errno> {
        nix::unistd::read(host, buf)
    }

    fn write(&self, host: RawFd, buf: &[u8]) -> Result<usize, Errno> {
        nix::unistd::write(host, buf)
    }

    fn tcgetattr(&self, host: RawFd) -> Result<Termios, Errno> {
        nix::sys::termios::tcgetattr(host)
    }

    fn tcsetattr(&self, host: RawFd, t: &Termios) -> Result<(), Errno> {
        nix::sys::termios::tcsetattr(host, nix::sys::termios::SetArg::TCSANOW, t)
    }

    fn winsize(&self, host: RawFd) -> Result<libc::winsize, Errno> {
        let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::ioctl(host, libc::TIOCGWINSZ, &mut ws) };
        if rc < 0 {
            Err(Errno::last())
        } else {
            Ok(ws)
        }
    }

    fn is_tty(&self, host: RawFd) -> bool {
        nix::unistd::isatty(host).unwrap_or(false)
    }
}

/// The default vtable: a guest fd backed one-to-one by a host fd.
pub struct HostFdOps;

impl FdOps for HostFdOps {}

/// One table slot.
#[derive(Clone)]
pub struct FdEntry {
    pub host: RawFd,
    pub ops: Arc<dyn FdOps>,
    /// Guest-numbered open flags at open time.
    pub oflags: i32,
    pub cloexec: bool,
    pub path: Option<PathBuf>,
}

impl FdEntry {
    pub fn host(host: RawFd, oflags: i32, path: Option<PathBuf>) -> Self {
        Self {
            host,
            ops: Arc::new(HostFdOps),
            oflags,
            cloexec: false,
            path,
        }
    }
}

/// Growable guest-fd table. Callers serialize through the System's lock.
#[derive(Default)]
pub struct FdTable {
    entries: Vec<Option<FdEntry>>,
}

impl FdTable {
    /// Builds the initial table around the host's stdio.
    pub fn with_stdio() -> Self {
        let mut t = Self::default();
        for fd in 0..3 {
            t.entries.push(Some(FdEntry::host(fd, 0, None)));
        }
        t
    }

    pub fn get(&self, fd: i32) -> Option<&FdEntry> {
        if fd < 0 {
            return None;
        }
        self.entries.get(fd as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, fd: i32) -> Option<&mut FdEntry> {
        if fd < 0 {
            return None;
        }
        self.entries.get_mut(fd as usize)?.as_mut()
    }

    /// Installs `entry` at the lowest free slot at or above `min`,
    /// returning the guest fd.
    pub fn alloc(&mut self, entry: FdEntry, min: i32) -> i32 {
        let start = min.max(0) as usize;
        for i in start..self.entries.len() {
            if self.entries[i].is_none() {
                self.entries[i] = Some(entry);
                return i as i32;
            }
        }
        let at = self.entries.len().max(start);
        self.entries.resize_with(at + 1, || None);
        self.entries[at] = Some(entry);
        at as i32
    }

    /// Installs `entry` at exactly `fd` (dup2 semantics), displacing any
    /// existing entry, which is returned for the caller to close.
    pub fn put(&mut self, fd: i32, entry: FdEntry) -> Option<FdEntry> {
        let at = fd as usize;
        if at >= self.entries.len() {
            self.entries.resize_with(at + 1, || None);
        }
        self.entries[at].replace(entry)
    }

    /// Removes `fd`, returning the entry for the caller to close.
    pub fn remove(&mut self, fd: i32) -> Option<FdEntry> {
        if fd < 0 || fd as usize >= self.entries.len() {
            return None;
        }
        self.entries[fd as usize].take()
    }

    /// Every live guest fd, ascending.
    pub fn iter(&self) -> impl Iterator<Item = (i32, &FdEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (i as i32, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_finds_lowest_free() {
        let mut t = FdTable::with_stdio();
        assert_eq!(t.alloc(FdEntry::host(10, 0, None), 0), 3);
        t.remove(1);
        assert_eq!(t.alloc(FdEntry::host(11, 0, None), 0), 1);
        // dup2-style minimum fd.
        assert_eq!(t.alloc(FdEntry::host(12, 0, None), 8), 8);
    }

    #[test]
    fn put_displaces() {
        let mut t = FdTable::with_stdio();
        let old = t.put(2, FdEntry::host(9, 0, None));
        assert_eq!(old.unwrap().host, 2);
        assert_eq!(t.get(2).unwrap().host, 9);
    }

    #[test]
    fn negative_fd_rejected() {
        let t = FdTable::with_stdio();
        assert!(t.get(-1).is_none());
    }
}
