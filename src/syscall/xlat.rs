//! Constant translation between the guest's Linux ABI and the host.
//!
//! Guest-side numbers are spelled out even where the host is also Linux,
//! so the layer keeps working when the two drift apart.

use nix::errno::Errno;

/// Linux errno numbers as the guest sees them.
pub mod errno {
    pub const EPERM: i64 = 1;
    pub const ENOENT: i64 = 2;
    pub const ESRCH: i64 = 3;
    pub const EINTR: i64 = 4;
    pub const EIO: i64 = 5;
    pub const ENXIO: i64 = 6;
    pub const E2BIG: i64 = 7;
    pub const ENOEXEC: i64 = 8;
    pub const EBADF: i64 = 9;
    pub const ECHILD: i64 = 10;
    pub const EAGAIN: i64 = 11;
    pub const ENOMEM: i64 = 12;
    pub const EACCES: i64 = 13;
    pub const EFAULT: i64 = 14;
    pub const EBUSY: i64 = 16;
    pub const EEXIST: i64 = 17;
    pub const EXDEV: i64 = 18;
    pub const ENODEV: i64 = 19;
    pub const ENOTDIR: i64 = 20;
    pub const EISDIR: i64 = 21;
    pub const EINVAL: i64 = 22;
    pub const ENFILE: i64 = 23;
    pub const EMFILE: i64 = 24;
    pub const ENOTTY: i64 = 25;
    pub const EFBIG: i64 = 27;
    pub const ENOSPC: i64 = 28;
    pub const ESPIPE: i64 = 29;
    pub const EROFS: i64 = 30;
    pub const EMLINK: i64 = 31;
    pub const EPIPE: i64 = 32;
    pub const ERANGE: i64 = 34;
    pub const EDEADLK: i64 = 35;
    pub const ENAMETOOLONG: i64 = 36;
    pub const ENOLCK: i64 = 37;
    pub const ENOSYS: i64 = 38;
    pub const ENOTEMPTY: i64 = 39;
    pub const ELOOP: i64 = 40;
    pub const ENOTSOCK: i64 = 88;
    pub const EMSGSIZE: i64 = 90;
    pub const EPROTONOSUPPORT: i64 = 93;
    pub const EOPNOTSUPP: i64 = 95;
    pub const EAFNOSUPPORT: i64 = 97;
    pub const EADDRINUSE: i64 = 98;
    pub const EADDRNOTAVAIL: i64 = 99;
    pub const ENETUNREACH: i64 = 101;
    pub const ECONNABORTED: i64 = 103;
    pub const ECONNRESET: i64 = 104;
    pub const ENOBUFS: i64 = 105;
    pub const EISCONN: i64 = 106;
    pub const ENOTCONN: i64 = 107;
    pub const ETIMEDOUT: i64 = 110;
    pub const ECONNREFUSED: i64 = 111;
    pub const EHOSTUNREACH: i64 = 113;
    pub const EALREADY: i64 = 114;
    pub const EINPROGRESS: i64 = 115;
}

/// Maps a host errno into the guest's numbering.
pub fn errno_to_guest(e: Errno) -> i64 {
    use errno::*;
    match e {
        Errno::EPERM => EPERM,
        Errno::ENOENT => ENOENT,
        Errno::ESRCH => ESRCH,
        Errno::EINTR => EINTR,
        Errno::EIO => EIO,
        Errno::ENXIO => ENXIO,
        Errno::E2BIG => E2BIG,
        Errno::ENOEXEC => ENOEXEC,
        Errno::EBADF => EBADF,
        Errno::ECHILD => ECHILD,
        Errno::EAGAIN => EAGAIN,
        Errno::ENOMEM => ENOMEM,
        Errno::EACCES => EACCES,
        Errno::EFAULT => EFAULT,
        Errno::EBUSY => EBUSY,
        Errno::EEXIST => EEXIST,
        Errno::EXDEV => EXDEV,
        Errno::ENODEV => ENODEV,
        Errno::ENOTDIR => ENOTDIR,
        Errno::EISDIR => EISDIR,
        Errno::EINVAL => EINVAL,
        Errno::ENFILE => ENFILE,
        Errno::EMFILE => EMFILE,
        Errno::ENOTTY => ENOTTY,
        Errno::EFBIG => EFBIG,
        Errno::ENOSPC => ENOSPC,
        Errno::ESPIPE => ESPIPE,
        Errno::EROFS => EROFS,
        Errno::EMLINK => EMLINK,
        Errno::EPIPE => EPIPE,
        Errno::ERANGE => ERANGE,
        Errno::EDEADLK => EDEADLK,
        Errno::ENAMETOOLONG => ENAMETOOLONG,
        Errno::ENOLCK => ENOLCK,
        Errno::ENOSYS => ENOSYS,
        Errno::ENOTEMPTY => ENOTEMPTY,
        Errno::ELOOP => ELOOP,
        Errno::ENOTSOCK => ENOTSOCK,
        Errno::EMSGSIZE => EMSGSIZE,
        Errno::EPROTONOSUPPORT => EPROTONOSUPPORT,
        Errno::EOPNOTSUPP => EOPNOTSUPP,
        Errno::EAFNOSUPPORT => EAFNOSUPPORT,
        Errno::EADDRINUSE => EADDRINUSE,
        Errno::EADDRNOTAVAIL => EADDRNOTAVAIL,
        Errno::ENETUNREACH => ENETUNREACH,
        Errno::ECONNABORTED => ECONNABORTED,
        Errno::ECONNRESET => ECONNRESET,
        Errno::ENOBUFS => ENOBUFS,
        Errno::EISCONN => EISCONN,
        Errno::ENOTCONN => ENOTCONN,
        Errno::ETIMEDOUT => ETIMEDOUT,
        Errno::ECONNREFUSED => ECONNREFUSED,
        Errno::EHOSTUNREACH => EHOSTUNREACH,
        Errno::EALREADY => EALREADY,
        Errno::EINPROGRESS => EINPROGRESS,
        other => other as i64,
    }
}

/// The errno currently in the host's thread-local, guest-numbered and
/// negated for direct return.
pub fn last_errno() -> i64 {
    -errno_to_guest(Errno::last())
}

/// Folds a libc `int` return into a syscall result: 0 stays 0, -1 turns
/// into the negated errno.
pub fn host_zero(rc: libc::c_int) -> super::SysResult {
    if rc < 0 {
        Err(last_errno())
    } else {
        Ok(0)
    }
}

/// Same, but the return value itself is meaningful.
pub fn host_ret(rc: i64) -> super::SysResult {
    if rc < 0 {
        Err(last_errno())
    } else {
        Ok(rc)
    }
}

/// nix-result adapters.
pub fn nix_ret<T: Into<i64>>(r: Result<T, Errno>) -> super::SysResult {
    match r {
        Ok(v) => Ok(v.into()),
        Err(e) => Err(-errno_to_guest(e)),
    }
}

pub fn nix_usize(r: Result<usize, Errno>) -> super::SysResult {
    match r {
        Ok(v) => Ok(v as i64),
        Err(e) => Err(-errno_to_guest(e)),
    }
}

pub fn nix_zero<T>(r: Result<T, Errno>) -> super::SysResult {
    match r {
        Ok(_) => Ok(0),
        Err(e) => Err(-errno_to_guest(e)),
    }
}

// Guest open(2) flag bits.
pub const O_WRONLY: i32 = 0o1;
pub const O_RDWR: i32 = 0o2;
pub const O_CREAT: i32 = 0o100;
pub const O_EXCL: i32 = 0o200;
pub const O_NOCTTY: i32 = 0o400;
pub const O_TRUNC: i32 = 0o1000;
pub const O_APPEND: i32 = 0o2000;
pub const O_NONBLOCK: i32 = 0o4000;
pub const O_DSYNC: i32 = 0o10000;
pub const O_DIRECTORY: i32 = 0o200000;
pub const O_NOFOLLOW: i32 = 0o400000;
pub const O_CLOEXEC: i32 = 0o2000000;
pub const O_SYNC: i32 = 0o4010000;
pub const O_PATH: i32 = 0o10000000;

/// Guest open flags -> host open flags.
pub fn oflags_to_host(guest: i32) -> libc::c_int {
    let mut host = match guest & 3 {
        O_WRONLY => libc::O_WRONLY,
        O_RDWR => libc::O_RDWR,
        _ => libc::O_RDONLY,
    };
    let map = [
        (O_CREAT, libc::O_CREAT),
        (O_EXCL, libc::O_EXCL),
        (O_NOCTTY, libc::O_NOCTTY),
        (O_TRUNC, libc::O_TRUNC),
        (O_APPEND, libc::O_APPEND),
        (O_NONBLOCK, libc::O_NONBLOCK),
        (O_DSYNC, libc::O_DSYNC),
        (O_DIRECTORY, libc::O_DIRECTORY),
        (O_NOFOLLOW, libc::O_NOFOLLOW),
        (O_CLOEXEC, libc::O_CLOEXEC),
        (O_SYNC, libc::O_SYNC),
        (O_PATH, libc::O_PATH),
    ];
    for (g, h) in map {
        if guest & g == g {
            host |= h;
        }
    }
    host
}

pub const AT_FDCWD: i32 = -100;
pub const AT_SYMLINK_NOFOLLOW: u32 = 0x100;
pub const AT_REMOVEDIR: u32 = 0x200;
pub const AT_EMPTY_PATH: u32 = 0x1000;

/// Guest dirfd -> host dirfd, mapping through the fd table.
pub fn at_fd(m: &crate::machine::Machine, fd: i32) -> Result<libc::c_int, i64> {
    if fd == AT_FDCWD {
        return Ok(libc::AT_FDCWD);
    }
    m.sys
        .fds
        .lock()
        .unwrap()
        .get(fd)
        .map(|e| e.host)
        .ok_or(-errno::EBADF)
}

// Guest mmap constants.
pub const PROT_READ: u64 = 1;
pub const PROT_WRITE: u64 = 2;
pub const PROT_EXEC: u64 = 4;
pub const MAP_SHARED: u64 = 1;
pub const MAP_PRIVATE: u64 = 2;
pub const MAP_FIXED: u64 = 0x10;
pub const MAP_ANONYMOUS: u64 = 0x20;

// Guest clock ids.
pub const CLOCK_REALTIME: u64 = 0;
pub const CLOCK_MONOTONIC: u64 = 1;
pub const CLOCK_PROCESS_CPUTIME: u64 = 2;
pub const CLOCK_THREAD_CPUTIME: u64 = 3;
pub const CLOCK_MONOTONIC_RAW: u64 = 4;
pub const CLOCK_BOOTTIME: u64 = 7;

pub fn clock_to_host(id: u64) -> Result<libc::clockid_t, i64> {
    Ok(match id {
        CLOCK_REALTIME => libc::CLOCK_REALTIME,
        CLOCK_MONOTONIC => libc::CLOCK_MONOTONIC,
        CLOCK_PROCESS_CPUTIME => libc::CLOCK_PROCESS_CPUTIME_ID,
        CLOCK_THREAD_CPUTIME => libc::CLOCK_THREAD_CPUTIME_ID,
        CLOCK_MONOTONIC_RAW => libc::CLOCK_MONOTONIC_RAW,
        CLOCK_BOOTTIME => libc::CLOCK_BOOTTIME,
        _ => return Err(-errno::EINVAL),
    })
}

// Guest futex operations.
pub const FUTEX_WAIT: u64 = 0;
pub const FUTEX_WAKE: u64 = 1;
pub const FUTEX_PRIVATE_FLAG: u64 = 128;

// Guest fcntl commands.
pub const F_DUPFD: u64 = 0;
pub const F_GETFD: u64 = 1;
pub const F_SETFD: u64 = 2;
pub const F_GETFL: u64 = 3;
pub const F_SETFL: u64 = 4;
pub const F_DUPFD_CLOEXEC: u64 = 1030;

// Guest ioctl numbers the layer understands.
pub const TCGETS: u64 = 0x5401;
pub const TCSETS: u64 = 0x5402;
pub const TCSETSW: u64 = 0x5403;
pub const TCSETSF: u64 = 0x5404;
pub const TIOCGWINSZ: u64 = 0x5413;
pub const TIOCSWINSZ: u64 = 0x5414;
pub const FIONBIO: u64 = 0x5421;
pub const FIONREAD: u64 = 0x541b;

// Guest socket domains/types, translated explicitly.
pub fn af_to_host(domain: u64) -> Result<libc::c_int, i64> {
    Ok(match domain {
        1 => libc::AF_UNIX,
        2 => libc::AF_INET,
        10 => libc::AF_INET6,
        _ => return Err(-errno::EAFNOSUPPORT),
    })
}

pub const SOCK_CLOEXEC: u64 = 0o2000000;
pub const SOCK_NONBLOCK: u64 = 0o4000;

pub fn socktype_to_host(ty: u64) -> Result<libc::c_int, i64> {
    let base = match ty & 0xf {
        1 => libc::SOCK_STREAM,
        2 => libc::SOCK_DGRAM,
        3 => libc::SOCK_RAW,
        5 => libc::SOCK_SEQPACKET,
        _ => return Err(-errno::EINVAL),
    };
    let mut out = base;
    if ty & SOCK_CLOEXEC != 0 {
        out |= libc::SOCK_CLOEXEC;
    }
    if ty & SOCK_NONBLOCK != 0 {
        out |= libc::SOCK_NONBLOCK;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_translation_covers_common_cases() {
        assert_eq!(errno_to_guest(Errno::ENOENT), 2);
        assert_eq!(errno_to_guest(Errno::EINTR), 4);
        assert_eq!(errno_to_guest(Errno::ECONNREFUSED), 111);
    }

    #[test]
    fn oflags_accmode() {
        assert_eq!(oflags_to_host(0) & libc::O_ACCMODE, libc::O_RDONLY);
        assert_eq!(oflags_to_host(O_WRONLY) & libc::O_ACCMODE, libc::O_WRONLY);
        assert_ne!(oflags_to_host(O_CREAT | O_TRUNC) & libc::O_CREAT, 0);
    }

    #[test]
    fn socktype_flags_compose() {
        let t = socktype_to_host(1 | SOCK_CLOEXEC).unwrap();
        assert_ne!(t & libc::SOCK_CLOEXEC, 0);
        assert_eq!(t & !(libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK), libc::SOCK_STREAM);
    }
}
