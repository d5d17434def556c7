//! Guest-layout struct marshaling.
//!
//! Every structure that crosses the syscall boundary is laid out here
//! byte by byte through the endian helpers, against the Linux x86-64
//! ABI, so host struct layout never leaks into the guest.

use crate::endian::{read_u16, read_u32, read_u64, write_u16, write_u32, write_u64};

pub const TIMESPEC_SIZE: usize = 16;
pub const STAT_SIZE: usize = 144;
pub const RLIMIT_SIZE: usize = 16;
pub const RUSAGE_SIZE: usize = 144;
pub const POLLFD_SIZE: usize = 8;
pub const WINSIZE_SIZE: usize = 8;
pub const TERMIOS_SIZE: usize = 36;
pub const STATFS_SIZE: usize = 120;
pub const SIGACTION_SIZE: usize = 32;
pub const UTSNAME_FIELD: usize = 65;
pub const IOVEC_SIZE: usize = 16;

pub fn write_timespec(buf: &mut [u8], sec: i64, nsec: i64) {
    write_u64(&mut buf[0..], sec as u64);
    write_u64(&mut buf[8..], nsec as u64);
}

pub fn read_timespec(buf: &[u8]) -> (i64, i64) {
    (read_u64(&buf[0..]) as i64, read_u64(&buf[8..]) as i64)
}

pub fn write_timeval(buf: &mut [u8], sec: i64, usec: i64) {
    write_u64(&mut buf[0..], sec as u64);
    write_u64(&mut buf[8..], usec as u64);
}

pub fn read_timeval(buf: &[u8]) -> (i64, i64) {
    (read_u64(&buf[0..]) as i64, read_u64(&buf[8..]) as i64)
}

/// Host `stat` -> guest `struct stat`.
pub fn write_stat(buf: &mut [u8; STAT_SIZE], st: &libc::stat) {
    write_u64(&mut buf[0..], st.st_dev);
    write_u64(&mut buf[8..], st.st_ino);
    write_u64(&mut buf[16..], st.st_nlink);
    write_u32(&mut buf[24..], st.st_mode);
    write_u32(&mut buf[28..], st.st_uid);
    write_u32(&mut buf[32..], st.st_gid);
    write_u64(&mut buf[40..], st.st_rdev);
    write_u64(&mut buf[48..], st.st_size as u64);
    write_u64(&mut buf[56..], st.st_blksize as u64);
    write_u64(&mut buf[64..], st.st_blocks as u64);
    write_u64(&mut buf[72..], st.st_atime as u64);
    write_u64(&mut buf[80..], st.st_atime_nsec as u64);
    write_u64(&mut buf[88..], st.st_mtime as u64);
    write_u64(&mut buf[96..], st.st_mtime_nsec as u64);
    write_u64(&mut buf[104..], st.st_ctime as u64);
    write_u64(&mut buf[112..], st.st_ctime_nsec as u64);
}

/// Host `statfs` -> guest `struct statfs`.
pub fn write_statfs(buf: &mut [u8; STATFS_SIZE], st: &libc::statfs) {
    write_u64(&mut buf[0..], st.f_type as u64);
    write_u64(&mut buf[8..], st.f_bsize as u64);
    write_u64(&mut buf[16..], st.f_blocks);
    write_u64(&mut buf[24..], st.f_bfree);
    write_u64(&mut buf[32..], st.f_bavail);
    write_u64(&mut buf[40..], st.f_files);
    write_u64(&mut buf[48..], st.f_ffree);
    // f_fsid: two ints.
    write_u64(&mut buf[64..], st.f_namelen as u64);
    write_u64(&mut buf[72..], st.f_frsize as u64);
    // f_flags: not exposed by this libc version's `statfs` binding (folded into
    // its private f_spare); buf is zero-initialized by callers, so this field
    // reads back as 0.
}

pub fn write_rlimit(buf: &mut [u8; RLIMIT_SIZE], cur: u64, max: u64) {
    write_u64(&mut buf[0..], cur);
    write_u64(&mut buf[8..], max);
}

pub fn read_rlimit(buf: &[u8]) -> (u64, u64) {
    (read_u64(&buf[0..]), read_u64(&buf[8..]))
}

/// Host `rusage` -> guest layout (two timevals then fourteen longs).
pub fn write_rusage(buf: &mut [u8; RUSAGE_SIZE], ru: &libc::rusage) {
    write_timeval(&mut buf[0..], ru.ru_utime.tv_sec, ru.ru_utime.tv_usec);
    write_timeval(&mut buf[16..], ru.ru_stime.tv_sec, ru.ru_stime.tv_usec);
    let longs = [
        ru.ru_maxrss,
        ru.ru_ixrss,
        ru.ru_idrss,
        ru.ru_isrss,
        ru.ru_minflt,
        ru.ru_majflt,
        ru.ru_nswap,
        ru.ru_inblock,
        ru.ru_oublock,
        ru.ru_msgsnd,
        ru.ru_msgrcv,
        ru.ru_nsignals,
        ru.ru_nvcsw,
        ru.ru_nivcsw,
    ];
    for (n, v) in longs.iter().enumerate() {
        write_u64(&mut buf[32 + n * 8..], *v as u64);
    }
}

pub fn read_pollfd(buf: &[u8]) -> (i32, i16) {
    (read_u32(&buf[0..]) as i32, read_u16(&buf[4..]) as i16)
}

pub fn write_pollfd(buf: &mut [u8], fd: i32, events: i16, revents: i16) {
    write_u32(&mut buf[0..], fd as u32);
    write_u16(&mut buf[4..], events as u16);
    write_u16(&mut buf[6..], revents as u16);
}

pub fn write_winsize(buf: &mut [u8; WINSIZE_SIZE], ws: &libc::winsize) {
    write_u16(&mut buf[0..], ws.ws_row);
    write_u16(&mut buf[2..], ws.ws_col);
    write_u16(&mut buf[4..], ws.ws_xpixel);
    write_u16(&mut buf[6..], ws.ws_ypixel);
}

pub fn read_winsize(buf: &[u8]) -> libc::winsize {
    libc::winsize {
        ws_row: read_u16(&buf[0..]),
        ws_col: read_u16(&buf[2..]),
        ws_xpixel: read_u16(&buf[4..]),
        ws_ypixel: read_u16(&buf[6..]),
    }
}

/// Host kernel termios -> the guest's 36-byte ioctl termios.
pub fn write_termios(buf: &mut [u8; TERMIOS_SIZE], t: &libc::termios) {
    write_u32(&mut buf[0..], t.c_iflag as u32);
    write_u32(&mut buf[4..], t.c_oflag as u32);
    write_u32(&mut buf[8..], t.c_cflag as u32);
    write_u32(&mut buf[12..], t.c_lflag as u32);
    buf[16] = t.c_line;
    for n in 0..19.min(libc::NCCS) {
        buf[17 + n] = t.c_cc[n];
    }
}

pub fn read_termios(buf: &[u8], t: &mut libc::termios) {
    t.c_iflag = read_u32(&buf[0..]) as libc::tcflag_t;
    t.c_oflag = read_u32(&buf[4..]) as libc::tcflag_t;
    t.c_cflag = read_u32(&buf[8..]) as libc::tcflag_t;
    t.c_lflag = read_u32(&buf[12..]) as libc::tcflag_t;
    t.c_line = buf[16];
    for n in 0..19.min(libc::NCCS) {
        t.c_cc[n] = buf[17 + n];
    }
}

/// Reads one guest iovec.
pub fn read_iovec(buf: &[u8]) -> (u64, u64) {
    (read_u64(&buf[0..]), read_u64(&buf[8..]))
}

/// Guest `struct sigaction`: handler, flags, restorer, mask.
pub struct GuestSigaction {
    pub handler: u64,
    pub flags: u64,
    pub restorer: u64,
    pub mask: u64,
}

pub fn read_sigaction(buf: &[u8]) -> GuestSigaction {
    GuestSigaction {
        handler: read_u64(&buf[0..]),
        flags: read_u64(&buf[8..]),
        restorer: read_u64(&buf[16..]),
        mask: read_u64(&buf[24..]),
    }
}

pub fn write_sigaction(buf: &mut [u8; SIGACTION_SIZE], sa: &GuestSigaction) {
    write_u64(&mut buf[0..], sa.handler);
    write_u64(&mut buf[8..], sa.flags);
    write_u64(&mut buf[16..], sa.restorer);
    write_u64(&mut buf[24..], sa.mask);
}

/// Fills one 65-byte utsname field from a string.
pub fn write_utsname_field(buf: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(UTSNAME_FIELD - 1);
    buf[..n].copy_from_slice(&bytes[..n]);
    for b in &mut buf[n..UTSNAME_FIELD] {
        *b = 0;
    }
}

/// Appends one guest dirent64 record; returns its length or None when it
/// does not fit in `cap` remaining bytes.
pub fn dirent64_record(ino: u64, off: i64, dtype: u8, name: &[u8], cap: usize) -> Option<Vec<u8>> {
    let reclen = (8 + 8 + 2 + 1 + name.len() + 1 + 7) & !7;
    if reclen > cap {
        return None;
    }
    let mut rec = vec![0u8; reclen];
    write_u64(&mut rec[0..], ino);
    write_u64(&mut rec[8..], off as u64);
    write_u16(&mut rec[16..], reclen as u16);
    rec[18] = dtype;
    rec[19..19 + name.len()].copy_from_slice(name);
    Some(rec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespec_roundtrip() {
        let mut b = [0u8; TIMESPEC_SIZE];
        write_timespec(&mut b, 12345, -1);
        assert_eq!(read_timespec(&b), (12345, -1));
    }

    #[test]
    fn dirent_records_are_aligned() {
        let r = dirent64_record(1, 2, 8, b"hello", 1024).unwrap();
        assert_eq!(r.len() % 8, 0);
        assert!(r.len() >= 19 + 6);
        assert_eq!(&r[19..24], b"hello");
        assert_eq!(r[24], 0);
    }

    #[test]
    fn dirent_record_refuses_overflow() {
        assert!(dirent64_record(1, 2, 8, b"name", 10).is_none());
    }

    #[test]
    fn sigaction_roundtrip() {
        let mut b = [0u8; SIGACTION_SIZE];
        let sa = GuestSigaction {
            handler: 0x40_0000,
            flags: 0x0400_0004,
            restorer: 0x40_1000,
            mask: 0xffff,
        };
        write_sigaction(&mut b, &sa);
        let back = read_sigaction(&b);
        assert_eq!(back.handler, sa.handler);
        assert_eq!(back.mask, sa.mask);
    }
}
