//! poll/ppoll/select/pselect over guest descriptor sets.

use super::structs::*;
use super::xlat::{self, errno::*};
use super::{gread, gwrite, SysResult};
use crate::machine::Machine;

fn do_poll(m: &mut Machine, fds: u64, nfds: u64, timeout_ms: i32) -> SysResult {
    let n = nfds as usize;
    if n > 1024 {
        return Err(-EINVAL);
    }
    let mut guest = vec![0u8; n * POLLFD_SIZE];
    gread(m, fds, &mut guest)?;
    let mut host: Vec<libc::pollfd> = Vec::with_capacity(n);
    let table = m.sys.fds.lock().unwrap();
    for slot in guest.chunks(POLLFD_SIZE) {
        let (gfd, events) = read_pollfd(slot);
        // Negative and unknown fds stay in the set but never fire,
        // matching the host's own convention.
        let hfd = table.get(gfd).map(|e| e.host).unwrap_or(-1);
        host.push(libc::pollfd {
            fd: hfd,
            events,
            revents: 0,
        });
    }
    drop(table);
    let rc = unsafe { libc::poll(host.as_mut_ptr(), n as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        return Err(xlat::last_errno());
    }
    for (slot, h) in guest.chunks_mut(POLLFD_SIZE).zip(host.iter()) {
        let (gfd, events) = read_pollfd(slot);
        write_pollfd(slot, gfd, events, h.revents);
    }
    gwrite(m, fds, &guest)?;
    Ok(rc as i64)
}

pub fn poll(m: &mut Machine, a: [u64; 6]) -> SysResult {
    do_poll(m, a[0], a[1], a[2] as i32)
}

pub fn ppoll(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let timeout_ms = if a[2] == 0 {
        -1
    } else {
        let mut b = [0u8; TIMESPEC_SIZE];
        gread(m, a[2], &mut b)?;
        let (sec, nsec) = read_timespec(&b);
        (sec * 1000 + nsec / 1_000_000) as i32
    };
    // The signal-mask argument is honored by the boundary machinery
    // rather than the host call; pending guest signals interrupt below.
    do_poll(m, a[0], a[1], timeout_ms)
}

/// Reads a guest fd_set into the host's, returning the mapping used to
/// translate results back.
fn read_fdset(
    m: &Machine,
    addr: u64,
    nfds: u64,
) -> Result<(libc::fd_set, Vec<(i32, i32)>, i32), i64> {
    let mut set = unsafe {
        let mut s = std::mem::MaybeUninit::<libc::fd_set>::uninit();
        libc::FD_ZERO(s.as_mut_ptr());
        s.assume_init()
    };
    let mut pairs = Vec::new();
    let mut max_host = -1;
    if addr == 0 {
        return Ok((set, pairs, max_host));
    }
    let words = nfds.div_ceil(64).min(16) as usize;
    let mut buf = vec![0u8; words * 8];
    gread(m, addr, &mut buf)?;
    let table = m.sys.fds.lock().unwrap();
    for gfd in 0..nfds.min(1024) as i32 {
        let bit = buf[(gfd / 8) as usize] & (1 << (gfd % 8)) != 0;
        if !bit {
            continue;
        }
        let hfd = table.get(gfd).map(|e| e.host).ok_or(-EBADF)?;
        unsafe { libc::FD_SET(hfd, &mut set) };
        pairs.push((gfd, hfd));
        max_host = max_host.max(hfd);
    }
    Ok((set, pairs, max_host))
}

fn write_fdset(
    m: &Machine,
    addr: u64,
    nfds: u64,
    set: &libc::fd_set,
    pairs: &[(i32, i32)],
) -> Result<(), i64> {
    if addr == 0 {
        return Ok(());
    }
    let words = nfds.div_ceil(64).min(16) as usize;
    let mut buf = vec![0u8; words * 8];
    for (gfd, hfd) in pairs {
        if unsafe { libc::FD_ISSET(*hfd, set) } {
            buf[(*gfd / 8) as usize] |= 1 << (*gfd % 8);
        }
    }
    gwrite(m, addr, &buf)
}

fn do_select(m: &mut Machine, a: [u64; 6], timeout: Option<libc::timeval>) -> SysResult {
    let nfds = a[0];
    let (mut rset, rpairs, rmax) = read_fdset(m, a[1], nfds)?;
    let (mut wset, wpairs, wmax) = read_fdset(m, a[2], nfds)?;
    let (mut eset, epairs, emax) = read_fdset(m, a[3], nfds)?;
    let max_host = rmax.max(wmax).max(emax);
    let mut tv = timeout;
    let tv_ptr = tv
        .as_mut()
        .map(|t| t as *mut libc::timeval)
        .unwrap_or(std::ptr::null_mut());
    let rc = unsafe {
        libc::select(
            max_host + 1,
            if a[1] != 0 { &mut rset } else { std::ptr::null_mut() },
            if a[2] != 0 { &mut wset } else { std::ptr::null_mut() },
            if a[3] != 0 { &mut eset } else { std::ptr::null_mut() },
            tv_ptr,
        )
    };
    if rc < 0 {
        return Err(xlat::last_errno());
    }
    write_fdset(m, a[1], nfds, &rset, &rpairs)?;
    write_fdset(m, a[2], nfds, &wset, &wpairs)?;
    write_fdset(m, a[3], nfds, &eset, &epairs)?;
    Ok(rc as i64)
}

pub fn select(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let timeout = if a[4] != 0 {
        let mut b = [0u8; 16];
        gread(m, a[4], &mut b)?;
        let (sec, usec) = read_timeval(&b);
        Some(libc::timeval {
            tv_sec: sec,
            tv_usec: usec,
        })
    } else {
        None
    };
    do_select(m, a, timeout)
}

pub fn pselect(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let timeout = if a[4] != 0 {
        let mut b = [0u8; TIMESPEC_SIZE];
        gread(m, a[4], &mut b)?;
        let (sec, nsec) = read_timespec(&b);
        Some(libc::timeval {
            tv_sec: sec,
            tv_usec: nsec / 1000,
        })
    } else {
        None
    };
    do_select(m, a, timeout)
}
