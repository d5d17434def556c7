//! Socket syscalls. Addresses cross the boundary as raw sockaddr bytes
//! with the family word translated; the rest of the layout matches.

use super::xlat::{self, errno::*};
use super::{gread, gwrite, SysResult};
use crate::fd::FdEntry;
use crate::machine::Machine;
use std::os::unix::io::RawFd;

fn host_fd(m: &Machine, fd: u64) -> Result<RawFd, i64> {
    m.sys
        .fds
        .lock()
        .unwrap()
        .get(fd as i32)
        .map(|e| e.host)
        .ok_or(-EBADF)
}

/// Reads a guest sockaddr into a host sockaddr_storage.
fn read_sockaddr(
    m: &Machine,
    addr: u64,
    len: u64,
) -> Result<(libc::sockaddr_storage, libc::socklen_t), i64> {
    let len = (len as usize).min(std::mem::size_of::<libc::sockaddr_storage>());
    if len < 2 {
        return Err(-EINVAL);
    }
    let mut buf = vec![0u8; len];
    gread(m, addr, &mut buf)?;
    let family = crate::endian::read_u16(&buf) as u64;
    let host_family = xlat::af_to_host(family)? as u16;
    let mut ss: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    unsafe {
        std::ptr::copy_nonoverlapping(
            buf.as_ptr(),
            &mut ss as *mut _ as *mut u8,
            len,
        );
    }
    ss.ss_family = host_family as libc::sa_family_t;
    Ok((ss, len as libc::socklen_t))
}

/// Writes a host sockaddr back into guest memory with the Linux-style
/// value-result length word.
fn write_sockaddr(
    m: &Machine,
    addr: u64,
    len_ptr: u64,
    ss: &libc::sockaddr_storage,
    host_len: libc::socklen_t,
) -> Result<(), i64> {
    if addr == 0 || len_ptr == 0 {
        return Ok(());
    }
    let mut cap_buf = [0u8; 4];
    gread(m, len_ptr, &mut cap_buf)?;
    let cap = crate::endian::read_u32(&cap_buf) as usize;
    let take = cap.min(host_len as usize);
    let bytes = unsafe {
        std::slice::from_raw_parts(ss as *const _ as *const u8, take)
    };
    gwrite(m, addr, bytes)?;
    crate::endian::write_u32(&mut cap_buf, host_len as u32);
    gwrite(m, len_ptr, &cap_buf)?;
    Ok(())
}

fn install(m: &Machine, host: RawFd, cloexec: bool) -> i64 {
    let mut e = FdEntry::host(host, 0, None);
    e.cloexec = cloexec;
    m.sys.fds.lock().unwrap().alloc(e, 0) as i64
}

pub fn socket(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let domain = xlat::af_to_host(a[0])?;
    let ty = xlat::socktype_to_host(a[1])?;
    let rc = unsafe { libc::socket(domain, ty, a[2] as libc::c_int) };
    if rc < 0 {
        return Err(xlat::last_errno());
    }
    Ok(install(m, rc, a[1] & xlat::SOCK_CLOEXEC != 0))
}

pub fn socketpair(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let domain = xlat::af_to_host(a[0])?;
    let ty = xlat::socktype_to_host(a[1])?;
    let mut sv = [0 as libc::c_int; 2];
    if unsafe { libc::socketpair(domain, ty, a[2] as libc::c_int, sv.as_mut_ptr()) } < 0 {
        return Err(xlat::last_errno());
    }
    let cloexec = a[1] & xlat::SOCK_CLOEXEC != 0;
    let g0 = install(m, sv[0], cloexec);
    let g1 = install(m, sv[1], cloexec);
    let mut buf = [0u8; 8];
    crate::endian::write_u32(&mut buf[0..], g0 as u32);
    crate::endian::write_u32(&mut buf[4..], g1 as u32);
    gwrite(m, a[3], &buf)?;
    Ok(0)
}

pub fn bind(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let fd = host_fd(m, a[0])?;
    let (ss, len) = read_sockaddr(m, a[1], a[2])?;
    xlat::host_zero(unsafe {
        libc::bind(fd, &ss as *const _ as *const libc::sockaddr, len)
    })
}

pub fn connect(m: &mut Machine, a: [u64; 6]) -> SysResult {
    if !m.sys.allow_connect.load(std::sync::atomic::Ordering::Relaxed) {
        return Err(-ENETUNREACH);
    }
    let fd = host_fd(m, a[0])?;
    let (ss, len) = read_sockaddr(m, a[1], a[2])?;
    xlat::host_zero(unsafe {
        libc::connect(fd, &ss as *const _ as *const libc::sockaddr, len)
    })
}

pub fn listen(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let fd = host_fd(m, a[0])?;
    xlat::host_zero(unsafe { libc::listen(fd, a[1] as libc::c_int) })
}

pub fn accept(m: &mut Machine, a: [u64; 6], flags: u32) -> SysResult {
    let fd = host_fd(m, a[0])?;
    let mut ss: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let mut hostflags = 0;
    if flags as u64 & xlat::SOCK_CLOEXEC != 0 {
        hostflags |= libc::SOCK_CLOEXEC;
    }
    if flags as u64 & xlat::SOCK_NONBLOCK != 0 {
        hostflags |= libc::SOCK_NONBLOCK;
    }
    let rc = unsafe {
        libc::accept4(
            fd,
            &mut ss as *mut _ as *mut libc::sockaddr,
            &mut len,
            hostflags,
        )
    };
    if rc < 0 {
        return Err(xlat::last_errno());
    }
    write_sockaddr(m, a[1], a[2], &ss, len)?;
    Ok(install(m, rc, flags as u64 & xlat::SOCK_CLOEXEC != 0))
}

pub fn shutdown(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let fd = host_fd(m, a[0])?;
    xlat::host_zero(unsafe { libc::shutdown(fd, a[1] as libc::c_int) })
}

pub fn sockname(m: &mut Machine, a: [u64; 6], peer: bool) -> SysResult {
    let fd = host_fd(m, a[0])?;
    let mut ss: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        if peer {
            libc::getpeername(fd, &mut ss as *mut _ as *mut libc::sockaddr, &mut len)
        } else {
            libc::getsockname(fd, &mut ss as *mut _ as *mut libc::sockaddr, &mut len)
        }
    };
    if rc < 0 {
        return Err(xlat::last_errno());
    }
    write_sockaddr(m, a[1], a[2], &ss, len)?;
    Ok(0)
}

pub fn sendto(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let fd = host_fd(m, a[0])?;
    let len = (a[2] as usize).min(1 << 20);
    let mut buf = vec![0u8; len];
    gread(m, a[1], &mut buf)?;
    let rc = if a[4] != 0 {
        let (ss, sl) = read_sockaddr(m, a[4], a[5])?;
        unsafe {
            libc::sendto(
                fd,
                buf.as_ptr().cast(),
                len,
                a[3] as libc::c_int,
                &ss as *const _ as *const libc::sockaddr,
                sl,
            )
        }
    } else {
        unsafe { libc::send(fd, buf.as_ptr().cast(), len, a[3] as libc::c_int) }
    };
    xlat::host_ret(rc as i64)
}

pub fn recvfrom(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let fd = host_fd(m, a[0])?;
    let len = (a[2] as usize).min(1 << 20);
    let mut buf = vec![0u8; len];
    let mut ss: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut sl = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr().cast(),
            len,
            a[3] as libc::c_int,
            &mut ss as *mut _ as *mut libc::sockaddr,
            &mut sl,
        )
    };
    if rc < 0 {
        return Err(xlat::last_errno());
    }
    gwrite(m, a[1], &buf[..rc as usize])?;
    if a[4] != 0 {
        write_sockaddr(m, a[4], a[5], &ss, sl)?;
    }
    Ok(rc as i64)
}

pub fn setsockopt(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let fd = host_fd(m, a[0])?;
    let len = (a[4] as usize).min(256);
    let mut buf = vec![0u8; len];
    gread(m, a[3], &mut buf)?;
    xlat::host_zero(unsafe {
        libc::setsockopt(
            fd,
            a[1] as libc::c_int,
            a[2] as libc::c_int,
            buf.as_ptr().cast(),
            len as libc::socklen_t,
        )
    })
}
