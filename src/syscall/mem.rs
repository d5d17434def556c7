//! Memory-management syscalls over the guest address space.

use super::xlat::{self, errno::*};
use super::SysResult;
use crate::machine::Machine;
use crate::mmu::{MapKind, Prot};
use crate::tunables::{MMAP_BASE, PAGE_SIZE};

fn prot_of(guest: u64) -> Prot {
    let mut p = Prot::empty();
    if guest & xlat::PROT_READ != 0 {
        p |= Prot::READ;
    }
    if guest & xlat::PROT_WRITE != 0 {
        p |= Prot::WRITE;
    }
    if guest & xlat::PROT_EXEC != 0 {
        p |= Prot::EXEC;
    }
    p
}

pub fn mmap(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let (addr, len, prot, flags, fd, off) = (a[0], a[1], a[2], a[3], a[4] as i32, a[5]);
    if len == 0 {
        return Err(-EINVAL);
    }
    if flags & (xlat::MAP_PRIVATE | xlat::MAP_SHARED) == 0 {
        return Err(-EINVAL);
    }
    let fixed = flags & xlat::MAP_FIXED != 0;
    if fixed && addr & (PAGE_SIZE - 1) != 0 {
        return Err(-EINVAL);
    }
    let at = if fixed {
        addr
    } else {
        let hint = if addr != 0 { addr } else { MMAP_BASE };
        match m.sys.mem.find_unmapped(hint, len) {
            Some(v) => v,
            None => return Err(-ENOMEM),
        }
    };
    m.sys
        .mem
        .reserve(at, len, prot_of(prot), fixed, MapKind::Anon)
        .map_err(|_| -ENOMEM)?;

    if flags & xlat::MAP_ANONYMOUS == 0 {
        // File-backed: materialize by copying through the fd. Shared
        // file mappings would need host-page aliasing; refuse those.
        if flags & xlat::MAP_SHARED != 0 {
            m.sys.mem.free(at, len);
            return Err(-ENODEV);
        }
        let host = m
            .sys
            .fds
            .lock()
            .unwrap()
            .get(fd)
            .map(|e| e.host)
            .ok_or(-EBADF)?;
        let mut remaining = len as usize;
        let mut out = at;
        let mut fileoff = off as libc::off_t;
        let mut chunk = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let want = remaining.min(chunk.len());
            let rc = unsafe { libc::pread(host, chunk.as_mut_ptr().cast(), want, fileoff) };
            if rc < 0 {
                m.sys.mem.free(at, len);
                return Err(xlat::last_errno());
            }
            if rc == 0 {
                break; // rest stays zero
            }
            // The pages were just reserved with the requested prot;
            // write through the arena regardless of guest write bits.
            if prot & xlat::PROT_WRITE == 0 {
                m.sys.mem.protect(out, rc as u64, prot_of(prot | xlat::PROT_WRITE)).ok();
                m.sys.mem.copy_to_guest(out, &chunk[..rc as usize]);
                m.sys.mem.protect(out, rc as u64, prot_of(prot)).ok();
            } else {
                m.sys.mem.copy_to_guest(out, &chunk[..rc as usize]);
            }
            out += rc as u64;
            fileoff += rc as libc::off_t;
            remaining -= rc as usize;
        }
    }
    Ok(at as i64)
}

pub fn munmap(m: &mut Machine, a: [u64; 6]) -> SysResult {
    if a[0] & (PAGE_SIZE - 1) != 0 || a[1] == 0 {
        return Err(-EINVAL);
    }
    m.sys.mem.free(a[0], a[1]);
    // Any compiled code on those pages is gone with them.
    let mut page = crate::mmu::page_of(a[0]);
    let end = crate::mmu::page_up(a[0] + a[1]);
    while page < end {
        m.sys.jit.invalidate_page(page);
        page += PAGE_SIZE;
    }
    Ok(0)
}

pub fn mprotect(m: &mut Machine, a: [u64; 6]) -> SysResult {
    if a[0] & (PAGE_SIZE - 1) != 0 {
        return Err(-EINVAL);
    }
    match m.sys.mem.protect(a[0], a[1], prot_of(a[2])) {
        Ok(()) => Ok(0),
        Err(_) => Err(-ENOMEM),
    }
}
