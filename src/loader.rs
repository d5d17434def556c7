//! Static and dynamic ELF64 loading, and the initial stack image.
//!
//! Everything is parsed through the endian helpers; no ELF crate and no
//! host-struct aliasing. Dynamic executables get their interpreter
//! mapped and receive control at its entry point, with AT_BASE wired up
//! so the real dynamic linker can do the rest.

use crate::endian::{read_u16, read_u32, read_u64, write_u64};
use crate::error::Error;
use crate::machine::{Machine, RSP};
use crate::mmu::{page_of, page_up, MapKind, Prot};
use crate::tunables::{PAGE_SIZE, STACK_SIZE};
use log::{debug, info};
use std::ffi::CString;
use std::path::Path;

const PT_LOAD: u32 = 1;
const PT_INTERP: u32 = 3;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const EM_X86_64: u16 = 62;

/// Where a PIE image lands when it asks for address zero.
const PIE_BASE: u64 = 0x5555_5555_0000;
/// Where the dynamic interpreter lands.
const INTERP_BASE: u64 = 0x7f00_0000_0000;

struct Image {
    entry: u64,
    phdr: u64,
    phent: u64,
    phnum: u64,
    end: u64,
}

fn prot_of_pflags(flags: u32) -> Prot {
    let mut p = Prot::empty();
    if flags & 4 != 0 {
        p |= Prot::READ;
    }
    if flags & 2 != 0 {
        p |= Prot::WRITE;
    }
    if flags & 1 != 0 {
        p |= Prot::EXEC;
    }
    p
}

/// Maps one ELF file into the guest at `base`, returning its facts and
/// the interpreter path if it wants one.
fn map_elf(m: &Machine, bytes: &[u8], base: u64) -> Result<(Image, Option<Vec<u8>>), Error> {
    if bytes.len() < 64 || &bytes[..4] != b"\x7fELF" {
        return Err(Error::Loader("not an ELF file".into()));
    }
    if bytes[4] != 2 || bytes[5] != 1 {
        return Err(Error::Loader("not a little-endian 64-bit ELF".into()));
    }
    let etype = read_u16(&bytes[16..]);
    if etype != ET_EXEC && etype != ET_DYN {
        return Err(Error::Loader("not an executable".into()));
    }
    if read_u16(&bytes[18..]) != EM_X86_64 {
        return Err(Error::Loader("not an x86-64 binary".into()));
    }
    let entry = read_u64(&bytes[24..]);
    let phoff = read_u64(&bytes[32..]);
    let phent = read_u16(&bytes[54..]) as u64;
    let phnum = read_u16(&bytes[56..]) as u64;

    let mut interp = None;
    let mut phdr_vaddr = 0;
    let mut end = 0u64;

    for n in 0..phnum {
        let off = (phoff + n * phent) as usize;
        if off + 56 > bytes.len() {
            return Err(Error::Loader("truncated program headers".into()));
        }
        let ph = &bytes[off..];
        let ptype = read_u32(&ph[0..]);
        let pflags = read_u32(&ph[4..]);
        let offset = read_u64(&ph[8..]);
        let vaddr = read_u64(&ph[16..]).wrapping_add(base);
        let filesz = read_u64(&ph[32..]);
        let memsz = read_u64(&ph[40..]);

        match ptype {
            PT_INTERP => {
                let s = &bytes[offset as usize..(offset + filesz) as usize];
                interp = Some(s.strip_suffix(&[0]).unwrap_or(s).to_vec());
            }
            PT_LOAD if memsz > 0 => {
                let seg_start = page_of(vaddr);
                let seg_end = page_up(vaddr + memsz);
                debug!(
                    "load segment {:#x}..{:#x} prot {:?}",
                    seg_start,
                    seg_end,
                    prot_of_pflags(pflags)
                );
                m.sys.mem.reserve(
                    seg_start,
                    seg_end - seg_start,
                    Prot::READ | Prot::WRITE,
                    true,
                    MapKind::Image,
                )?;
                let src = bytes
                    .get(offset as usize..(offset + filesz) as usize)
                    .ok_or_else(|| Error::Loader("segment beyond file".into()))?;
                if m.sys.mem.copy_to_guest(vaddr, src) != src.len() {
                    return Err(Error::Loader("segment copy failed".into()));
                }
                m.sys
                    .mem
                    .protect(seg_start, seg_end - seg_start, prot_of_pflags(pflags))?;
                end = end.max(seg_end);
                // The phdr table's runtime address comes from the
                // segment that covers it.
                if offset <= phoff && phoff < offset + filesz {
                    phdr_vaddr = vaddr + (phoff - offset);
                }
            }
            _ => {}
        }
    }

    Ok((
        Image {
            entry: entry.wrapping_add(base),
            phdr: phdr_vaddr,
            phent,
            phnum,
            end,
        },
        interp,
    ))
}

// Auxiliary vector tags.
const AT_PHDR: u64 = 3;
const AT_PHENT: u64 = 4;
const AT_PHNUM: u64 = 5;
const AT_PAGESZ: u64 = 6;
const AT_BASE: u64 = 7;
const AT_ENTRY: u64 = 9;
const AT_UID: u64 = 11;
const AT_EUID: u64 = 12;
const AT_GID: u64 = 13;
const AT_EGID: u64 = 14;
const AT_CLKTCK: u64 = 17;
const AT_RANDOM: u64 = 25;
const AT_EXECFN: u64 = 31;

/// Builds argc/argv/envp/auxv on the guest stack. Returns the final SP.
fn build_stack(
    m: &mut Machine,
    sp_top: u64,
    argv: &[CString],
    envp: &[CString],
    image: &Image,
    interp_base: u64,
    execfn: &CString,
) -> Result<u64, Error> {
    let mut sp = sp_top;
    let mut push_bytes = |m: &mut Machine, data: &[u8]| -> Result<u64, Error> {
        sp -= data.len() as u64;
        if m.sys.mem.copy_to_guest(sp, data) != data.len() {
            return Err(Error::Loader("stack image overflow".into()));
        }
        Ok(sp)
    };

    // String area, top down.
    let execfn_addr = push_bytes(m, execfn.as_bytes_with_nul())?;
    let mut env_addrs = Vec::with_capacity(envp.len());
    for e in envp.iter().rev() {
        env_addrs.push(push_bytes(m, e.as_bytes_with_nul())?);
    }
    env_addrs.reverse();
    let mut arg_addrs = Vec::with_capacity(argv.len());
    for a in argv.iter().rev() {
        arg_addrs.push(push_bytes(m, a.as_bytes_with_nul())?);
    }
    arg_addrs.reverse();
    let mut random = [0u8; 16];
    unsafe { libc::getrandom(random.as_mut_ptr().cast(), 16, 0) };
    let random_addr = push_bytes(m, &random)?;

    let auxv: Vec<(u64, u64)> = vec![
        (AT_PHDR, image.phdr),
        (AT_PHENT, image.phent),
        (AT_PHNUM, image.phnum),
        (AT_PAGESZ, PAGE_SIZE),
        (AT_BASE, interp_base),
        (AT_ENTRY, image.entry),
        (AT_UID, unsafe { libc::getuid() } as u64),
        (AT_EUID, unsafe { libc::geteuid() } as u64),
        (AT_GID, unsafe { libc::getgid() } as u64),
        (AT_EGID, unsafe { libc::getegid() } as u64),
        (AT_CLKTCK, 100),
        (AT_RANDOM, random_addr),
        (AT_EXECFN, execfn_addr),
        (0, 0),
    ];

    // Vector area: argc + pointers, 16-byte aligned at the end.
    let words = 1 + arg_addrs.len() + 1 + env_addrs.len() + 1 + auxv.len() * 2;
    sp &= !15;
    if words % 2 == 1 {
        sp -= 8;
    }
    sp -= words as u64 * 8;
    let mut at = sp;
    let mut word = |m: &mut Machine, v: u64| -> Result<(), Error> {
        let mut b = [0u8; 8];
        write_u64(&mut b, v);
        if m.sys.mem.copy_to_guest(at, &b) != 8 {
            return Err(Error::Loader("stack image overflow".into()));
        }
        at += 8;
        Ok(())
    };
    word(m, argv.len() as u64)?;
    for a in &arg_addrs {
        word(m, *a)?;
    }
    word(m, 0)?;
    for e in &env_addrs {
        word(m, *e)?;
    }
    word(m, 0)?;
    for (tag, value) in &auxv {
        word(m, *tag)?;
        word(m, *value)?;
    }
    Ok(sp)
}

/// Loads `path` and leaves the Machine runnable at its entry point.
pub fn load_program(
    m: &mut Machine,
    path: &Path,
    argv: &[CString],
    envp: &[CString],
) -> Result<(), Error> {
    let bytes = std::fs::read(path)?;
    let etype = if bytes.len() >= 18 {
        read_u16(&bytes[16..])
    } else {
        0
    };
    let base = if etype == ET_DYN { PIE_BASE } else { 0 };
    let (image, interp) = map_elf(m, &bytes, base)?;

    let (entry, interp_base) = match interp {
        Some(ipath) => {
            let ipath = std::str::from_utf8(&ipath)
                .map_err(|_| Error::Loader("bad interpreter path".into()))?;
            info!("loading interpreter {}", ipath);
            let ibytes = std::fs::read(ipath)?;
            let (iimage, _) = map_elf(m, &ibytes, INTERP_BASE)?;
            (iimage.entry, INTERP_BASE)
        }
        None => (image.entry, 0),
    };

    {
        let mut info = m.sys.image.lock().unwrap();
        info.path = path.display().to_string();
        info.entry = image.entry;
        info.phdr = image.phdr;
        info.phent = image.phent;
        info.phnum = image.phnum;
        info.brk_start = page_up(image.end);
    }
    *m.sys.brk.lock().unwrap() = page_up(image.end);

    let sp_top = m.sys.map_initial_stack(STACK_SIZE.min(2 * 1024 * 1024))?;
    let execfn = CString::new(path.display().to_string().into_bytes())
        .map_err(|_| Error::Loader("bad path".into()))?;
    let sp = build_stack(m, sp_top, argv, envp, &image, interp_base, &execfn)?;

    m.set_gpr(RSP, sp);
    m.ip = entry;
    m.flags = crate::flags::Rflags::FIXED.bits();
    info!("entry {:#x} sp {:#x}", entry, sp);
    Ok(())
}

/// execve: tears down the current image and loads a fresh one into the
/// same System.
pub fn replace_image(
    m: &mut Machine,
    path: &Path,
    argv: &[CString],
    envp: &[CString],
) -> Result<(), Error> {
    m.sys.mem.clear();
    {
        let mut handlers = m.sys.handlers.lock().unwrap();
        for h in handlers.iter_mut() {
            // Caught signals reset; ignored ones survive exec.
            if h.handler > 1 {
                *h = Default::default();
            }
        }
    }
    {
        // Close-on-exec fds go away.
        let mut fds = m.sys.fds.lock().unwrap();
        let doomed: Vec<i32> = fds
            .iter()
            .filter(|(_, e)| e.cloexec)
            .map(|(fd, _)| fd)
            .collect();
        for fd in doomed {
            if let Some(e) = fds.remove(fd) {
                if e.host > 2 {
                    unsafe { libc::close(e.host) };
                }
            }
        }
    }
    {
        let mut stack = m.sys.stack.lock().unwrap();
        stack.low = stack.top;
    }
    m.regs = [0; 16];
    m.fpu = Default::default();
    m.xmm = [[0; 16]; 16];
    m.sigmask = 0;
    m.sig = 0;
    m.recording = None;
    load_program(m, path, argv, envp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::System;

    /// Assembles a minimal static ELF with one PT_LOAD holding `code`
    /// at 0x400078 (right after the headers).
    pub(crate) fn tiny_elf(code: &[u8]) -> Vec<u8> {
        let mut f = Vec::new();
        let entry: u64 = 0x40_0078;
        f.extend_from_slice(b"\x7fELF\x02\x01\x01\x00");
        f.extend_from_slice(&[0; 8]);
        f.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        f.extend_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        f.extend_from_slice(&1u32.to_le_bytes());
        f.extend_from_slice(&entry.to_le_bytes());
        f.extend_from_slice(&64u64.to_le_bytes()); // phoff
        f.extend_from_slice(&0u64.to_le_bytes()); // shoff
        f.extend_from_slice(&0u32.to_le_bytes());
        f.extend_from_slice(&64u16.to_le_bytes()); // ehsize
        f.extend_from_slice(&56u16.to_le_bytes()); // phentsize
        f.extend_from_slice(&1u16.to_le_bytes()); // phnum
        f.extend_from_slice(&[0u8; 6]);
        assert_eq!(f.len(), 64);
        // One PT_LOAD: file offset 0, vaddr 0x400000, covers headers+code.
        let filesz = 0x78 + code.len() as u64;
        f.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        f.extend_from_slice(&5u32.to_le_bytes()); // R+X
        f.extend_from_slice(&0u64.to_le_bytes()); // offset
        f.extend_from_slice(&0x40_0000u64.to_le_bytes()); // vaddr
        f.extend_from_slice(&0x40_0000u64.to_le_bytes()); // paddr
        f.extend_from_slice(&filesz.to_le_bytes());
        f.extend_from_slice(&filesz.to_le_bytes()); // memsz
        f.extend_from_slice(&0x1000u64.to_le_bytes()); // align
        assert_eq!(f.len(), 120);
        f.extend_from_slice(code);
        f
    }

    #[test]
    fn loads_a_static_image() {
        // mov eax, 231; mov edi, 42; syscall
        let elf = tiny_elf(&[0xb8, 0xe7, 0, 0, 0, 0xbf, 0x2a, 0, 0, 0, 0x0f, 0x05]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exit42");
        std::fs::write(&path, elf).unwrap();

        let sys = System::new(false, false).unwrap();
        let mut m = Machine::new(sys, 1);
        let argv = vec![CString::new("exit42").unwrap()];
        load_program(&mut m, &path, &argv, &[]).unwrap();
        assert_eq!(m.ip, 0x40_0078);
        // argc sits at the final SP, 16-byte aligned.
        assert_eq!(m.gpr(RSP) % 16, 0);
        let mut b = [0u8; 8];
        m.read_bytes(m.gpr(RSP), &mut b).unwrap();
        assert_eq!(read_u64(&b), 1);
    }
}
