//! Process, thread, and identity syscalls.

use super::structs::*;
use super::xlat::{self, errno::*};
use super::{gread, gwrite, read_cstr, SysResult};
use crate::error::Trap;
use crate::machine::Machine;
use log::debug;
use std::sync::atomic::Ordering;

/// exit and exit_group. Returns the control-flow trap that unwinds the
/// fetch loop.
pub fn exit(m: &mut Machine, status: i32, group: bool) -> Result<i64, Trap> {
    // Clear the child-tid word and wake any joiner, the way the kernel
    // does for CLONE_CHILD_CLEARTID.
    if m.clear_child_tid != 0 {
        let zero = [0u8; 4];
        let _ = m.sys.mem.copy_to_guest(m.clear_child_tid, &zero);
        if let Some(ptr) = m.sys.mem.lookup(m.clear_child_tid, crate::mmu::Access::Read) {
            unsafe {
                libc::syscall(libc::SYS_futex, ptr, libc::FUTEX_WAKE, i32::MAX);
            }
        }
    }
    if group {
        m.sys.begin_exit(status);
    }
    Err(Trap::Exit { status })
}

pub fn fork(m: &mut Machine) -> SysResult {
    // The child continues from the same Machine state in a new host
    // process; the arena is private so the address space copies with it.
    let rc = unsafe { libc::fork() };
    match rc {
        -1 => Err(xlat::last_errno()),
        0 => {
            m.sys.isfork.store(true, Ordering::Release);
            Ok(0)
        }
        pid => Ok(pid as i64),
    }
}

/// The thread-spawn subset of clone: CLONE_VM with a fresh stack. Other
/// flag combinations fall back to fork semantics or are refused.
pub fn clone(m: &mut Machine, a: [u64; 6]) -> SysResult {
    const CLONE_VM: u64 = 0x100;
    const CLONE_THREAD: u64 = 0x10000;
    const CLONE_CHILD_CLEARTID: u64 = 0x200000;
    const CLONE_CHILD_SETTID: u64 = 0x1000000;
    const CLONE_SETTLS: u64 = 0x80000;
    let flags = a[0];
    let stack = a[1];
    if flags & CLONE_VM == 0 {
        return fork(m);
    }
    if flags & CLONE_THREAD == 0 || stack == 0 {
        return Err(-EINVAL);
    }

    let sys = m.sys.clone();
    let child_tid = next_tid();
    let mut child = Machine::new(sys.clone(), child_tid);
    child.regs = m.regs;
    child.ip = m.ip;
    child.flags = m.flags;
    child.fpu = m.fpu.clone();
    child.xmm = m.xmm;
    child.mxcsr = m.mxcsr;
    child.seg_base = m.seg_base;
    child.sigmask = m.sigmask;
    child.set_gpr(crate::machine::RSP, stack);
    child.set_gpr(crate::machine::RAX, 0);
    if flags & CLONE_SETTLS != 0 {
        child.seg_base[4] = a[4]; // FS
    }
    if flags & CLONE_CHILD_SETTID != 0 && a[3] != 0 {
        let mut b = [0u8; 4];
        crate::endian::write_u32(&mut b, child_tid as u32);
        let _ = sys.mem.copy_to_guest(a[3], &b);
    }
    if flags & CLONE_CHILD_CLEARTID != 0 {
        child.clear_child_tid = a[3];
    }

    debug!("clone: spawning guest thread {}", child_tid);
    std::thread::Builder::new()
        .name(format!("guest-{}", child_tid))
        .spawn(move || {
            let mut child = child;
            child.run();
        })
        .map_err(|_| -EAGAIN)?;
    Ok(child_tid as i64)
}

fn next_tid() -> i32 {
    use std::sync::atomic::AtomicI32;
    static NEXT: AtomicI32 = AtomicI32::new(0);
    let base = std::process::id() as i32;
    base + NEXT.fetch_add(1, Ordering::Relaxed) + 1
}

pub fn execve(m: &mut Machine, a: [u64; 6]) -> SysResult {
    // Replace the guest image inside the same VM process by re-running
    // the loader over a fresh System.
    let path = super::read_path(m, a[0])?;
    let argv = read_string_vec(m, a[1])?;
    let envp = read_string_vec(m, a[2])?;
    if !path.exists() {
        return Err(-ENOENT);
    }
    match crate::loader::replace_image(m, &path, &argv, &envp) {
        Ok(()) => Ok(0),
        Err(crate::error::Error::Loader(_)) => Err(-ENOEXEC),
        Err(_) => Err(-ENOMEM),
    }
}

fn read_string_vec(m: &Machine, mut table: u64) -> Result<Vec<std::ffi::CString>, i64> {
    let mut out = Vec::new();
    if table == 0 {
        return Ok(out);
    }
    loop {
        let mut b = [0u8; 8];
        gread(m, table, &mut b)?;
        let ptr = crate::endian::read_u64(&b);
        if ptr == 0 {
            return Ok(out);
        }
        out.push(read_cstr(m, ptr)?);
        if out.len() > 4096 {
            return Err(-E2BIG);
        }
        table += 8;
    }
}

pub fn wait4(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let mut status: libc::c_int = 0;
    let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe {
        libc::wait4(
            a[0] as libc::pid_t,
            &mut status,
            a[2] as libc::c_int,
            &mut ru,
        )
    };
    if rc < 0 {
        return Err(xlat::last_errno());
    }
    if a[1] != 0 {
        let mut b = [0u8; 4];
        crate::endian::write_u32(&mut b, status as u32);
        gwrite(m, a[1], &b)?;
    }
    if a[3] != 0 {
        let mut b = [0u8; RUSAGE_SIZE];
        write_rusage(&mut b, &ru);
        gwrite(m, a[3], &b)?;
    }
    Ok(rc as i64)
}

pub fn kill(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let pid = a[0] as i64;
    let sig = a[1] as i32;
    if !(1..=64).contains(&sig) && sig != 0 {
        return Err(-EINVAL);
    }
    if pid == std::process::id() as i64 || pid == 0 {
        // Self-signal: queue on this Machine directly.
        if sig != 0 {
            m.shared.post_signal(sig);
        }
        return Ok(0);
    }
    match crate::signals::host_signal_of_guest(sig) {
        Some(host) => xlat::nix_zero(nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            if sig == 0 { None } else { Some(host) },
        )),
        None => Err(-EINVAL),
    }
}

pub fn tkill(m: &mut Machine, nr: u32, a: [u64; 6]) -> SysResult {
    let (tid, sig) = if nr == super::nr::TGKILL {
        (a[1] as i32, a[2] as i32)
    } else {
        (a[0] as i32, a[1] as i32)
    };
    if !(1..=64).contains(&sig) {
        return Err(-EINVAL);
    }
    match m.sys.machine(tid) {
        Some(shared) => {
            shared.post_signal(sig);
            Ok(0)
        }
        None => Err(-ESRCH),
    }
}

pub fn uname(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let mut buf = vec![0u8; 6 * UTSNAME_FIELD];
    let fields = ["Linux", "ux64", "4.5.0", "#1", "x86_64", ""];
    for (n, f) in fields.iter().enumerate() {
        write_utsname_field(&mut buf[n * UTSNAME_FIELD..], f);
    }
    gwrite(m, a[0], &buf)?;
    Ok(0)
}

pub fn arch_prctl(m: &mut Machine, a: [u64; 6]) -> SysResult {
    const ARCH_SET_GS: u64 = 0x1001;
    const ARCH_SET_FS: u64 = 0x1002;
    const ARCH_GET_FS: u64 = 0x1003;
    const ARCH_GET_GS: u64 = 0x1004;
    match a[0] {
        ARCH_SET_FS => {
            m.seg_base[4] = a[1];
            Ok(0)
        }
        ARCH_SET_GS => {
            m.seg_base[5] = a[1];
            Ok(0)
        }
        ARCH_GET_FS => {
            let mut b = [0u8; 8];
            crate::endian::write_u64(&mut b, m.seg_base[4]);
            gwrite(m, a[1], &b)?;
            Ok(0)
        }
        ARCH_GET_GS => {
            let mut b = [0u8; 8];
            crate::endian::write_u64(&mut b, m.seg_base[5]);
            gwrite(m, a[1], &b)?;
            Ok(0)
        }
        _ => Err(-EINVAL),
    }
}

pub fn getrlimit(m: &mut Machine, resource: u64, out: u64) -> SysResult {
    let mut rl = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(resource as libc::c_int as _, &mut rl) } < 0 {
        return Err(xlat::last_errno());
    }
    let mut b = [0u8; RLIMIT_SIZE];
    write_rlimit(&mut b, rl.rlim_cur, rl.rlim_max);
    gwrite(m, out, &b)?;
    Ok(0)
}

pub fn setrlimit(m: &mut Machine, resource: u64, addr: u64) -> SysResult {
    let mut b = [0u8; RLIMIT_SIZE];
    gread(m, addr, &mut b)?;
    let (cur, max) = read_rlimit(&b);
    let rl = libc::rlimit {
        rlim_cur: cur,
        rlim_max: max,
    };
    xlat::host_zero(unsafe { libc::setrlimit(resource as libc::c_int as _, &rl) })
}

pub fn prlimit(m: &mut Machine, a: [u64; 6]) -> SysResult {
    if a[0] != 0 && a[0] != std::process::id() as u64 {
        return Err(-EPERM);
    }
    if a[3] != 0 {
        getrlimit(m, a[1], a[3])?;
    }
    if a[2] != 0 {
        setrlimit(m, a[1], a[2])?;
    }
    Ok(0)
}

pub fn getrusage(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let who = a[0] as i64 as libc::c_int;
    let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrusage(who, &mut ru) } < 0 {
        return Err(xlat::last_errno());
    }
    let mut b = [0u8; RUSAGE_SIZE];
    write_rusage(&mut b, &ru);
    gwrite(m, a[1], &b)?;
    Ok(0)
}

pub fn getrandom(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let len = (a[1] as usize).min(1 << 20);
    let mut buf = vec![0u8; len];
    let rc = unsafe {
        libc::syscall(
            libc::SYS_getrandom,
            buf.as_mut_ptr(),
            len,
            a[2] as libc::c_uint,
        )
    };
    if rc < 0 {
        return Err(xlat::last_errno());
    }
    gwrite(m, a[0], &buf[..rc as usize])?;
    Ok(rc as i64)
}

/// The wait/wake subset of futex, run against host futexes on the
/// arena-backed words so guest threads interleave correctly.
pub fn futex(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let op = a[1] & !xlat::FUTEX_PRIVATE_FLAG;
    let ptr = match m.sys.mem.lookup(a[0], crate::mmu::Access::Read) {
        Some(p) => p,
        None => return Err(-EFAULT),
    };
    match op {
        xlat::FUTEX_WAIT => {
            let ts;
            let timeout: *const libc::timespec = if a[3] != 0 {
                let mut b = [0u8; TIMESPEC_SIZE];
                gread(m, a[3], &mut b)?;
                let (sec, nsec) = read_timespec(&b);
                ts = libc::timespec {
                    tv_sec: sec,
                    tv_nsec: nsec,
                };
                &ts
            } else {
                std::ptr::null()
            };
            let rc = unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    ptr,
                    libc::FUTEX_WAIT,
                    a[2] as u32,
                    timeout,
                )
            };
            xlat::host_ret(rc)
        }
        xlat::FUTEX_WAKE => {
            let rc = unsafe {
                libc::syscall(libc::SYS_futex, ptr, libc::FUTEX_WAKE, a[2] as u32)
            };
            xlat::host_ret(rc)
        }
        _ => Err(-ENOSYS),
    }
}
