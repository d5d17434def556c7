//! The Linux syscall translation layer.
//!
//! SYSCALL reads the number from RAX and arguments from
//! DI/SI/DX/R10/R8/R9, routes to a per-call function, and returns the
//! result (or a negated Linux errno) in RAX. Guest pointers are
//! marshaled through the MMU; a bad pointer is -EFAULT, never a signal.
//! Unknown numbers are -ENOSYS.

mod fs;
mod mem;
mod net;
mod nr;
mod poll;
mod proc;
mod sig;
mod structs;
mod time;
pub mod xlat;

use crate::decode::DecodedInsn;
use crate::error::Trap;
use crate::machine::{Machine, R10, R11, R8, R9, RAX, RCX, RDI, RDX, RSI};
use crate::stats;
use log::debug;
use xlat::errno::*;

/// Result of one syscall: RAX value, or a control-flow trap (exit,
/// sigreturn's register rewrite).
pub(crate) type SysResult = Result<i64, i64>;

/// The SYSCALL instruction handler (0F 05).
pub fn op_syscall(m: &mut Machine, _i: &DecodedInsn) -> Result<(), Trap> {
    stats::bump(&stats::SYSCALLS);
    // SYSCALL architecturally leaves the return address in RCX and the
    // saved flags in R11.
    m.set_gpr(RCX, m.ip);
    m.set_gpr(R11, m.flags);

    let nr = m.gpr(RAX) as u32;
    let args = [
        m.gpr(RDI),
        m.gpr(RSI),
        m.gpr(RDX),
        m.gpr(R10),
        m.gpr(R8),
        m.gpr(R9),
    ];

    let ret = dispatch(m, nr, args)?;
    debug!(
        "syscall {}({:#x}, {:#x}, {:#x}) = {}",
        nr::name(nr),
        args[0],
        args[1],
        args[2],
        ret
    );
    m.set_gpr(RAX, ret as u64);
    Ok(())
}

fn dispatch(m: &mut Machine, nr: u32, a: [u64; 6]) -> Result<i64, Trap> {
    use nr::*;
    let r: SysResult = match nr {
        READ => fs::read(m, a),
        WRITE => fs::write(m, a),
        OPEN => fs::open(m, a[0], a[1], a[2], true),
        CLOSE => fs::close(m, a),
        STAT => fs::stat(m, a, false),
        FSTAT => fs::fstat(m, a),
        LSTAT => fs::stat(m, a, true),
        POLL => poll::poll(m, a),
        LSEEK => fs::lseek(m, a),
        MMAP => mem::mmap(m, a),
        MPROTECT => mem::mprotect(m, a),
        MUNMAP => mem::munmap(m, a),
        BRK => Ok(m.sys.do_brk(a[0]) as i64),
        RT_SIGACTION => sig::rt_sigaction(m, a),
        RT_SIGPROCMASK => sig::rt_sigprocmask(m, a),
        RT_SIGRETURN => {
            crate::signals::sigreturn(m)?;
            return Ok(m.gpr(RAX) as i64);
        }
        IOCTL => fs::ioctl(m, a),
        PREAD64 => fs::pread(m, a),
        PWRITE64 => fs::pwrite(m, a),
        READV => fs::readv(m, a),
        WRITEV => fs::writev(m, a),
        ACCESS => fs::access(m, a),
        PIPE => fs::pipe(m, a[0], 0),
        SELECT => poll::select(m, a),
        SCHED_YIELD => {
            std::thread::yield_now();
            Ok(0)
        }
        MSYNC => Ok(0),
        MADVISE => Ok(0),
        DUP => fs::dup(m, a),
        DUP2 => fs::dup3(m, a[0], a[1], 0, true),
        PAUSE => sig::pause(m),
        NANOSLEEP => time::nanosleep(m, a),
        GETITIMER => time::getitimer(m, a),
        ALARM => time::alarm(m, a),
        SETITIMER => time::setitimer(m, a),
        GETPID => Ok(std::process::id() as i64),
        SOCKET => net::socket(m, a),
        CONNECT => net::connect(m, a),
        ACCEPT => net::accept(m, a, 0),
        SENDTO => net::sendto(m, a),
        RECVFROM => net::recvfrom(m, a),
        SHUTDOWN => net::shutdown(m, a),
        BIND => net::bind(m, a),
        LISTEN => net::listen(m, a),
        GETSOCKNAME => net::sockname(m, a, false),
        GETPEERNAME => net::sockname(m, a, true),
        SOCKETPAIR => net::socketpair(m, a),
        SETSOCKOPT => net::setsockopt(m, a),
        CLONE => proc::clone(m, a),
        FORK => proc::fork(m),
        VFORK => proc::fork(m),
        EXECVE => proc::execve(m, a),
        EXIT => return proc::exit(m, a[0] as i32, false),
        WAIT4 => proc::wait4(m, a),
        KILL => proc::kill(m, a),
        UNAME => proc::uname(m, a),
        FCNTL => fs::fcntl(m, a),
        FLOCK => fs::flock(m, a),
        FSYNC => fs::fsync(m, a, false),
        FDATASYNC => fs::fsync(m, a, true),
        TRUNCATE => fs::truncate(m, a),
        FTRUNCATE => fs::ftruncate(m, a),
        GETDENTS | GETDENTS64 => fs::getdents64(m, a),
        GETCWD => fs::getcwd(m, a),
        CHDIR => fs::chdir(m, a),
        FCHDIR => fs::fchdir(m, a),
        RENAME => fs::rename(m, a),
        MKDIR => fs::mkdirat_path(m, xlat::AT_FDCWD, a[0], a[1]),
        RMDIR => fs::rmdir(m, a),
        CREAT => fs::open(
            m,
            a[0],
            (xlat::O_CREAT | xlat::O_WRONLY | xlat::O_TRUNC) as u64,
            a[1],
            true,
        ),
        LINK => fs::link(m, a),
        UNLINK => fs::unlinkat_path(m, xlat::AT_FDCWD, a[0], 0),
        SYMLINK => fs::symlink(m, a),
        READLINK => fs::readlinkat_path(m, xlat::AT_FDCWD, a[0], a[1], a[2]),
        CHMOD => fs::chmod(m, a),
        FCHMOD => fs::fchmod(m, a),
        CHOWN | LCHOWN => fs::chown(m, a, nr == LCHOWN),
        FCHOWN => fs::fchown(m, a),
        UMASK => fs::umask(m, a),
        GETTIMEOFDAY => time::gettimeofday(m, a),
        GETRLIMIT => proc::getrlimit(m, a[0], a[1]),
        GETRUSAGE => proc::getrusage(m, a),
        GETUID => Ok(unsafe { libc::getuid() } as i64),
        GETGID => Ok(unsafe { libc::getgid() } as i64),
        SETUID => xlat::host_zero(unsafe { libc::setuid(a[0] as libc::uid_t) }),
        SETGID => xlat::host_zero(unsafe { libc::setgid(a[0] as libc::gid_t) }),
        GETEUID => Ok(unsafe { libc::geteuid() } as i64),
        GETEGID => Ok(unsafe { libc::getegid() } as i64),
        SETPGID => xlat::host_zero(unsafe {
            libc::setpgid(a[0] as libc::pid_t, a[1] as libc::pid_t)
        }),
        GETPPID => Ok(unsafe { libc::getppid() } as i64),
        SETSID => xlat::host_ret(unsafe { libc::setsid() } as i64),
        GETPGID => xlat::host_ret(unsafe { libc::getpgid(a[0] as libc::pid_t) } as i64),
        SIGALTSTACK => sig::sigaltstack(m, a),
        RT_SIGSUSPEND => return sig::rt_sigsuspend(m, a),
        MKNOD => fs::mknodat_path(m, xlat::AT_FDCWD, a[0], a[1], a[2]),
        STATFS => fs::statfs(m, a),
        FSTATFS => fs::fstatfs(m, a),
        ARCH_PRCTL => proc::arch_prctl(m, a),
        SETRLIMIT => proc::setrlimit(m, a[0], a[1]),
        GETTID => Ok(m.tid as i64),
        TKILL | TGKILL => proc::tkill(m, nr, a),
        TIMES => Ok(0),
        FUTEX => proc::futex(m, a),
        SET_TID_ADDRESS => {
            m.clear_child_tid = a[0];
            Ok(m.tid as i64)
        }
        CLOCK_GETTIME => time::clock_gettime(m, a),
        CLOCK_GETRES => time::clock_getres(m, a),
        CLOCK_NANOSLEEP => time::clock_nanosleep(m, a),
        EXIT_GROUP => return proc::exit(m, a[0] as i32, true),
        OPENAT => fs::openat(m, a),
        MKDIRAT => fs::mkdirat_path(m, a[0] as i32, a[1], a[2]),
        MKNODAT => fs::mknodat_path(m, a[0] as i32, a[1], a[2], a[3]),
        FCHOWNAT => fs::fchownat(m, a),
        NEWFSTATAT => fs::fstatat(m, a),
        UNLINKAT => fs::unlinkat_path(m, a[0] as i32, a[1], a[2] as u32),
        RENAMEAT | RENAMEAT2 => fs::renameat(m, a),
        LINKAT => fs::linkat(m, a),
        SYMLINKAT => fs::symlinkat(m, a),
        READLINKAT => fs::readlinkat_path(m, a[0] as i32, a[1], a[2], a[3]),
        FCHMODAT => fs::fchmodat(m, a),
        FACCESSAT | FACCESSAT2 => fs::faccessat(m, a),
        PSELECT6 => poll::pselect(m, a),
        PPOLL => poll::ppoll(m, a),
        UTIMES | UTIMENSAT | FUTIMESAT => fs::utimensat(m, nr, a),
        ACCEPT4 => net::accept(m, a, a[3] as u32),
        DUP3 => fs::dup3(m, a[0], a[1], a[2] as u32, false),
        PIPE2 => fs::pipe(m, a[0], a[1] as u32),
        PRLIMIT64 => proc::prlimit(m, a),
        GETRANDOM => proc::getrandom(m, a),
        CLOSE_RANGE => fs::close_range(m, a),
        _ => {
            debug!("unknown syscall {} -> ENOSYS", nr);
            Err(-ENOSYS)
        }
    };
    Ok(r.unwrap_or_else(|e| e))
}

// ----------------------------------------------------------------------
// Guest-memory marshaling helpers shared by the family modules.

/// Copies bytes out of guest memory; -EFAULT on an unmapped page.
pub(crate) fn gread(m: &Machine, addr: u64, buf: &mut [u8]) -> Result<(), i64> {
    if m.sys.mem.copy_from_guest(buf, addr) == buf.len() {
        Ok(())
    } else {
        Err(-EFAULT)
    }
}

/// Copies bytes into guest memory; -EFAULT on an unmapped page.
pub(crate) fn gwrite(m: &Machine, addr: u64, buf: &[u8]) -> Result<(), i64> {
    if m.sys.mem.copy_to_guest(addr, buf) == buf.len() {
        Ok(())
    } else {
        Err(-EFAULT)
    }
}

/// Reads a NUL-terminated guest string.
pub(crate) fn read_cstr(m: &Machine, addr: u64) -> Result<std::ffi::CString, i64> {
    let mut out = Vec::new();
    let mut at = addr;
    loop {
        let mut chunk = [0u8; 256];
        let n = m.sys.mem.copy_from_guest(&mut chunk, at);
        if n == 0 {
            return Err(-EFAULT);
        }
        if let Some(pos) = chunk[..n].iter().position(|&b| b == 0) {
            out.extend_from_slice(&chunk[..pos]);
            return std::ffi::CString::new(out).map_err(|_| -EINVAL);
        }
        out.extend_from_slice(&chunk[..n]);
        if out.len() > 4096 {
            return Err(-ENAMETOOLONG);
        }
        at += n as u64;
    }
}

/// Reads a guest path argument into a host `PathBuf`.
pub(crate) fn read_path(m: &Machine, addr: u64) -> Result<std::path::PathBuf, i64> {
    use std::os::unix::ffi::OsStrExt;
    let s = read_cstr(m, addr)?;
    Ok(std::path::PathBuf::from(std::ffi::OsStr::from_bytes(
        s.as_bytes(),
    )))
}
