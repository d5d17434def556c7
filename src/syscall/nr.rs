//! Linux x86-64 syscall numbers, plus names for tracing.

pub const READ: u32 = 0;
pub const WRITE: u32 = 1;
pub const OPEN: u32 = 2;
pub const CLOSE: u32 = 3;
pub const STAT: u32 = 4;
pub const FSTAT: u32 = 5;
pub const LSTAT: u32 = 6;
pub const POLL: u32 = 7;
pub const LSEEK: u32 = 8;
pub const MMAP: u32 = 9;
pub const MPROTECT: u32 = 10;
pub const MUNMAP: u32 = 11;
pub const BRK: u32 = 12;
pub const RT_SIGACTION: u32 = 13;
pub const RT_SIGPROCMASK: u32 = 14;
pub const RT_SIGRETURN: u32 = 15;
pub const IOCTL: u32 = 16;
pub const PREAD64: u32 = 17;
pub const PWRITE64: u32 = 18;
pub const READV: u32 = 19;
pub const WRITEV: u32 = 20;
pub const ACCESS: u32 = 21;
pub const PIPE: u32 = 22;
pub const SELECT: u32 = 23;
pub const SCHED_YIELD: u32 = 24;
pub const MSYNC: u32 = 26;
pub const MADVISE: u32 = 28;
pub const DUP: u32 = 32;
pub const DUP2: u32 = 33;
pub const PAUSE: u32 = 34;
pub const NANOSLEEP: u32 = 35;
pub const GETITIMER: u32 = 36;
pub const ALARM: u32 = 37;
pub const SETITIMER: u32 = 38;
pub const GETPID: u32 = 39;
pub const SOCKET: u32 = 41;
pub const CONNECT: u32 = 42;
pub const ACCEPT: u32 = 43;
pub const SENDTO: u32 = 44;
pub const RECVFROM: u32 = 45;
pub const SHUTDOWN: u32 = 48;
pub const BIND: u32 = 49;
pub const LISTEN: u32 = 50;
pub const GETSOCKNAME: u32 = 51;
pub const GETPEERNAME: u32 = 52;
pub const SOCKETPAIR: u32 = 53;
pub const SETSOCKOPT: u32 = 54;
pub const CLONE: u32 = 56;
pub const FORK: u32 = 57;
pub const VFORK: u32 = 58;
pub const EXECVE: u32 = 59;
pub const EXIT: u32 = 60;
pub const WAIT4: u32 = 61;
pub const KILL: u32 = 62;
pub const UNAME: u32 = 63;
pub const FCNTL: u32 = 72;
pub const FLOCK: u32 = 73;
pub const FSYNC: u32 = 74;
pub const FDATASYNC: u32 = 75;
pub const TRUNCATE: u32 = 76;
pub const FTRUNCATE: u32 = 77;
pub const GETDENTS: u32 = 78;
pub const GETCWD: u32 = 79;
pub const CHDIR: u32 = 80;
pub const FCHDIR: u32 = 81;
pub const RENAME: u32 = 82;
pub const MKDIR: u32 = 83;
pub const RMDIR: u32 = 84;
pub const CREAT: u32 = 85;
pub const LINK: u32 = 86;
pub const UNLINK: u32 = 87;
pub const SYMLINK: u32 = 88;
pub const READLINK: u32 = 89;
pub const CHMOD: u32 = 90;
pub const FCHMOD: u32 = 91;
pub const CHOWN: u32 = 92;
pub const FCHOWN: u32 = 93;
pub const LCHOWN: u32 = 94;
pub const UMASK: u32 = 95;
pub const GETTIMEOFDAY: u32 = 96;
pub const GETRLIMIT: u32 = 97;
pub const GETRUSAGE: u32 = 98;
pub const TIMES: u32 = 100;
pub const GETUID: u32 = 102;
pub const GETGID: u32 = 104;
pub const SETUID: u32 = 105;
pub const SETGID: u32 = 106;
pub const GETEUID: u32 = 107;
pub const GETEGID: u32 = 108;
pub const SETPGID: u32 = 109;
pub const GETPPID: u32 = 110;
pub const SETSID: u32 = 112;
pub const GETPGID: u32 = 121;
pub const RT_SIGSUSPEND: u32 = 130;
pub const SIGALTSTACK: u32 = 131;
pub const MKNOD: u32 = 133;
pub const STATFS: u32 = 137;
pub const FSTATFS: u32 = 138;
pub const ARCH_PRCTL: u32 = 158;
pub const SETRLIMIT: u32 = 160;
pub const GETTID: u32 = 186;
pub const TKILL: u32 = 200;
pub const FUTEX: u32 = 202;
pub const GETDENTS64: u32 = 217;
pub const SET_TID_ADDRESS: u32 = 218;
pub const CLOCK_GETTIME: u32 = 228;
pub const CLOCK_GETRES: u32 = 229;
pub const CLOCK_NANOSLEEP: u32 = 230;
pub const EXIT_GROUP: u32 = 231;
pub const TGKILL: u32 = 234;
pub const UTIMES: u32 = 235;
pub const OPENAT: u32 = 257;
pub const MKDIRAT: u32 = 258;
pub const MKNODAT: u32 = 259;
pub const FCHOWNAT: u32 = 260;
pub const FUTIMESAT: u32 = 261;
pub const NEWFSTATAT: u32 = 262;
pub const UNLINKAT: u32 = 263;
pub const RENAMEAT: u32 = 264;
pub const LINKAT: u32 = 265;
pub const SYMLINKAT: u32 = 266;
pub const READLINKAT: u32 = 267;
pub const FCHMODAT: u32 = 268;
pub const FACCESSAT: u32 = 269;
pub const PSELECT6: u32 = 270;
pub const PPOLL: u32 = 271;
pub const UTIMENSAT: u32 = 280;
pub const ACCEPT4: u32 = 288;
pub const DUP3: u32 = 292;
pub const PIPE2: u32 = 293;
pub const PRLIMIT64: u32 = 302;
pub const RENAMEAT2: u32 = 316;
pub const GETRANDOM: u32 = 318;
pub const FACCESSAT2: u32 = 439;
pub const CLOSE_RANGE: u32 = 436;

/// Name for strace-style logging.
pub fn name(nr: u32) -> &'static str {
    match nr {
        READ => "read",
        WRITE => "write",
        OPEN => "open",
        CLOSE => "close",
        STAT => "stat",
        FSTAT => "fstat",
        LSTAT => "lstat",
        POLL => "poll",
        LSEEK => "lseek",
        MMAP => "mmap",
        MPROTECT => "mprotect",
        MUNMAP => "munmap",
        BRK => "brk",
        RT_SIGACTION => "rt_sigaction",
        RT_SIGPROCMASK => "rt_sigprocmask",
        RT_SIGRETURN => "rt_sigreturn",
        IOCTL => "ioctl",
        PREAD64 => "pread64",
        PWRITE64 => "pwrite64",
        READV => "readv",
        WRITEV => "writev",
        ACCESS => "access",
        PIPE => "pipe",
        SELECT => "select",
        SCHED_YIELD => "sched_yield",
        MSYNC => "msync",
        MADVISE => "madvise",
        DUP => "dup",
        DUP2 => "dup2",
        PAUSE => "pause",
        NANOSLEEP => "nanosleep",
        GETITIMER => "getitimer",
        ALARM => "alarm",
        SETITIMER => "setitimer",
        GETPID => "getpid",
        SOCKET => "socket",
        CONNECT => "connect",
        ACCEPT => "accept",
        SENDTO => "sendto",
        RECVFROM => "recvfrom",
        SHUTDOWN => "shutdown",
        BIND => "bind",
        LISTEN => "listen",
        GETSOCKNAME => "getsockname",
        GETPEERNAME => "getpeername",
        SOCKETPAIR => "socketpair",
        SETSOCKOPT => "setsockopt",
        CLONE => "clone",
        FORK => "fork",
        VFORK => "vfork",
        EXECVE => "execve",
        EXIT => "exit",
        WAIT4 => "wait4",
        KILL => "kill",
        UNAME => "uname",
        FCNTL => "fcntl",
        FLOCK => "flock",
        FSYNC => "fsync",
        FDATASYNC => "fdatasync",
        TRUNCATE => "truncate",
        FTRUNCATE => "ftruncate",
        GETDENTS => "getdents",
        GETCWD => "getcwd",
        CHDIR => "chdir",
        FCHDIR => "fchdir",
        RENAME => "rename",
        MKDIR => "mkdir",
        RMDIR => "rmdir",
        CREAT => "creat",
        LINK => "link",
        UNLINK => "unlink",
        SYMLINK => "symlink",
        READLINK => "readlink",
        CHMOD => "chmod",
        FCHMOD => "fchmod",
        CHOWN => "chown",
        FCHOWN => "fchown",
        LCHOWN => "lchown",
        UMASK => "umask",
        GETTIMEOFDAY => "gettimeofday",
        GETRLIMIT => "getrlimit",
        GETRUSAGE => "getrusage",
        TIMES => "times",
        GETUID => "getuid",
        GETGID => "getgid",
        SETUID => "setuid",
        SETGID => "setgid",
        GETEUID => "geteuid",
        GETEGID => "getegid",
        SETPGID => "setpgid",
        GETPPID => "getppid",
        SETSID => "setsid",
        GETPGID => "getpgid",
        RT_SIGSUSPEND => "rt_sigsuspend",
        SIGALTSTACK => "sigaltstack",
        MKNOD => "mknod",
        STATFS => "statfs",
        FSTATFS => "fstatfs",
        ARCH_PRCTL => "arch_prctl",
        SETRLIMIT => "setrlimit",
        GETTID => "gettid",
        TKILL => "tkill",
        FUTEX => "futex",
        GETDENTS64 => "getdents64",
        SET_TID_ADDRESS => "set_tid_address",
        CLOCK_GETTIME => "clock_gettime",
        CLOCK_GETRES => "clock_getres",
        CLOCK_NANOSLEEP => "clock_nanosleep",
        EXIT_GROUP => "exit_group",
        TGKILL => "tgkill",
        UTIMES => "utimes",
        OPENAT => "openat",
        MKDIRAT => "mkdirat",
        MKNODAT => "mknodat",
        FCHOWNAT => "fchownat",
        FUTIMESAT => "futimesat",
        NEWFSTATAT => "newfstatat",
        UNLINKAT => "unlinkat",
        RENAMEAT => "renameat",
        LINKAT => "linkat",
        SYMLINKAT => "symlinkat",
        READLINKAT => "readlinkat",
        FCHMODAT => "fchmodat",
        FACCESSAT => "faccessat",
        FACCESSAT2 => "faccessat2",
        PSELECT6 => "pselect6",
        PPOLL => "ppoll",
        UTIMENSAT => "utimensat",
        ACCEPT4 => "accept4",
        DUP3 => "dup3",
        PIPE2 => "pipe2",
        PRLIMIT64 => "prlimit64",
        RENAMEAT2 => "renameat2",
        GETRANDOM => "getrandom",
        CLOSE_RANGE => "close_range",
        _ => "?",
    }
}
