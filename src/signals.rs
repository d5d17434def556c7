//! The signal bridge.
//!
//! Guest signals live in Linux numbering regardless of the host. Host
//! signals are translated on the way in: asynchronous ones (SIGINT,
//! SIGALRM, ...) are queued onto the running Machine; SIGSEGV is first
//! offered to the self-modifying-code tracker and only then considered a
//! real fault. Delivery builds the exact frame glibc's sigreturn expects:
//! siginfo (128 bytes), fxsave-style fpstate (512 bytes) and ucontext.

use crate::endian::{read_u64, write_u16, write_u32, write_u64};
use crate::error::Trap;
use crate::machine::Machine;
use crate::stats;
use crate::system::{MachineShared, System};
use log::trace;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal};
use num_derive::FromPrimitive;
use num_traits::cast::FromPrimitive as _;
use std::cell::Cell;
use std::sync::atomic::Ordering;

// Guest signal numbers (Linux).
pub const SIGHUP: i32 = 1;
pub const SIGINT: i32 = 2;
pub const SIGQUIT: i32 = 3;
pub const SIGILL: i32 = 4;
pub const SIGTRAP: i32 = 5;
pub const SIGABRT: i32 = 6;
pub const SIGBUS: i32 = 7;
pub const SIGFPE: i32 = 8;
pub const SIGKILL: i32 = 9;
pub const SIGUSR1: i32 = 10;
pub const SIGSEGV: i32 = 11;
pub const SIGUSR2: i32 = 12;
pub const SIGPIPE: i32 = 13;
pub const SIGALRM: i32 = 14;
pub const SIGTERM: i32 = 15;
pub const SIGCHLD: i32 = 17;
pub const SIGCONT: i32 = 18;
pub const SIGSTOP: i32 = 19;
pub const SIGTSTP: i32 = 20;
pub const SIGURG: i32 = 23;
pub const SIGWINCH: i32 = 28;
pub const SIGSYS: i32 = 31;

// Guest sigaction flags.
pub const SA_SIGINFO: u64 = 4;
pub const SA_RESTORER: u64 = 0x0400_0000;
pub const SA_ONSTACK: u64 = 0x0800_0000;
pub const SA_RESTART: u64 = 0x1000_0000;
pub const SA_NODEFER: u64 = 0x4000_0000;
pub const SA_RESETHAND: u64 = 0x8000_0000;

const SIGINFO_SIZE: u64 = 128;
const FPSTATE_SIZE: u64 = 512;
const UCONTEXT_SIZE: u64 = 968;

/// The classic signals as a typed enum. Guest-supplied integers (from
/// rt_sigaction, kill, delivery) decode through [`Sig::from_i32`];
/// realtime numbers fall outside it on purpose.
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq)]
#[repr(i32)]
pub enum Sig {
    Hup = 1,
    Int = 2,
    Quit = 3,
    Ill = 4,
    Trap = 5,
    Abrt = 6,
    Bus = 7,
    Fpe = 8,
    Kill = 9,
    Usr1 = 10,
    Segv = 11,
    Usr2 = 12,
    Pipe = 13,
    Alrm = 14,
    Term = 15,
    Stkflt = 16,
    Chld = 17,
    Cont = 18,
    Stop = 19,
    Tstp = 20,
    Ttin = 21,
    Ttou = 22,
    Urg = 23,
    Xcpu = 24,
    Xfsz = 25,
    Vtalrm = 26,
    Prof = 27,
    Winch = 28,
    Io = 29,
    Pwr = 30,
    Sys = 31,
}

/// Human-readable cause line.
pub fn describe(sig: i32) -> &'static str {
    match Sig::from_i32(sig) {
        Some(Sig::Hup) => "HANGUP",
        Some(Sig::Int) => "INTERRUPT",
        Some(Sig::Quit) => "QUIT",
        Some(Sig::Ill) => "ILLEGAL INSTRUCTION",
        Some(Sig::Trap) => "TRACE TRAP",
        Some(Sig::Abrt) => "ABORT",
        Some(Sig::Bus) => "BUS ERROR",
        Some(Sig::Fpe) => "FLOATING POINT EXCEPTION",
        Some(Sig::Kill) => "KILLED",
        Some(Sig::Segv) => "SEGMENTATION FAULT",
        Some(Sig::Pipe) => "BROKEN PIPE",
        Some(Sig::Alrm) => "ALARM CLOCK",
        Some(Sig::Term) => "TERMINATED",
        Some(Sig::Sys) => "BAD SYSTEM CALL",
        _ => "SIGNAL",
    }
}

/// Linux default dispositions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    Ignore,
    Terminate,
    Core,
    Stop,
    Continue,
}

pub fn default_action(sig: i32) -> Disposition {
    match Sig::from_i32(sig) {
        Some(Sig::Chld | Sig::Urg | Sig::Winch) => Disposition::Ignore,
        Some(Sig::Cont) => Disposition::Continue,
        Some(Sig::Stop | Sig::Tstp | Sig::Ttin | Sig::Ttou) => Disposition::Stop,
        Some(
            Sig::Quit
            | Sig::Ill
            | Sig::Trap
            | Sig::Abrt
            | Sig::Bus
            | Sig::Fpe
            | Sig::Segv
            | Sig::Sys
            | Sig::Xcpu
            | Sig::Xfsz,
        ) => Disposition::Core,
        // Everything else, realtime included, terminates.
        _ => Disposition::Terminate,
    }
}

/// Host signal number -> guest number. The table exists so a host with
/// different numbering still produces Linux numbers in the guest.
pub fn guest_signal_of_host(host: i32) -> i32 {
    match Signal::try_from(host) {
        Ok(Signal::SIGHUP) => SIGHUP,
        Ok(Signal::SIGINT) => SIGINT,
        Ok(Signal::SIGQUIT) => SIGQUIT,
        Ok(Signal::SIGILL) => SIGILL,
        Ok(Signal::SIGTRAP) => SIGTRAP,
        Ok(Signal::SIGABRT) => SIGABRT,
        Ok(Signal::SIGBUS) => SIGBUS,
        Ok(Signal::SIGFPE) => SIGFPE,
        Ok(Signal::SIGKILL) => SIGKILL,
        Ok(Signal::SIGUSR1) => SIGUSR1,
        Ok(Signal::SIGSEGV) => SIGSEGV,
        Ok(Signal::SIGUSR2) => SIGUSR2,
        Ok(Signal::SIGPIPE) => SIGPIPE,
        Ok(Signal::SIGALRM) => SIGALRM,
        Ok(Signal::SIGTERM) => SIGTERM,
        Ok(Signal::SIGCHLD) => SIGCHLD,
        Ok(Signal::SIGCONT) => SIGCONT,
        Ok(Signal::SIGSTOP) => SIGSTOP,
        Ok(Signal::SIGTSTP) => SIGTSTP,
        Ok(Signal::SIGTTIN) => 21,
        Ok(Signal::SIGTTOU) => 22,
        Ok(Signal::SIGURG) => SIGURG,
        Ok(Signal::SIGXCPU) => 24,
        Ok(Signal::SIGXFSZ) => 25,
        Ok(Signal::SIGVTALRM) => 26,
        Ok(Signal::SIGPROF) => 27,
        Ok(Signal::SIGWINCH) => SIGWINCH,
        Ok(Signal::SIGIO) => 29,
        Ok(Signal::SIGSYS) => SIGSYS,
        _ => SIGTERM,
    }
}

/// Guest number -> host [`Signal`], for kill() and friends.
pub fn host_signal_of_guest(sig: i32) -> Option<Signal> {
    Signal::try_from(sig).ok()
}

struct ThreadCtx {
    sys: *const System,
    shared: *const MachineShared,
}

thread_local! {
    static CURRENT: Cell<Option<ThreadCtx>> = const { Cell::new(None) };
}

/// Publishes the running Machine for this thread's host signal handler.
pub fn enter_thread(m: &Machine) {
    CURRENT.with(|c| {
        c.set(Some(ThreadCtx {
            sys: &*m.sys as *const System,
            shared: &*m.shared as *const MachineShared,
        }))
    });
}

pub fn leave_thread() {
    CURRENT.with(|c| c.set(None));
}

extern "C" fn on_host_signal(sig: libc::c_int, si: *mut libc::siginfo_t, _uc: *mut libc::c_void) {
    CURRENT.with(|c| {
        let ctx = match c.take() {
            Some(ctx) => ctx,
            None => {
                // A signal arrived on a non-Machine thread; best effort.
                if sig == libc::SIGSEGV {
                    unsafe { libc::signal(libc::SIGSEGV, libc::SIG_DFL) };
                }
                return;
            }
        };
        let sys = unsafe { &*ctx.sys };
        let shared = unsafe { &*ctx.shared };
        if sig == libc::SIGSEGV {
            let addr = unsafe { (*si).si_addr() } as usize;
            if let Some(page) = sys.mem.classify_host_fault(addr) {
                // A guest store hit a write-protected code page. Lift the
                // protection so the store completes, and queue the page
                // for invalidation at the next boundary.
                stats::bump(&stats::SMC_SEGFAULTS);
                sys.mem.protect_guest_page_host(page, true);
                if !shared.smc.contains(page) {
                    shared.smc.push(page);
                    shared.attention.store(true, Ordering::Release);
                }
                c.set(Some(ctx));
                return;
            }
            // Not ours: fall back to the default action so the host
            // produces a real crash instead of a loop.
            unsafe { libc::signal(libc::SIGSEGV, libc::SIG_DFL) };
            c.set(Some(ctx));
            return;
        }
        shared.post_signal(guest_signal_of_host(sig));
        c.set(Some(ctx));
    });
}

/// Installs the host handlers the bridge relies on. Called once at
/// startup, before the first Machine runs.
pub fn install_host_handlers() -> Result<(), nix::Error> {
    // No SA_RESTART: a blocking host call must come back with EINTR so
    // the guest sees -EINTR and the signal delivers at the boundary.
    let act = SigAction::new(
        SigHandler::SigAction(on_host_signal),
        SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    for sig in [
        Signal::SIGSEGV,
        Signal::SIGBUS,
        Signal::SIGINT,
        Signal::SIGHUP,
        Signal::SIGTERM,
        Signal::SIGALRM,
        Signal::SIGVTALRM,
        Signal::SIGWINCH,
        Signal::SIGCONT,
        Signal::SIGUSR1,
        Signal::SIGUSR2,
        Signal::SIGPIPE,
    ] {
        unsafe { nix::sys::signal::sigaction(sig, &act)? };
    }
    Ok(())
}

// ----------------------------------------------------------------------
// 80-bit extended conversion for the fpstate st slots.

/// f64 -> 80-bit extended, in a 16-byte frame cell.
pub fn f64_to_f80_bytes(v: f64) -> [u8; 16] {
    let bits = v.to_bits();
    let sign = (bits >> 63) as u16;
    let exp = ((bits >> 52) & 0x7ff) as i32;
    let frac = bits & 0xf_ffff_ffff_ffff;
    let (e80, m80): (u16, u64) = if exp == 0 && frac == 0 {
        (0, 0)
    } else if exp == 0x7ff {
        (0x7fff, (1 << 63) | (frac << 11))
    } else if exp == 0 {
        // Denormal doubles are tiny; flush to zero.
        (0, 0)
    } else {
        ((exp - 1023 + 16383) as u16, (1 << 63) | (frac << 11))
    };
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&m80.to_le_bytes());
    out[8..10].copy_from_slice(&((sign << 15) | e80).to_le_bytes());
    out
}

/// 80-bit extended -> f64.
pub fn f80_bytes_to_f64(b: &[u8]) -> f64 {
    let m80 = u64::from_le_bytes(b[..8].try_into().unwrap());
    let se = u16::from_le_bytes(b[8..10].try_into().unwrap());
    let sign = ((se >> 15) as u64) << 63;
    let e80 = (se & 0x7fff) as i32;
    if e80 == 0 && m80 == 0 {
        return f64::from_bits(sign);
    }
    if e80 == 0x7fff {
        let frac = (m80 << 1) >> 12;
        return f64::from_bits(sign | (0x7ffu64 << 52) | frac);
    }
    let exp = e80 - 16383 + 1023;
    if exp <= 0 {
        return f64::from_bits(sign);
    }
    if exp >= 0x7ff {
        return f64::from_bits(sign | (0x7ffu64 << 52));
    }
    let frac = (m80 << 1) >> 12;
    f64::from_bits(sign | ((exp as u64) << 52) | frac)
}

// ----------------------------------------------------------------------
// Frame construction and restoration.

// mcontext register offsets inside the guest ucontext.
const UC_R8: usize = 40;
const UC_GREGS: [usize; 16] = [
    UC_R8,       // r8
    UC_R8 + 8,   // r9
    UC_R8 + 16,  // r10
    UC_R8 + 24,  // r11
    UC_R8 + 32,  // r12
    UC_R8 + 40,  // r13
    UC_R8 + 48,  // r14
    UC_R8 + 56,  // r15
    UC_R8 + 64,  // rdi
    UC_R8 + 72,  // rsi
    UC_R8 + 80,  // rbp
    UC_R8 + 88,  // rbx
    UC_R8 + 96,  // rdx
    UC_R8 + 104, // rax
    UC_R8 + 112, // rcx
    UC_R8 + 120, // rsp
];
const UC_RIP: usize = UC_R8 + 128;
const UC_EFLAGS: usize = UC_R8 + 136;
const UC_CR2: usize = UC_R8 + 176;
const UC_FPSTATE: usize = UC_R8 + 184;
const UC_SIGMASK: usize = 296;

/// Machine register order matching `UC_GREGS`.
const GREG_ORDER: [u8; 16] = [8, 9, 10, 11, 12, 13, 14, 15, 7, 6, 5, 3, 2, 0, 1, 4];

fn build_fpstate(m: &Machine) -> [u8; FPSTATE_SIZE as usize] {
    let mut fp = [0u8; FPSTATE_SIZE as usize];
    write_u16(&mut fp[0..], m.fpu.cw);
    write_u16(&mut fp[2..], m.fpu.sw);
    write_u16(&mut fp[4..], m.fpu.tw);
    write_u16(&mut fp[6..], m.fpu.op);
    write_u64(&mut fp[8..], m.fpu.ip);
    write_u64(&mut fp[16..], m.fpu.dp);
    write_u32(&mut fp[24..], m.mxcsr);
    write_u32(&mut fp[28..], 0xffff);
    for i in 0..8 {
        fp[32 + i * 16..48 + i * 16].copy_from_slice(&f64_to_f80_bytes(m.fpu.st[i]));
    }
    for i in 0..16 {
        fp[160 + i * 16..176 + i * 16].copy_from_slice(&m.xmm[i]);
    }
    fp
}

fn restore_fpstate(m: &mut Machine, fp: &[u8]) {
    m.fpu.cw = crate::endian::read_u16(&fp[0..]);
    m.fpu.sw = crate::endian::read_u16(&fp[2..]);
    m.fpu.tw = crate::endian::read_u16(&fp[4..]);
    m.fpu.op = crate::endian::read_u16(&fp[6..]);
    m.fpu.ip = read_u64(&fp[8..]);
    m.fpu.dp = read_u64(&fp[16..]);
    m.mxcsr = crate::endian::read_u32(&fp[24..]);
    for i in 0..8 {
        m.fpu.st[i] = f80_bytes_to_f64(&fp[32 + i * 16..48 + i * 16]);
    }
    for i in 0..16 {
        m.xmm[i].copy_from_slice(&fp[160 + i * 16..176 + i * 16]);
    }
}

fn si_code_for(sig: i32) -> i32 {
    match sig {
        SIGSEGV => 1,  // SEGV_MAPERR
        SIGILL => 1,   // ILL_ILLOPC
        SIGFPE => 1,   // FPE_INTDIV
        SIGTRAP => 2,  // TRAP_TRACE
        _ => 0,        // SI_USER
    }
}

/// Builds the signal frame on the guest stack and redirects the Machine
/// into the handler.
pub fn deliver_signal(m: &mut Machine, sig: i32) -> Result<(), Trap> {
    let hand = m.sys.handlers.lock().unwrap()[sig as usize - 1];
    trace!("delivering signal {} to handler {:#x}", sig, hand.handler);

    let mut si = [0u8; SIGINFO_SIZE as usize];
    write_u32(&mut si[0..], sig as u32);
    write_u32(&mut si[8..], si_code_for(sig) as u32);
    write_u64(&mut si[16..], m.fault_addr);

    let fp = build_fpstate(m);

    let mut uc = [0u8; UCONTEXT_SIZE as usize];
    for (slot, reg) in UC_GREGS.iter().zip(GREG_ORDER.iter()) {
        write_u64(&mut uc[*slot..], m.gpr(*reg));
    }
    write_u64(&mut uc[UC_RIP..], m.ip);
    write_u64(&mut uc[UC_EFLAGS..], m.flags);
    write_u64(&mut uc[UC_CR2..], m.fault_addr);
    write_u64(&mut uc[UC_SIGMASK..], m.sigmask);

    // Stack selection: the alternate stack when requested and armed.
    let mut sp = if hand.flags & SA_ONSTACK != 0 {
        match m.altstack {
            Some((base, size)) => base + size,
            None => m.gpr(crate::machine::RSP),
        }
    } else {
        m.gpr(crate::machine::RSP)
    };
    // Skip the red zone.
    sp = sp.wrapping_sub(128);

    sp = (sp - SIGINFO_SIZE) & !15;
    m.write_bytes(sp, &si)?;
    let si_addr = sp;
    sp = (sp - FPSTATE_SIZE) & !15;
    m.write_bytes(sp, &fp)?;
    m.sigfp = sp;
    write_u64(&mut uc[UC_FPSTATE..], sp);
    sp = (sp - UCONTEXT_SIZE) & !15;
    m.write_bytes(sp, &uc)?;
    m.siguc = sp;

    sp -= 8;
    let mut ret = [0u8; 8];
    write_u64(&mut ret, hand.restorer);
    m.write_bytes(sp, &ret)?;

    m.set_gpr(crate::machine::RSP, sp);
    m.set_gpr(crate::machine::RDI, sig as u64);
    m.set_gpr(crate::machine::RSI, si_addr);
    m.set_gpr(crate::machine::RDX, m.siguc);
    m.set_gpr(crate::machine::RAX, 0);
    m.ip = hand.handler;
    m.sig = sig;

    // Block the handler's mask, and the signal itself unless SA_NODEFER.
    m.sigmask |= hand.mask;
    if hand.flags & SA_NODEFER == 0 {
        m.sigmask |= 1u64 << (sig - 1);
    }
    if hand.flags & SA_RESETHAND != 0 {
        m.sys.handlers.lock().unwrap()[sig as usize - 1].handler = 0;
    }
    stats::bump(&stats::SIGNALS_DELIVERED);
    Ok(())
}

/// rt_sigreturn: unwinds the frame `deliver_signal` built.
pub fn sigreturn(m: &mut Machine) -> Result<(), Trap> {
    let mut uc = [0u8; UCONTEXT_SIZE as usize];
    m.read_bytes(m.siguc, &mut uc)?;
    for (slot, reg) in UC_GREGS.iter().zip(GREG_ORDER.iter()) {
        let v = read_u64(&uc[*slot..]);
        m.set_gpr(*reg, v);
    }
    m.ip = read_u64(&uc[UC_RIP..]);
    let fl = read_u64(&uc[UC_EFLAGS..]);
    m.flags = (m.flags & !crate::flags::WRITABLE) | (fl & crate::flags::WRITABLE);
    m.sigmask = read_u64(&uc[UC_SIGMASK..]);
    let fpaddr = read_u64(&uc[UC_FPSTATE..]);
    if fpaddr != 0 {
        let mut fp = [0u8; FPSTATE_SIZE as usize];
        m.read_bytes(fpaddr, &mut fp)?;
        restore_fpstate(m, &fp);
    }
    m.sig = 0;
    trace!("sigreturn to ip={:#x}", m.ip);
    Ok(())
}

/// Scans pending signals and delivers the highest unmasked one. Returns
/// `Ok(Some(sig))` when the default action is fatal.
pub fn consume_signal(m: &mut Machine) -> Result<Option<i32>, Trap> {
    loop {
        let pending = m.shared.pending.load(Ordering::Acquire);
        let deliverable = pending & !m.sigmask;
        if deliverable == 0 {
            return Ok(None);
        }
        let sig = 64 - deliverable.leading_zeros() as i32;
        m.shared
            .pending
            .fetch_and(!(1u64 << (sig - 1)), Ordering::AcqRel);
        let hand = m.sys.handlers.lock().unwrap()[sig as usize - 1];
        match hand.handler {
            0 => match default_action(sig) {
                Disposition::Ignore | Disposition::Continue | Disposition::Stop => continue,
                Disposition::Terminate | Disposition::Core => return Ok(Some(sig)),
            },
            1 => continue,
            _ => {
                deliver_signal(m, sig)?;
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::cast::FromPrimitive as _;

    #[test]
    fn guest_integers_decode_to_typed_signals() {
        assert_eq!(Sig::from_i32(SIGSEGV), Some(Sig::Segv));
        assert_eq!(Sig::from_i32(SIGHUP), Some(Sig::Hup));
        assert_eq!(Sig::from_i32(0), None);
        assert_eq!(Sig::from_i32(42), None, "realtime numbers stay untyped");
    }

    #[test]
    fn extended_precision_roundtrip() {
        for v in [0.0, -0.0, 1.0, -1.5, 3.141592653589793, 1e300, -2.5e-300] {
            let back = f80_bytes_to_f64(&f64_to_f80_bytes(v));
            assert_eq!(back.to_bits(), v.to_bits(), "roundtrip {}", v);
        }
        assert!(f80_bytes_to_f64(&f64_to_f80_bytes(f64::NAN)).is_nan());
        assert_eq!(f80_bytes_to_f64(&f64_to_f80_bytes(f64::INFINITY)), f64::INFINITY);
    }

    #[test]
    fn highest_signal_first() {
        // The ordering property is encoded in the bit scan.
        let pending: u64 = (1 << (SIGINT - 1)) | (1 << (SIGTERM - 1));
        let first = 64 - pending.leading_zeros() as i32;
        assert_eq!(first, SIGTERM);
    }

    #[test]
    fn defaults_match_linux() {
        assert_eq!(default_action(SIGCHLD), Disposition::Ignore);
        assert_eq!(default_action(SIGWINCH), Disposition::Ignore);
        assert_eq!(default_action(SIGSEGV), Disposition::Core);
        assert_eq!(default_action(SIGTERM), Disposition::Terminate);
        assert_eq!(default_action(SIGSTOP), Disposition::Stop);
        assert_eq!(default_action(SIGCONT), Disposition::Continue);
    }
}
