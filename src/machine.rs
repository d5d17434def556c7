//! The per-thread execution context and its fetch loop.

use crate::decode::{self, CpuMode, DecodedInsn, DecodeError, OpMap, Seg};
use crate::dispatch;
use crate::error::Trap;
use crate::flags::{self, Rflags};
use crate::fpu::Fpu;
use crate::jit::{self, PathBuilder, PathOp};
use crate::mmu::Access;
use crate::signals;
use crate::stats;
use crate::system::{MachineShared, System};
use crate::tunables::MAX_INSN_LEN;
use log::{debug, error};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Register file indices.
pub const RAX: u8 = 0;
pub const RCX: u8 = 1;
pub const RDX: u8 = 2;
pub const RBX: u8 = 3;
pub const RSP: u8 = 4;
pub const RBP: u8 = 5;
pub const RSI: u8 = 6;
pub const RDI: u8 = 7;
pub const R8: u8 = 8;
pub const R9: u8 = 9;
pub const R10: u8 = 10;
pub const R11: u8 = 11;

/// Why `Machine::run` stopped.
#[derive(Debug)]
pub enum Exit {
    /// exit/exit_group with this status.
    Status(i32),
    /// Unhandled fatal guest signal.
    Signal(i32),
    /// IP landed on a registered breakpoint.
    Breakpoint(u64),
}

pub struct Machine {
    pub sys: Arc<System>,
    pub shared: Arc<MachineShared>,
    pub tid: i32,

    /// Sixteen 64-bit general-purpose slots.
    pub regs: [u64; 16],
    pub ip: u64,
    pub flags: u64,
    /// Segment descriptor caches: selector and base for ES,CS,SS,DS,FS,GS.
    pub seg_sel: [u16; 6],
    pub seg_base: [u64; 6],
    pub fpu: Fpu,
    pub xmm: [[u8; 16]; 16],
    pub mxcsr: u32,
    pub mode: CpuMode,

    /// Per-instruction scratch.
    pub oplen: u8,
    pub insn_start: u64,
    pub last_read: Option<(u64, usize)>,
    pub last_write: Option<(u64, usize)>,

    /// Signal state. `sigmask` is the cooperative blocked set; `sig` is
    /// nonzero while a guest handler frame is live.
    pub sigmask: u64,
    pub sig: i32,
    pub siguc: u64,
    pub sigfp: u64,
    pub altstack: Option<(u64, u64)>,
    /// Faulting guest address for the next SIGSEGV frame.
    pub fault_addr: u64,

    /// clone() child-tid clearing address.
    pub clear_child_tid: u64,

    /// A watched address was stored to; the run loop pauses on it.
    pub watch_hit: Option<u64>,

    /// Path recording in progress.
    pub recording: Option<PathBuilder>,
}

impl Machine {
    pub fn new(sys: Arc<System>, tid: i32) -> Self {
        let shared = Arc::new(MachineShared::default());
        sys.attach(tid, shared.clone());
        Self {
            sys,
            shared,
            tid,
            regs: [0; 16],
            ip: 0,
            flags: Rflags::FIXED.bits(),
            seg_sel: [0; 6],
            seg_base: [0; 6],
            fpu: Fpu::default(),
            xmm: [[0; 16]; 16],
            mxcsr: 0x1f80,
            mode: CpuMode::Long,
            oplen: 0,
            insn_start: 0,
            last_read: None,
            last_write: None,
            sigmask: 0,
            sig: 0,
            siguc: 0,
            sigfp: 0,
            altstack: None,
            fault_addr: 0,
            clear_child_tid: 0,
            watch_hit: None,
            recording: None,
        }
    }

    // ------------------------------------------------------------------
    // Register access.

    #[inline]
    pub fn gpr(&self, i: u8) -> u64 {
        self.regs[i as usize & 15]
    }

    #[inline]
    pub fn set_gpr(&mut self, i: u8, v: u64) {
        self.regs[i as usize & 15] = v;
    }

    /// Reads a register operand of the given width. Without a REX
    /// prefix, byte indices 4..=7 name AH,CH,DH,BH.
    pub fn read_reg(&self, insn: &DecodedInsn, i: u8, width: usize) -> u64 {
        if width == 1 && !insn.has_rex() && (4..8).contains(&i) {
            (self.regs[(i - 4) as usize] >> 8) & 0xff
        } else {
            let v = self.regs[i as usize & 15];
            match width {
                1 => v & 0xff,
                2 => v & 0xffff,
                4 => v & 0xffff_ffff,
                _ => v,
            }
        }
    }

    /// Writes a register operand. A 32-bit write zero-extends; 8- and
    /// 16-bit writes merge.
    pub fn write_reg(&mut self, insn: &DecodedInsn, i: u8, width: usize, v: u64) {
        if width == 1 && !insn.has_rex() && (4..8).contains(&i) {
            let slot = &mut self.regs[(i - 4) as usize];
            *slot = (*slot & !0xff00) | ((v & 0xff) << 8);
            return;
        }
        let slot = &mut self.regs[i as usize & 15];
        match width {
            1 => *slot = (*slot & !0xff) | (v & 0xff),
            2 => *slot = (*slot & !0xffff) | (v & 0xffff),
            4 => *slot = v & 0xffff_ffff,
            _ => *slot = v,
        }
    }

    /// AH, independent of REX (the divide remainder always lands there).
    pub fn write_ah(&mut self, v: u64) {
        self.regs[0] = (self.regs[0] & !0xff00) | ((v & 0xff) << 8);
    }

    // ------------------------------------------------------------------
    // Effective addresses and memory.

    fn seg_offset(&self, insn: &DecodedInsn) -> u64 {
        match insn.seg {
            Some(Seg::Fs) => self.seg_base[4],
            Some(Seg::Gs) => self.seg_base[5],
            _ if self.mode == CpuMode::Long => 0,
            Some(s) => self.seg_base[s as usize],
            None => 0,
        }
    }

    /// Effective address of the decoded memory operand.
    pub fn ea(&self, insn: &DecodedInsn) -> u64 {
        let mem = insn.mem.expect("ea() on a register operand");
        let mut addr = mem.disp as u64;
        if mem.rip_rel {
            addr = addr.wrapping_add(self.insn_start + insn.len as u64);
        }
        if let Some(base) = mem.base {
            addr = addr.wrapping_add(self.gpr(base));
        }
        if let Some(index) = mem.index {
            addr = addr.wrapping_add(self.gpr(index) << mem.scale);
        }
        let addr = match insn.addrsize() {
            2 => addr & 0xffff,
            4 => addr & 0xffff_ffff,
            _ => addr,
        };
        addr.wrapping_add(self.seg_offset(insn))
    }

    /// Reads `width` little-endian bytes at `addr`.
    pub fn read_mem(&mut self, addr: u64, width: usize) -> Result<u64, Trap> {
        let mut buf = [0u8; 8];
        self.read_bytes(addr, &mut buf[..width])?;
        self.last_read = Some((addr, width));
        Ok(crate::endian::read_uw(&buf, width))
    }

    /// Writes `width` little-endian bytes at `addr`.
    pub fn write_mem(&mut self, addr: u64, v: u64, width: usize) -> Result<(), Trap> {
        let mut buf = [0u8; 8];
        crate::endian::write_uw(&mut buf, v, width);
        self.write_bytes(addr, &buf[..width])?;
        self.last_write = Some((addr, width));
        if self.sys.has_watchpoints.load(Ordering::Relaxed) {
            let watched = self.sys.watchpoints.lock().unwrap();
            for at in addr..addr + width as u64 {
                if watched.contains(&at) {
                    self.watch_hit = Some(at);
                }
            }
        }
        Ok(())
    }

    pub fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), Trap> {
        let n = self.sys.mem.copy_from_guest(buf, addr);
        if n == buf.len() {
            Ok(())
        } else {
            Err(Trap::PageFault {
                addr: addr + n as u64,
                write: false,
            })
        }
    }

    pub fn write_bytes(&self, addr: u64, buf: &[u8]) -> Result<(), Trap> {
        let n = self.sys.mem.copy_to_guest(addr, buf);
        if n == buf.len() {
            Ok(())
        } else {
            Err(Trap::PageFault {
                addr: addr + n as u64,
                write: true,
            })
        }
    }

    /// Host pointer for a locked read-modify-write. The operand must not
    /// straddle a page (misaligned locked accesses fault).
    pub fn host_ptr_w(&self, addr: u64, width: usize) -> Result<*mut u8, Trap> {
        if addr & (width as u64 - 1) != 0 {
            return Err(Trap::PageFault { addr, write: true });
        }
        self.sys
            .mem
            .lookup(addr, Access::Write)
            .ok_or(Trap::PageFault { addr, write: true })
    }

    /// Reads the r/m operand (register or memory).
    pub fn read_rm(&mut self, insn: &DecodedInsn, width: usize) -> Result<u64, Trap> {
        if insn.mem.is_some() {
            let addr = self.ea(insn);
            self.read_mem(addr, width)
        } else {
            Ok(self.read_reg(insn, insn.rm, width))
        }
    }

    /// Writes the r/m operand.
    pub fn write_rm(&mut self, insn: &DecodedInsn, width: usize, v: u64) -> Result<(), Trap> {
        if insn.mem.is_some() {
            let addr = self.ea(insn);
            self.write_mem(addr, v, width)
        } else {
            self.write_reg(insn, insn.rm, width, v);
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Stack.

    pub fn push(&mut self, v: u64, width: usize) -> Result<(), Trap> {
        let sp = self.gpr(RSP).wrapping_sub(width as u64);
        self.write_mem(sp, v, width)?;
        self.set_gpr(RSP, sp);
        Ok(())
    }

    pub fn pop(&mut self, width: usize) -> Result<u64, Trap> {
        let sp = self.gpr(RSP);
        let v = self.read_mem(sp, width)?;
        self.set_gpr(RSP, sp.wrapping_add(width as u64));
        Ok(v)
    }

    // ------------------------------------------------------------------
    // Flags.

    #[inline]
    pub fn set_arith_flags(&mut self, f: u64) {
        self.flags = flags::merge(self.flags, f);
    }

    #[inline]
    pub fn flag(&self, bit: Rflags) -> bool {
        self.flags & bit.bits() != 0
    }

    pub fn set_flag(&mut self, bit: Rflags, on: bool) {
        if on {
            self.flags |= bit.bits();
        } else {
            self.flags &= !bit.bits();
        }
    }

    /// Evaluates condition code `cc` (the low nibble of Jcc/SETcc).
    pub fn cond(&self, cc: u8) -> bool {
        let f = |b: Rflags| self.flag(b);
        let r = match cc >> 1 {
            0 => f(Rflags::OF),
            1 => f(Rflags::CF),
            2 => f(Rflags::ZF),
            3 => f(Rflags::CF) || f(Rflags::ZF),
            4 => f(Rflags::SF),
            5 => f(Rflags::PF),
            6 => f(Rflags::SF) != f(Rflags::OF),
            _ => f(Rflags::ZF) || (f(Rflags::SF) != f(Rflags::OF)),
        };
        r != (cc & 1 != 0)
    }

    // ------------------------------------------------------------------
    // The fetch loop.

    /// Runs until the guest exits, dies to a signal, or pauses.
    pub fn run(&mut self) -> Exit {
        signals::enter_thread(self);
        let exit = self.run_inner();
        signals::leave_thread();
        self.sys.detach(self.tid);
        exit
    }

    fn run_inner(&mut self) -> Exit {
        loop {
            if self.sys.has_breakpoints.load(Ordering::Relaxed)
                && self.sys.breakpoints.lock().unwrap().contains(&self.ip)
            {
                return Exit::Breakpoint(self.ip);
            }
            if let Some(addr) = self.watch_hit.take() {
                return Exit::Breakpoint(addr);
            }
            match self.step() {
                Ok(()) => {}
                Err(Trap::Exit { status }) => return Exit::Status(status),
                Err(Trap::Interrupted) => {}
                Err(trap) => {
                    if let Some(exit) = self.handle_fault(trap) {
                        return exit;
                    }
                }
            }
        }
    }

    /// Converts a guest fault into a signal, growing the stack first
    /// when the fault is a repairable stack-redzone touch.
    fn handle_fault(&mut self, trap: Trap) -> Option<Exit> {
        if let Trap::PageFault { addr, .. } = trap {
            if self.sys.grow_stack(addr) {
                return None; // retry the instruction
            }
            self.fault_addr = addr;
        }
        let sig = trap.signal().expect("control traps handled by caller");
        debug!(
            "guest fault {:?} at ip={:#x}, raising signal {}",
            trap, self.insn_start, sig
        );
        // A fault signal that is ignored or blocked still kills, the way
        // the kernel forces SIGSEGV.
        let handler = self.sys.handlers.lock().unwrap()[sig as usize - 1].handler;
        let blocked = self.sigmask & (1 << (sig - 1)) != 0;
        if handler <= 1 || blocked {
            return Some(self.die(sig));
        }
        self.shared.post_signal(sig);
        match signals::consume_signal(self) {
            Ok(Some(fatal)) => Some(self.die(fatal)),
            Ok(None) => None,
            Err(_) => Some(self.die(sig)),
        }
    }

    /// Prints the unhandled-signal report and returns the exit.
    fn die(&mut self, sig: i32) -> Exit {
        error!(
            "guest killed by {} at ip={:#x}",
            signals::describe(sig),
            self.insn_start
        );
        eprintln!("{}", self.fault_report(sig));
        Exit::Signal(sig)
    }

    /// One-line cause, PC, register dump, and a frame-pointer backtrace
    /// that stops when it leaves mapped memory.
    pub fn fault_report(&self, sig: i32) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} at pc={:#x} addr={:#x}",
            signals::describe(sig),
            self.insn_start,
            self.fault_addr
        );
        let mut bytes = [0u8; MAX_INSN_LEN];
        let got = self.sys.mem.fetch(self.insn_start, &mut bytes);
        if got > 0 {
            if let Ok(insn) = decode::decode(&bytes[..got], self.mode) {
                let _ = writeln!(
                    out,
                    "  {}",
                    crate::dis::disassemble(&insn, self.insn_start)
                );
            }
        }
        const NAMES: [&str; 16] = [
            "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15",
        ];
        for (i, name) in NAMES.iter().enumerate() {
            let _ = write!(out, "{:>4}={:016x}", name, self.regs[i]);
            if i % 4 == 3 {
                out.push('\n');
            }
        }
        let _ = writeln!(out, " flags={:#x}", self.flags);
        let mut bp = self.gpr(RBP);
        let mut depth = 0;
        while depth < 32 {
            let mut frame = [0u8; 16];
            if self.sys.mem.copy_from_guest(&mut frame, bp) != 16 {
                break;
            }
            let next = crate::endian::read_u64(&frame[..8]);
            let ret = crate::endian::read_u64(&frame[8..]);
            if ret == 0 {
                break;
            }
            let _ = writeln!(out, "  #{:<2} {:#x}", depth, ret);
            if next <= bp {
                break;
            }
            bp = next;
            depth += 1;
        }
        out
    }

    /// Boundary work: SMC drain, exit_group, breakpoints, signals.
    fn service_attention(&mut self) -> Result<(), Trap> {
        self.shared.attention.store(false, Ordering::Release);
        if self.shared.smc.overflowed() {
            error!("self-modifying-code queue exhausted");
            std::process::abort();
        }
        if self.shared.smc.pending() {
            self.flush_smc();
        }
        if self.sys.exiting.load(Ordering::Acquire) {
            return Err(Trap::Exit {
                status: self.sys.exit_status.load(Ordering::Acquire),
            });
        }
        if let Ok(Some(fatal)) = signals::consume_signal(self) {
            return Err(Trap::Exit { status: 0x80 | fatal });
        }
        Ok(())
    }

    /// Drains the SMC queue: re-arm the page, drop compiled paths, and
    /// abandon any in-flight recording that crosses a dirty page.
    fn flush_smc(&mut self) {
        let jit = &self.sys.jit;
        let mem = &self.sys.mem;
        let recording_page = self.recording.as_ref().map(|r| r.start & !4095);
        let mut abandon = false;
        self.shared.smc.drain(|page| {
            if jit.enabled() {
                if mem.linear() {
                    mem.protect_guest_page_host(page, false);
                }
                jit.invalidate_page(page);
            }
            if recording_page == Some(page & !4095) {
                abandon = true;
            }
        });
        if abandon {
            stats::bump(&stats::JIT_ABANDONED);
            self.recording = None;
        }
    }

    /// Fetches, decodes and executes one instruction (or replays one
    /// compiled path).
    pub fn step(&mut self) -> Result<(), Trap> {
        if self.shared.attention.load(Ordering::Acquire) {
            self.service_attention()?;
        }

        let tf_before = self.flag(Rflags::TF);

        if self.recording.is_none() {
            if let Some(path) = self.sys.jit.lookup(self.ip) {
                return self.replay_path(&path, tf_before);
            }
        }

        let insn = self.fetch_decode()?;
        let op = dispatch::op_for(&insn)?;
        let was_syscall = insn.map == OpMap::Two && insn.opcode == 0x05;

        self.record(&insn, op);
        self.execute(op, &insn)?;
        stats::bump(&stats::INSTRUCTIONS);

        if tf_before && !was_syscall {
            // si_addr for the single-step trap is the next instruction.
            self.fault_addr = self.ip;
            self.shared.post_signal(signals::SIGTRAP);
        }
        Ok(())
    }

    fn fetch_decode(&mut self) -> Result<DecodedInsn, Trap> {
        let mut buf = [0u8; MAX_INSN_LEN];
        let got = self.sys.mem.fetch(self.ip, &mut buf);
        if got == 0 {
            return Err(Trap::PageFault {
                addr: self.ip,
                write: false,
            });
        }
        match decode::decode(&buf[..got], self.mode) {
            Ok(insn) => Ok(insn),
            Err(DecodeError::Truncated(n)) if got < MAX_INSN_LEN => Err(Trap::PageFault {
                addr: self.ip + n as u64,
                write: false,
            }),
            Err(_) => Err(Trap::InvalidOpcode),
        }
    }

    /// Executes one decoded instruction: IP advances first so that
    /// RIP-relative operands and pushed return addresses see the next
    /// instruction, and rolls back on a fault.
    fn execute(&mut self, op: jit::OpFn, insn: &DecodedInsn) -> Result<(), Trap> {
        self.insn_start = self.ip;
        self.oplen = insn.len;
        self.last_read = None;
        self.last_write = None;
        self.ip = self.ip.wrapping_add(insn.len as u64);
        match op(self, insn) {
            Ok(()) => Ok(()),
            Err(trap) => {
                // INT3/INT1 are traps: the frame resumes after them.
                // Everything else is a fault and resumes at the start.
                if trap != Trap::Debug {
                    self.ip = self.insn_start;
                }
                Err(trap)
            }
        }
    }

    /// Feeds the current instruction into path recording, finishing or
    /// starting recordings as boundaries arrive.
    fn record(&mut self, insn: &DecodedInsn, op: jit::OpFn) {
        if !self.sys.jit.enabled() {
            return;
        }
        if let Some(builder) = self.recording.as_mut() {
            if jit::extends_path(builder, insn, self.ip) {
                builder.ops.push(PathOp {
                    op,
                    insn: insn.clone(),
                });
                builder.next = self.ip + insn.len as u64;
                return;
            }
            let builder = self.recording.take().unwrap();
            self.sys.jit.install(jit::Path {
                start: builder.start,
                len: builder.next - builder.start,
                ops: builder.ops,
            });
        }
        if !jit::ends_path(insn) && self.sys.jit.should_record(self.ip) {
            let mut b = PathBuilder::new(self.ip);
            b.ops.push(PathOp {
                op,
                insn: insn.clone(),
            });
            b.next = self.ip + insn.len as u64;
            self.recording = Some(b);
        }
    }

    fn replay_path(&mut self, path: &jit::Path, tf_before: bool) -> Result<(), Trap> {
        for pop in &path.ops {
            self.execute(pop.op, &pop.insn)?;
            stats::bump(&stats::INSTRUCTIONS);
            if tf_before {
                // Single-stepping never runs from a path; bail to the
                // interpreter after one instruction.
                self.fault_addr = self.ip;
                self.shared.post_signal(signals::SIGTRAP);
                return Ok(());
            }
            if self.shared.attention.load(Ordering::Acquire) {
                return Ok(()); // resume at the boundary
            }
        }
        Ok(())
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.sys.detach(self.tid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmu::{MapKind, Prot};

    pub(crate) fn machine_with_code(code: &[u8]) -> Machine {
        let sys = System::new(false, false).unwrap();
        sys.mem
            .reserve(0x40_0000, 0x1000, Prot::READ | Prot::WRITE, false, MapKind::Image)
            .unwrap();
        sys.mem.copy_to_guest(0x40_0000, code);
        sys.mem
            .protect(0x40_0000, 0x1000, Prot::READ | Prot::EXEC)
            .unwrap();
        sys.mem
            .reserve(0x7f_0000, 0x10000, Prot::READ | Prot::WRITE, false, MapKind::Stack)
            .unwrap();
        let mut m = Machine::new(sys, 1);
        m.ip = 0x40_0000;
        m.set_gpr(RSP, 0x7f_0000 + 0x10000 - 16);
        m
    }

    #[test]
    fn register_aliases() {
        let sys = System::new(false, false).unwrap();
        let mut m = Machine::new(sys, 1);
        let insn = decode::decode(&[0x90], CpuMode::Long).unwrap();
        m.set_gpr(RAX, 0x1122_3344_5566_7788);
        assert_eq!(m.read_reg(&insn, RAX, 1), 0x88);
        assert_eq!(m.read_reg(&insn, 4, 1), 0x77, "AH without REX");
        m.write_reg(&insn, 4, 1, 0xee);
        assert_eq!(m.gpr(RAX), 0x1122_3344_5566_ee88);
        // 32-bit write zero-extends.
        m.write_reg(&insn, RAX, 4, 0x1);
        assert_eq!(m.gpr(RAX), 1);
        // 16-bit write merges.
        m.set_gpr(RBX, 0xffff_ffff_ffff_ffff);
        m.write_reg(&insn, RBX, 2, 0);
        assert_eq!(m.gpr(RBX), 0xffff_ffff_ffff_0000);
    }

    #[test]
    fn simple_add_executes() {
        // mov eax, 5; add eax, 7
        let mut m = machine_with_code(&[0xb8, 5, 0, 0, 0, 0x83, 0xc0, 7]);
        m.step().unwrap();
        assert_eq!(m.gpr(RAX), 5);
        m.step().unwrap();
        assert_eq!(m.gpr(RAX), 12);
        assert_eq!(m.ip, 0x40_0008);
    }

    #[test]
    fn fault_restores_ip() {
        // mov rax, [0] faults and leaves ip at the instruction.
        let mut m = machine_with_code(&[0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0]);
        let r = m.step();
        assert_eq!(
            r,
            Err(Trap::PageFault {
                addr: 0,
                write: false
            })
        );
        assert_eq!(m.ip, 0x40_0000);
    }

    #[test]
    fn push_pop_roundtrip() {
        let mut m = machine_with_code(&[0x90]);
        let sp0 = m.gpr(RSP);
        m.push(0xdead_beef, 8).unwrap();
        assert_eq!(m.gpr(RSP), sp0 - 8);
        assert_eq!(m.pop(8).unwrap(), 0xdead_beef);
        assert_eq!(m.gpr(RSP), sp0);
    }

    #[test]
    fn condition_codes() {
        let sys = System::new(false, false).unwrap();
        let mut m = Machine::new(sys, 1);
        m.set_flag(Rflags::ZF, true);
        assert!(m.cond(0x4)); // JZ
        assert!(!m.cond(0x5)); // JNZ
        m.set_flag(Rflags::ZF, false);
        m.set_flag(Rflags::SF, true);
        m.set_flag(Rflags::OF, false);
        assert!(m.cond(0xc)); // JL
        assert!(!m.cond(0xd)); // JGE
    }
}
