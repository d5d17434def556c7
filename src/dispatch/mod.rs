//! Instruction dispatch: one handler function per opcode family.
//!
//! `op_for` maps a decoded instruction to its handler; the same function
//! pointers serve as the JIT's path templates. Handlers run with IP
//! already advanced past the instruction and report faults by returning
//! a `Trap`, which the fetch loop converts into a guest signal.

mod alu;
mod bits;
mod branch;
mod misc;
mod mov;
mod muldiv;
mod shift;
mod sse;
mod stack;
mod string;
mod x87;

use crate::decode::{DecodedInsn, OpMap};
use crate::error::Trap;
use crate::jit::OpFn;
use crate::machine::Machine;
use std::sync::Mutex;

/// Routes a decoded instruction to its handler.
pub fn op_for(insn: &DecodedInsn) -> Result<OpFn, Trap> {
    if insn.vex {
        return Err(Trap::InvalidOpcode);
    }
    match insn.map {
        OpMap::One => one_byte(insn),
        OpMap::Two => two_byte(insn),
        OpMap::Three38 | OpMap::Three3A => Err(Trap::InvalidOpcode),
    }
}

fn one_byte(insn: &DecodedInsn) -> Result<OpFn, Trap> {
    Ok(match insn.opcode {
        0x00..=0x3d if insn.opcode & 7 < 6 => alu::op_alu,
        0x40..=0x4f => alu::op_incdec_reg, // legacy modes only; REX eats these in long
        0x50..=0x57 => stack::op_push_reg,
        0x58..=0x5f => stack::op_pop_reg,
        0x63 => mov::op_movsxd,
        0x68 | 0x6a => stack::op_push_imm,
        0x69 | 0x6b => muldiv::op_imul_imm,
        0x70..=0x7f => branch::op_jcc,
        0x80 | 0x81 | 0x83 => alu::op_group1,
        0x84 | 0x85 => alu::op_test,
        0x86 | 0x87 => mov::op_xchg,
        0x88..=0x8b => mov::op_mov,
        0x8d => mov::op_lea,
        0x8f => stack::op_pop_rm,
        // 0x90 is NOP (and PAUSE) only without REX.B; with it, XCHG r8.
        0x90 if insn.rex & 1 == 0 => misc::op_nop,
        0x90..=0x97 => mov::op_xchg_ax,
        0x98 => alu::op_cbw,
        0x99 => alu::op_cwd,
        0x9b => misc::op_nop, // fwait
        0x9c => stack::op_pushf,
        0x9d => stack::op_popf,
        0x9e => misc::op_sahf,
        0x9f => misc::op_lahf,
        0xa0..=0xa3 => mov::op_mov_moffs,
        0xa4 | 0xa5 | 0xa6 | 0xa7 | 0xaa..=0xaf => string::op_string,
        0xa8 | 0xa9 => alu::op_test,
        0xb0..=0xbf => mov::op_mov_imm_reg,
        0xc0 | 0xc1 | 0xd0..=0xd3 => shift::op_group2,
        0xc2 | 0xc3 => branch::op_ret,
        0xc6 | 0xc7 => mov::op_mov_imm_rm,
        0xc8 => stack::op_enter,
        0xc9 => stack::op_leave,
        0xcc => misc::op_int3,
        0xd7 => mov::op_xlat,
        0xd8..=0xdf => x87::op_x87,
        0xe0..=0xe2 => branch::op_loop,
        0xe3 => branch::op_jcxz,
        0xe8 => branch::op_call,
        0xe9 | 0xeb => branch::op_jmp,
        0xf1 => misc::op_int1,
        0xf5 | 0xf8 | 0xf9 | 0xfc | 0xfd => misc::op_flagtoggle,
        0xf6 | 0xf7 => muldiv::op_group3,
        0xfe => alu::op_group4,
        0xff => misc::op_group5,
        _ => return Err(Trap::InvalidOpcode),
    })
}

fn two_byte(insn: &DecodedInsn) -> Result<OpFn, Trap> {
    Ok(match insn.opcode {
        0x05 => crate::syscall::op_syscall,
        0x0d | 0x18..=0x1f => misc::op_nop, // hint nops
        0x10 | 0x11 => sse::op_movu,
        0x12 | 0x13 | 0x16 | 0x17 => sse::op_movlh,
        0x28 | 0x29 => sse::op_movu, // aligned forms share the mover
        0x2a => sse::op_cvtsi2s,
        0x2c | 0x2d => sse::op_cvts2si,
        0x2e | 0x2f => sse::op_ucomis,
        0x31 => misc::op_rdtsc,
        0x40..=0x4f => mov::op_cmov,
        0x50 => sse::op_movmskps,
        0x51 => sse::op_scalar_arith,
        0x54..=0x57 => sse::op_bitwise,
        0x58 | 0x59 | 0x5c..=0x5f => sse::op_scalar_arith,
        0x5a => sse::op_cvts2s,
        0x60 | 0x61 | 0x62 | 0x6c => sse::op_punpckl,
        0x6e => sse::op_movd_in,
        0x6f => sse::op_movdq,
        0x70 => sse::op_pshufd,
        0x73 => sse::op_pshift_imm,
        0x74 | 0x75 | 0x76 => sse::op_pcmpeq,
        0x77 => misc::op_nop, // emms
        0x7e => sse::op_movd_out,
        0x7f => sse::op_movdq,
        0x80..=0x8f => branch::op_jcc,
        0x90..=0x9f => mov::op_setcc,
        0xa0 | 0xa1 | 0xa8 | 0xa9 => stack::op_pushpop_seg,
        0xa2 => misc::op_cpuid,
        0xa3 | 0xab | 0xb3 | 0xbb => bits::op_bt,
        0xa4 | 0xa5 | 0xac | 0xad => shift::op_shld_shrd,
        0xae => misc::op_group15,
        0xaf => muldiv::op_imul,
        0xb0 | 0xb1 => alu::op_cmpxchg,
        0xb6 | 0xb7 => mov::op_movzx,
        0xb8 => bits::op_popcnt,
        0xba => bits::op_bt_imm,
        0xbc => bits::op_bsf,
        0xbd => bits::op_bsr,
        0xbe | 0xbf => mov::op_movsx,
        0xc0 | 0xc1 => alu::op_xadd,
        0xc7 => alu::op_cmpxchg16b,
        0xc8..=0xcf => mov::op_bswap,
        0xd4 | 0xd6 | 0xdb | 0xdf | 0xeb | 0xef | 0xf8..=0xfe => sse::op_pint,
        0xd7 => sse::op_pmovmskb,
        _ => return Err(Trap::InvalidOpcode),
    })
}

/// Sign-extends an encoded immediate to the operand width. Z-form
/// immediates are stored at most 32 bits wide.
pub(crate) fn imm_z(insn: &DecodedInsn, width: usize) -> u64 {
    match width {
        8 => insn.imm as u32 as i32 as i64 as u64,
        4 => insn.imm as u32 as u64,
        2 => insn.imm & 0xffff,
        _ => insn.imm & 0xff,
    }
}

/// Sign-extends an imm8 to the operand width.
pub(crate) fn imm_b(insn: &DecodedInsn, width: usize) -> u64 {
    let v = insn.imm as u8 as i8 as i64 as u64;
    match width {
        8 => v,
        4 => v & 0xffff_ffff,
        2 => v & 0xffff,
        _ => v & 0xff,
    }
}

/// Serializes unaligned locked operations, which host atomics cannot
/// express.
static UNALIGNED_LOCK: Mutex<()> = Mutex::new(());

/// Performs a locked read-modify-write at `addr`, returning the old
/// value. Aligned accesses map onto host atomics; the x86 LOCK prefix
/// implies a full fence, so sequential consistency is used.
pub(crate) fn locked_rmw<F>(m: &mut Machine, addr: u64, width: usize, f: F) -> Result<u64, Trap>
where
    F: Fn(u64) -> u64,
{
    use std::sync::atomic::*;
    if addr & (width as u64 - 1) != 0 {
        let _guard = UNALIGNED_LOCK.lock().unwrap();
        let old = m.read_mem(addr, width)?;
        m.write_mem(addr, f(old), width)?;
        return Ok(old);
    }
    let ptr = m.host_ptr_w(addr, width)?;
    let old = unsafe {
        match width {
            1 => {
                let a = &*(ptr as *const AtomicU8);
                let mut cur = a.load(Ordering::SeqCst);
                loop {
                    match a.compare_exchange(cur, f(cur as u64) as u8, Ordering::SeqCst, Ordering::SeqCst) {
                        Ok(_) => break cur as u64,
                        Err(v) => cur = v,
                    }
                }
            }
            2 => {
                let a = &*(ptr as *const AtomicU16);
                let mut cur = a.load(Ordering::SeqCst);
                loop {
                    match a.compare_exchange(cur, f(cur as u64) as u16, Ordering::SeqCst, Ordering::SeqCst) {
                        Ok(_) => break cur as u64,
                        Err(v) => cur = v,
                    }
                }
            }
            4 => {
                let a = &*(ptr as *const AtomicU32);
                let mut cur = a.load(Ordering::SeqCst);
                loop {
                    match a.compare_exchange(cur, f(cur as u64) as u32, Ordering::SeqCst, Ordering::SeqCst) {
                        Ok(_) => break cur as u64,
                        Err(v) => cur = v,
                    }
                }
            }
            _ => {
                let a = &*(ptr as *const AtomicU64);
                let mut cur = a.load(Ordering::SeqCst);
                loop {
                    match a.compare_exchange(cur, f(cur), Ordering::SeqCst, Ordering::SeqCst) {
                        Ok(_) => break cur,
                        Err(v) => cur = v,
                    }
                }
            }
        }
    };
    m.last_write = Some((addr, width));
    Ok(old)
}
