//! Control transfer: jumps, calls, returns, loops.
//!
//! Handlers run with IP already advanced, so a relative target is just
//! `ip + disp` and a call pushes the current IP.

use crate::decode::DecodedInsn;
use crate::error::Trap;
use crate::machine::{Machine, RCX};

#[inline]
fn rel_target(m: &Machine, i: &DecodedInsn) -> u64 {
    let off = match i.opcode {
        0xeb | 0x70..=0x7f | 0xe0..=0xe3 => i.imm as u8 as i8 as i64,
        _ => match i.opsize() {
            2 => i.imm as u16 as i16 as i64,
            _ => i.imm as u32 as i32 as i64,
        },
    };
    let t = m.ip.wrapping_add(off as u64);
    if i.opsize() == 2 {
        t & 0xffff
    } else {
        t
    }
}

/// 0x70..=0x7F and 0F 80..=8F: Jcc.
pub fn op_jcc(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    if m.cond(i.opcode & 0xf) {
        m.ip = rel_target(m, i);
    }
    Ok(())
}

/// 0xE9/0xEB: JMP rel.
pub fn op_jmp(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    m.ip = rel_target(m, i);
    Ok(())
}

/// 0xE8: CALL rel.
pub fn op_call(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = i.opsize_default64();
    let ret = m.ip;
    let target = rel_target(m, i);
    m.push(ret, width)?;
    m.ip = target;
    Ok(())
}

/// 0xC2/0xC3: RET (and RET imm16).
pub fn op_ret(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = i.opsize_default64();
    let target = m.pop(width)?;
    if i.opcode == 0xc2 {
        let sp = m.gpr(crate::machine::RSP);
        m.set_gpr(crate::machine::RSP, sp.wrapping_add(i.imm & 0xffff));
    }
    m.ip = target;
    Ok(())
}

/// 0xE0..=0xE2: LOOPNE/LOOPE/LOOP, counting in the address-size register.
pub fn op_loop(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let asz = i.addrsize();
    let count = m.read_reg(i, RCX, asz).wrapping_sub(1);
    m.write_reg(i, RCX, asz, count);
    let zf = m.flag(crate::flags::Rflags::ZF);
    let go = count != 0
        && match i.opcode {
            0xe0 => !zf,
            0xe1 => zf,
            _ => true,
        };
    if go {
        m.ip = rel_target(m, i);
    }
    Ok(())
}

/// 0xE3: JCXZ/JECXZ/JRCXZ.
pub fn op_jcxz(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    if m.read_reg(i, RCX, i.addrsize()) == 0 {
        m.ip = rel_target(m, i);
    }
    Ok(())
}

/// The indirect transfers out of group 5 (0xFF /2 call, /4 jmp).
pub fn call_rm(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = i.opsize_default64();
    let target = m.read_rm(i, width)?;
    m.push(m.ip, width)?;
    m.ip = target;
    Ok(())
}

pub fn jmp_rm(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = i.opsize_default64();
    m.ip = m.read_rm(i, width)?;
    Ok(())
}
