//! The two-operand arithmetic block, the immediate groups, and the
//! compare-exchange family.

use super::{imm_b, imm_z, locked_rmw};
use crate::decode::DecodedInsn;
use crate::error::Trap;
use crate::flags::{self, Rflags};
use crate::machine::{Machine, RAX, RDX};

/// Performs one ALU operation, returning the result and flags.
fn alu(kind: u8, x: u64, y: u64, carry: bool, width: usize) -> (u64, u64) {
    match kind {
        0 => flags::add(x, y, false, width),                 // ADD
        1 => {
            let r = (x | y) & width_mask(width);
            (r, flags::logic(r, width))                      // OR
        }
        2 => flags::add(x, y, carry, width),                 // ADC
        3 => flags::sub(x, y, carry, width),                 // SBB
        4 => {
            let r = x & y & width_mask(width);
            (r, flags::logic(r, width))                      // AND
        }
        5 => flags::sub(x, y, false, width),                 // SUB
        6 => {
            let r = (x ^ y) & width_mask(width);
            (r, flags::logic(r, width))                      // XOR
        }
        _ => flags::sub(x, y, false, width),                 // CMP
    }
}

#[inline]
fn width_mask(width: usize) -> u64 {
    if width == 8 {
        u64::MAX
    } else {
        (1u64 << (width * 8)) - 1
    }
}

/// 0x00..=0x3D: the eight two-operand rows.
pub fn op_alu(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let kind = (i.opcode >> 3) & 7;
    let form = i.opcode & 7;
    let width = if form & 1 == 0 { 1 } else { i.opsize() };
    let carry = m.flag(Rflags::CF);
    let writes = kind != 7;

    match form {
        0 | 1 => {
            // r/m <- r/m op reg
            let src = m.read_reg(i, i.reg, width);
            if i.lock && i.mem.is_some() && writes {
                let addr = m.ea(i);
                let old = locked_rmw(m, addr, width, |x| alu(kind, x, src, carry, width).0)?;
                let (_, f) = alu(kind, old, src, carry, width);
                m.set_arith_flags(f);
            } else {
                let dst = m.read_rm(i, width)?;
                let (r, f) = alu(kind, dst, src, carry, width);
                if writes {
                    m.write_rm(i, width, r)?;
                }
                m.set_arith_flags(f);
            }
        }
        2 | 3 => {
            // reg <- reg op r/m
            let src = m.read_rm(i, width)?;
            let dst = m.read_reg(i, i.reg, width);
            let (r, f) = alu(kind, dst, src, carry, width);
            if writes {
                m.write_reg(i, i.reg, width, r);
            }
            m.set_arith_flags(f);
        }
        _ => {
            // AL/eAX <- op imm
            let src = imm_z(i, width);
            let dst = m.read_reg(i, RAX, width);
            let (r, f) = alu(kind, dst, src, carry, width);
            if writes {
                m.write_reg(i, RAX, width, r);
            }
            m.set_arith_flags(f);
        }
    }
    Ok(())
}

/// 0x80/0x81/0x83: group 1, r/m op imm.
pub fn op_group1(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let kind = i.reg & 7;
    let width = if i.opcode == 0x80 { 1 } else { i.opsize() };
    let src = if i.opcode == 0x83 {
        imm_b(i, width)
    } else {
        imm_z(i, width)
    };
    let carry = m.flag(Rflags::CF);
    let writes = kind != 7;
    if i.lock && i.mem.is_some() && writes {
        let addr = m.ea(i);
        let old = locked_rmw(m, addr, width, |x| alu(kind, x, src, carry, width).0)?;
        let (_, f) = alu(kind, old, src, carry, width);
        m.set_arith_flags(f);
        return Ok(());
    }
    let dst = m.read_rm(i, width)?;
    let (r, f) = alu(kind, dst, src, carry, width);
    if writes {
        m.write_rm(i, width, r)?;
    }
    m.set_arith_flags(f);
    Ok(())
}

/// 0x84/0x85 and 0xA8/0xA9: TEST.
pub fn op_test(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = if i.opcode & 1 == 0 { 1 } else { i.opsize() };
    let (x, y) = if i.opcode & 0xf0 == 0xa0 {
        (m.read_reg(i, RAX, width), imm_z(i, width))
    } else {
        (m.read_rm(i, width)?, m.read_reg(i, i.reg, width))
    };
    let r = x & y & width_mask(width);
    m.set_arith_flags(flags::logic(r, width));
    Ok(())
}

/// INC/DEC share their flag rule: CF is preserved.
fn incdec_flags(m: &mut Machine, f: u64) {
    let cf = m.flags & Rflags::CF.bits();
    m.set_arith_flags((f & !Rflags::CF.bits()) | cf);
}

/// 0x40..=0x4F in legacy modes.
pub fn op_incdec_reg(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = i.opsize();
    let reg = i.opcode & 7;
    let x = m.read_reg(i, reg, width);
    let (r, f) = if i.opcode < 0x48 {
        flags::add(x, 1, false, width)
    } else {
        flags::sub(x, 1, false, width)
    };
    m.write_reg(i, reg, width, r);
    incdec_flags(m, f);
    Ok(())
}

/// 0xFE: group 4, INC/DEC r/m8.
pub fn op_group4(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    incdec_rm(m, i, 1)
}

pub(super) fn incdec_rm(m: &mut Machine, i: &DecodedInsn, width: usize) -> Result<(), Trap> {
    let dec = i.reg & 7 == 1;
    if i.reg & 7 > 1 {
        return Err(Trap::InvalidOpcode);
    }
    if i.lock && i.mem.is_some() {
        let addr = m.ea(i);
        let old = locked_rmw(m, addr, width, |x| {
            if dec {
                x.wrapping_sub(1)
            } else {
                x.wrapping_add(1)
            }
        })?;
        let (_, f) = if dec {
            flags::sub(old, 1, false, width)
        } else {
            flags::add(old, 1, false, width)
        };
        incdec_flags(m, f);
        return Ok(());
    }
    let x = m.read_rm(i, width)?;
    let (r, f) = if dec {
        flags::sub(x, 1, false, width)
    } else {
        flags::add(x, 1, false, width)
    };
    m.write_rm(i, width, r)?;
    incdec_flags(m, f);
    Ok(())
}

/// 0x98: CBW/CWDE/CDQE.
pub fn op_cbw(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = i.opsize();
    let half = width / 2;
    let x = m.read_reg(i, RAX, half);
    let sx = ((x << (64 - half * 8)) as i64 >> (64 - half * 8)) as u64;
    m.write_reg(i, RAX, width, sx);
    Ok(())
}

/// 0x99: CWD/CDQ/CQO.
pub fn op_cwd(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = i.opsize();
    let x = m.read_reg(i, RAX, width);
    let neg = x & (1 << (width * 8 - 1)) != 0;
    m.write_reg(i, RDX, width, if neg { u64::MAX } else { 0 });
    Ok(())
}

/// 0F B0/B1: CMPXCHG.
pub fn op_cmpxchg(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = if i.opcode == 0xb0 { 1 } else { i.opsize() };
    let src = m.read_reg(i, i.reg, width);
    let acc = m.read_reg(i, RAX, width);
    let old = if i.lock && i.mem.is_some() {
        let addr = m.ea(i);
        locked_rmw(m, addr, width, |x| if x == acc { src } else { x })?
    } else {
        let old = m.read_rm(i, width)?;
        if old == acc {
            m.write_rm(i, width, src)?;
        }
        old
    };
    let (_, f) = flags::sub(acc, old, false, width);
    m.set_arith_flags(f);
    if old != acc {
        m.write_reg(i, RAX, width, old);
    }
    Ok(())
}

/// 0F C0/C1: XADD.
pub fn op_xadd(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = if i.opcode == 0xc0 { 1 } else { i.opsize() };
    let src = m.read_reg(i, i.reg, width);
    let old = if i.lock && i.mem.is_some() {
        let addr = m.ea(i);
        locked_rmw(m, addr, width, |x| {
            flags::add(x, src, false, width).0
        })?
    } else {
        let old = m.read_rm(i, width)?;
        let (r, _) = flags::add(old, src, false, width);
        m.write_rm(i, width, r)?;
        old
    };
    let (_, f) = flags::add(old, src, false, width);
    m.write_reg(i, i.reg, width, old);
    m.set_arith_flags(f);
    Ok(())
}

/// 0F C7 /1: CMPXCHG8B / CMPXCHG16B.
pub fn op_cmpxchg16b(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    if i.reg & 7 != 1 || i.mem.is_none() {
        return Err(Trap::InvalidOpcode);
    }
    let width = if i.rexw() { 8 } else { 4 };
    let addr = m.ea(i);
    // Read the pair; the comparison and swap happen under the unaligned
    // lock since hosts lack 128-bit compare-exchange portably.
    let _guard = super::UNALIGNED_LOCK.lock().unwrap();
    let lo = m.read_mem(addr, width)?;
    let hi = m.read_mem(addr + width as u64, width)?;
    let want_lo = m.read_reg(i, RAX, width);
    let want_hi = m.read_reg(i, RDX, width);
    if lo == want_lo && hi == want_hi {
        let new_lo = m.read_reg(i, 3, width); // RBX
        let new_hi = m.read_reg(i, 1, width); // RCX
        m.write_mem(addr, new_lo, width)?;
        m.write_mem(addr + width as u64, new_hi, width)?;
        m.set_flag(Rflags::ZF, true);
    } else {
        m.write_reg(i, RAX, width, lo);
        m.write_reg(i, RDX, width, hi);
        m.set_flag(Rflags::ZF, false);
    }
    Ok(())
}
