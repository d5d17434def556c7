//! Bit test, scan and population count.

use super::locked_rmw;
use crate::decode::{DecodedInsn, Rep};
use crate::error::Trap;
use crate::flags::Rflags;
use crate::machine::Machine;

fn bt_apply(kind: u8, v: u64, mask: u64) -> u64 {
    match kind {
        5 => v | mask,  // BTS
        6 => v & !mask, // BTR
        7 => v ^ mask,  // BTC
        _ => v,         // BT
    }
}

/// 0F A3/AB/B3/BB: BT/BTS/BTR/BTC r/m, reg.
pub fn op_bt(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = i.opsize();
    let bits = width as u64 * 8;
    let kind = (i.opcode >> 3) & 7;
    let offset = m.read_reg(i, i.reg, width) as i64;
    let (v, bit) = if i.mem.is_some() {
        // Memory form: the offset indexes beyond the operand.
        let base = m.ea(i);
        let word = (offset.div_euclid(bits as i64)) * width as i64;
        let addr = base.wrapping_add(word as u64);
        let bit = offset.rem_euclid(bits as i64) as u64;
        let mask = 1u64 << bit;
        if kind != 4 && i.lock {
            let old = locked_rmw(m, addr, width, |x| bt_apply(kind, x, mask))?;
            (old, bit)
        } else {
            let old = m.read_mem(addr, width)?;
            if kind != 4 {
                m.write_mem(addr, bt_apply(kind, old, mask), width)?;
            }
            (old, bit)
        }
    } else {
        let bit = (offset as u64) % bits;
        let old = m.read_reg(i, i.rm, width);
        if kind != 4 {
            m.write_reg(i, i.rm, width, bt_apply(kind, old, 1 << bit));
        }
        (old, bit)
    };
    m.set_flag(Rflags::CF, (v >> bit) & 1 != 0);
    Ok(())
}

/// 0F BA: group 8, BT-family with an immediate bit offset.
pub fn op_bt_imm(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = i.opsize();
    let bits = width as u64 * 8;
    let kind = i.reg & 7;
    if kind < 4 {
        return Err(Trap::InvalidOpcode);
    }
    let bit = (i.imm as u64) % bits;
    let mask = 1u64 << bit;
    let old = if i.mem.is_some() && kind != 4 && i.lock {
        let addr = m.ea(i);
        locked_rmw(m, addr, width, |x| bt_apply(kind, x, mask))?
    } else {
        let old = m.read_rm(i, width)?;
        if kind != 4 {
            m.write_rm(i, width, bt_apply(kind, old, mask))?;
        }
        old
    };
    m.set_flag(Rflags::CF, (old >> bit) & 1 != 0);
    Ok(())
}

/// F3 0F B8: POPCNT.
pub fn op_popcnt(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    if i.rep != Rep::Rep {
        return Err(Trap::InvalidOpcode);
    }
    let width = i.opsize();
    let v = m.read_rm(i, width)?;
    let n = v.count_ones() as u64;
    m.write_reg(i, i.reg, width, n);
    let mut f = 0;
    if n == 0 {
        f |= Rflags::ZF.bits();
    }
    m.set_arith_flags(f);
    Ok(())
}

/// 0F BC: BSF (and TZCNT under F3).
pub fn op_bsf(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = i.opsize();
    let bits = width as u32 * 8;
    let v = m.read_rm(i, width)?;
    if i.rep == Rep::Rep {
        // TZCNT: defined for zero input.
        let n = if v == 0 { bits as u64 } else { v.trailing_zeros() as u64 };
        m.write_reg(i, i.reg, width, n);
        let mut f = 0;
        if v == 0 {
            f |= Rflags::CF.bits();
        }
        if n == 0 {
            f |= Rflags::ZF.bits();
        }
        m.set_arith_flags(f);
        return Ok(());
    }
    if v == 0 {
        m.set_arith_flags(Rflags::ZF.bits());
    } else {
        m.write_reg(i, i.reg, width, v.trailing_zeros() as u64);
        m.set_arith_flags(0);
    }
    Ok(())
}

/// 0F BD: BSR (and LZCNT under F3).
pub fn op_bsr(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = i.opsize();
    let bits = width as u32 * 8;
    let v = m.read_rm(i, width)?;
    if i.rep == Rep::Rep {
        let n = if v == 0 {
            bits as u64
        } else {
            (bits - 1 - (63 - v.leading_zeros())) as u64
        };
        m.write_reg(i, i.reg, width, n);
        let mut f = 0;
        if v == 0 {
            f |= Rflags::CF.bits();
        }
        if n == 0 {
            f |= Rflags::ZF.bits();
        }
        m.set_arith_flags(f);
        return Ok(());
    }
    if v == 0 {
        m.set_arith_flags(Rflags::ZF.bits());
    } else {
        m.write_reg(i, i.reg, width, (63 - v.leading_zeros()) as u64);
        m.set_arith_flags(0);
    }
    Ok(())
}
