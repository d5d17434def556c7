//! Shift and rotate group, plus the double-precision shifts.

use crate::decode::DecodedInsn;
use crate::error::Trap;
use crate::flags::{self, Rflags};
use crate::machine::{Machine, RCX};

/// 0xC0/0xC1/0xD0..=0xD3: group 2.
pub fn op_group2(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = if i.opcode & 1 == 0 { 1 } else { i.opsize() };
    let count_mask: u32 = if width == 8 { 63 } else { 31 };
    let count = match i.opcode {
        0xc0 | 0xc1 => i.imm as u32,
        0xd0 | 0xd1 => 1,
        _ => m.gpr(RCX) as u32,
    } & count_mask;

    let x = m.read_rm(i, width)?;
    if count == 0 {
        // Flags untouched, value untouched.
        return Ok(());
    }
    let old = m.flags;
    let (r, f) = match i.reg & 7 {
        0 => flags::rol(x, count, width, old),
        1 => flags::ror(x, count, width, old),
        2 => rcl(x, count, width, old),
        3 => rcr(x, count, width, old),
        4 | 6 => flags::shl(x, count, width),
        5 => flags::shr(x, count, width),
        _ => flags::sar(x, count, width),
    };
    m.write_rm(i, width, r)?;
    m.set_arith_flags(f);
    Ok(())
}

/// Rotate through carry: the carry flag is a ninth (17th, ...) bit.
fn rcl(x: u64, count: u32, width: usize, old: u64) -> (u64, u64) {
    let bits = width as u32 * 8;
    let c = count % (bits + 1);
    let cf_in = (old & Rflags::CF.bits() != 0) as u64;
    let m = if width == 8 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    };
    let x = x & m;
    let (r, cf_out) = if c == 0 {
        (x, cf_in)
    } else {
        let wide = (x as u128) | ((cf_in as u128) << bits);
        let rot = ((wide << c) | (wide >> (bits + 1 - c))) & ((1u128 << (bits + 1)) - 1);
        ((rot as u64) & m, ((rot >> bits) & 1) as u64)
    };
    let mut f = old & flags::ARITH & !(Rflags::CF.bits() | Rflags::OF.bits());
    if cf_out != 0 {
        f |= Rflags::CF.bits();
    }
    if (((r >> (bits - 1)) & 1) ^ cf_out) != 0 {
        f |= Rflags::OF.bits();
    }
    (r, f)
}

fn rcr(x: u64, count: u32, width: usize, old: u64) -> (u64, u64) {
    let bits = width as u32 * 8;
    let c = count % (bits + 1);
    let cf_in = (old & Rflags::CF.bits() != 0) as u64;
    let m = if width == 8 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    };
    let x = x & m;
    let (r, cf_out) = if c == 0 {
        (x, cf_in)
    } else {
        let wide = (x as u128) | ((cf_in as u128) << bits);
        let rot = ((wide >> c) | (wide << (bits + 1 - c))) & ((1u128 << (bits + 1)) - 1);
        ((rot as u64) & m, ((rot >> bits) & 1) as u64)
    };
    let mut f = old & flags::ARITH & !(Rflags::CF.bits() | Rflags::OF.bits());
    if cf_out != 0 {
        f |= Rflags::CF.bits();
    }
    let top = (r >> (bits - 1)) & 1;
    let next = (r >> (bits - 2)) & 1;
    if top ^ next != 0 {
        f |= Rflags::OF.bits();
    }
    (r, f)
}

/// 0F A4/A5 (SHLD) and 0F AC/AD (SHRD).
pub fn op_shld_shrd(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = i.opsize();
    let bits = width as u32 * 8;
    let count_mask: u32 = if width == 8 { 63 } else { 31 };
    let count = if i.opcode & 1 == 0 {
        i.imm as u32
    } else {
        m.gpr(RCX) as u32
    } & count_mask;
    if count == 0 {
        return Ok(());
    }
    let left = i.opcode < 0xac;
    let dst = m.read_rm(i, width)?;
    let src = m.read_reg(i, i.reg, width);
    if count > bits {
        // Result undefined; leave operands alone.
        return Ok(());
    }
    let mask = if width == 8 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    };
    let (r, cf) = if left {
        let wide = ((dst as u128) << bits) | (src as u128);
        let out = (wide << count >> bits) as u64 & mask;
        (out, (dst >> (bits - count)) & 1)
    } else {
        let wide = ((src as u128) << bits) | (dst as u128);
        let out = (wide >> count) as u64 & mask;
        (out, (dst >> (count - 1)) & 1)
    };
    let mut f = flags::logic(r, width);
    if cf != 0 {
        f |= Rflags::CF.bits();
    }
    if ((r ^ dst) >> (bits - 1)) & 1 != 0 {
        f |= Rflags::OF.bits();
    }
    m.write_rm(i, width, r)?;
    m.set_arith_flags(f);
    Ok(())
}
