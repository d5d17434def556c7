//! Multiply, divide, and unary group 3.

use super::{imm_b, imm_z};
use crate::decode::DecodedInsn;
use crate::error::Trap;
use crate::flags::{self, Rflags};
use crate::machine::{Machine, RAX, RDX};

fn sext(v: u64, width: usize) -> i64 {
    ((v << (64 - width * 8)) as i64) >> (64 - width * 8)
}

fn mask(width: usize) -> u64 {
    if width == 8 {
        u64::MAX
    } else {
        (1u64 << (width * 8)) - 1
    }
}

/// Signed multiply producing (low, overflowed).
fn imul2(x: u64, y: u64, width: usize) -> (u64, bool) {
    let r = (sext(x, width) as i128) * (sext(y, width) as i128);
    let low = (r as u64) & mask(width);
    let overflow = r != sext(low, width) as i128;
    (low, overflow)
}

/// 0x69/0x6B: IMUL reg, r/m, imm.
pub fn op_imul_imm(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = i.opsize();
    let x = m.read_rm(i, width)?;
    let y = if i.opcode == 0x6b {
        imm_b(i, width)
    } else {
        imm_z(i, width)
    };
    let (low, ovf) = imul2(x, y, width);
    m.write_reg(i, i.reg, width, low);
    m.set_arith_flags(flags::mul_flags(low, ovf, width));
    Ok(())
}

/// 0F AF: IMUL reg, r/m.
pub fn op_imul(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = i.opsize();
    let x = m.read_reg(i, i.reg, width);
    let y = m.read_rm(i, width)?;
    let (low, ovf) = imul2(x, y, width);
    m.write_reg(i, i.reg, width, low);
    m.set_arith_flags(flags::mul_flags(low, ovf, width));
    Ok(())
}

/// 0xF6/0xF7: group 3 (TEST/NOT/NEG/MUL/IMUL/DIV/IDIV).
pub fn op_group3(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = if i.opcode == 0xf6 { 1 } else { i.opsize() };
    match i.reg & 7 {
        0 | 1 => {
            let x = m.read_rm(i, width)?;
            let y = imm_z(i, width);
            let r = x & y & mask(width);
            m.set_arith_flags(flags::logic(r, width));
        }
        2 => {
            let x = m.read_rm(i, width)?;
            m.write_rm(i, width, !x & mask(width))?;
        }
        3 => {
            let x = m.read_rm(i, width)?;
            let (r, mut f) = flags::sub(0, x, false, width);
            // NEG: CF set unless the operand was zero.
            if x & mask(width) == 0 {
                f &= !Rflags::CF.bits();
            } else {
                f |= Rflags::CF.bits();
            }
            m.write_rm(i, width, r)?;
            m.set_arith_flags(f);
        }
        4 => {
            // MUL: unsigned widening into DX:AX.
            let x = m.read_reg(i, RAX, width) as u128;
            let y = m.read_rm(i, width)? as u128;
            let r = x * y;
            let low = (r as u64) & mask(width);
            let high = ((r >> (width * 8)) as u64) & mask(width);
            if width == 1 {
                m.write_reg(i, RAX, 2, r as u64 & 0xffff);
            } else {
                m.write_reg(i, RAX, width, low);
                m.write_reg(i, RDX, width, high);
            }
            m.set_arith_flags(flags::mul_flags(low, high != 0, width));
        }
        5 => {
            // IMUL: signed widening.
            let x = m.read_reg(i, RAX, width);
            let y = m.read_rm(i, width)?;
            let r = (sext(x, width) as i128) * (sext(y, width) as i128);
            let low = (r as u64) & mask(width);
            let ovf = r != sext(low, width) as i128;
            if width == 1 {
                m.write_reg(i, RAX, 2, r as u64 & 0xffff);
            } else {
                m.write_reg(i, RAX, width, low);
                m.write_reg(i, RDX, width, ((r >> (width * 8)) as u64) & mask(width));
            }
            m.set_arith_flags(flags::mul_flags(low, ovf, width));
        }
        6 => {
            // DIV: unsigned, divisor from r/m, dividend DX:AX.
            let divisor = m.read_rm(i, width)? as u128;
            if divisor == 0 {
                return Err(Trap::DivideError);
            }
            let dividend = if width == 1 {
                m.read_reg(i, RAX, 2) as u128
            } else {
                ((m.read_reg(i, RDX, width) as u128) << (width * 8))
                    | m.read_reg(i, RAX, width) as u128
            };
            let q = dividend / divisor;
            let r = dividend % divisor;
            if q > mask(width) as u128 {
                return Err(Trap::DivideError);
            }
            if width == 1 {
                m.write_reg(i, RAX, 1, q as u64);
                m.write_ah(r as u64);
            } else {
                m.write_reg(i, RAX, width, q as u64);
                m.write_reg(i, RDX, width, r as u64);
            }
        }
        _ => {
            // IDIV: signed.
            let divisor = sext(m.read_rm(i, width)?, width) as i128;
            if divisor == 0 {
                return Err(Trap::DivideError);
            }
            let dividend = if width == 1 {
                m.read_reg(i, RAX, 2) as u16 as i16 as i128
            } else {
                let hi = m.read_reg(i, RDX, width);
                let lo = m.read_reg(i, RAX, width);
                let raw = ((hi as u128) << (width * 8)) | lo as u128;
                let bits = width as u32 * 16;
                ((raw << (128 - bits)) as i128) >> (128 - bits)
            };
            if divisor == -1 && dividend == i128::MIN {
                return Err(Trap::DivideError);
            }
            let q = dividend / divisor;
            let r = dividend % divisor;
            let min = -(1i128 << (width * 8 - 1));
            let max = (1i128 << (width * 8 - 1)) - 1;
            if q < min || q > max {
                return Err(Trap::DivideError);
            }
            if width == 1 {
                m.write_reg(i, RAX, 1, q as u64);
                m.write_ah(r as u64);
            } else {
                m.write_reg(i, RAX, width, q as u64);
                m.write_reg(i, RDX, width, r as u64);
            }
        }
    }
    Ok(())
}
