//! Push/pop and frame instructions.

use super::{imm_b, imm_z};
use crate::decode::DecodedInsn;
use crate::error::Trap;
use crate::flags::{self, Rflags};
use crate::machine::{Machine, RBP, RSP};

/// 0x50..=0x57.
pub fn op_push_reg(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = i.opsize_default64();
    let reg = (i.opcode & 7) | ((i.rex & 1) << 3);
    let v = m.read_reg(i, reg, width);
    m.push(v, width)
}

/// 0x58..=0x5F.
pub fn op_pop_reg(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = i.opsize_default64();
    let reg = (i.opcode & 7) | ((i.rex & 1) << 3);
    let v = m.pop(width)?;
    m.write_reg(i, reg, width, v);
    Ok(())
}

/// 0x68/0x6A: push immediate.
pub fn op_push_imm(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = i.opsize_default64();
    let v = if i.opcode == 0x6a {
        imm_b(i, width)
    } else {
        imm_z(i, width)
    };
    m.push(v, width)
}

/// 0x8F /0: pop r/m.
pub fn op_pop_rm(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    if i.reg & 7 != 0 {
        return Err(Trap::InvalidOpcode);
    }
    let width = i.opsize_default64();
    let v = m.pop(width)?;
    m.write_rm(i, width, v)
}

/// 0x9C: PUSHF.
pub fn op_pushf(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = i.opsize_default64();
    // RF and VM never appear on the stack.
    let v = m.flags & !(Rflags::RF.bits() | Rflags::VM.bits());
    m.push(v, width)
}

/// 0x9D: POPF. Only the writable bits change.
pub fn op_popf(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = i.opsize_default64();
    let v = m.pop(width)?;
    m.flags = (m.flags & !flags::WRITABLE) | (v & flags::WRITABLE) | Rflags::FIXED.bits();
    Ok(())
}

/// 0xC8: ENTER imm16, imm8.
pub fn op_enter(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = i.opsize_default64();
    let alloc = i.imm & 0xffff;
    let level = (i.imm2 & 0x1f) as u64;
    let bp = m.gpr(RBP);
    m.push(bp, width)?;
    let frame = m.gpr(RSP);
    // Nested levels copy the enclosing frame pointers down.
    for n in 1..level {
        let src = bp.wrapping_sub(n * width as u64);
        let v = m.read_mem(src, width)?;
        m.push(v, width)?;
    }
    if level > 0 {
        m.push(frame, width)?;
    }
    m.set_gpr(RBP, frame);
    m.set_gpr(RSP, m.gpr(RSP).wrapping_sub(alloc));
    Ok(())
}

/// 0xC9: LEAVE.
pub fn op_leave(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = i.opsize_default64();
    m.set_gpr(RSP, m.gpr(RBP));
    let bp = m.pop(width)?;
    m.set_gpr(RBP, bp);
    Ok(())
}

/// 0F A0/A1/A8/A9: push/pop FS and GS.
pub fn op_pushpop_seg(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = i.opsize_default64();
    let seg = if i.opcode & 8 == 0 { 4 } else { 5 };
    if i.opcode & 1 == 0 {
        m.push(m.seg_sel[seg] as u64, width)
    } else {
        let v = m.pop(width)?;
        m.seg_sel[seg] = v as u16;
        Ok(())
    }
}
