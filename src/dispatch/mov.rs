//! Data movement: MOV forms, extensions, conditional moves, exchanges.

use super::imm_z;
use crate::decode::DecodedInsn;
use crate::error::Trap;
use crate::machine::{Machine, RAX, RBX};

/// 0x88..=0x8B: MOV between register and r/m.
pub fn op_mov(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = if i.opcode & 1 == 0 { 1 } else { i.opsize() };
    if i.opcode < 0x8a {
        let v = m.read_reg(i, i.reg, width);
        m.write_rm(i, width, v)?;
    } else {
        let v = m.read_rm(i, width)?;
        m.write_reg(i, i.reg, width, v);
    }
    Ok(())
}

/// 0xB0..=0xBF: MOV reg, imm.
pub fn op_mov_imm_reg(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let reg = (i.opcode & 7) | ((i.rex & 1) << 3);
    if i.opcode < 0xb8 {
        m.write_reg(i, reg, 1, i.imm);
    } else {
        m.write_reg(i, reg, i.opsize(), i.imm);
    }
    Ok(())
}

/// 0xC6/0xC7: MOV r/m, imm.
pub fn op_mov_imm_rm(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    if i.reg & 7 != 0 {
        return Err(Trap::InvalidOpcode);
    }
    let width = if i.opcode == 0xc6 { 1 } else { i.opsize() };
    m.write_rm(i, width, imm_z(i, width))
}

/// 0xA0..=0xA3: MOV between the accumulator and an absolute offset.
pub fn op_mov_moffs(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = if i.opcode & 1 == 0 { 1 } else { i.opsize() };
    let addr = i.imm;
    if i.opcode < 0xa2 {
        let v = m.read_mem(addr, width)?;
        m.write_reg(i, RAX, width, v);
    } else {
        let v = m.read_reg(i, RAX, width);
        m.write_mem(addr, v, width)?;
    }
    Ok(())
}

/// 0x8D: LEA.
pub fn op_lea(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    if i.mem.is_none() {
        return Err(Trap::InvalidOpcode);
    }
    let addr = m.ea(i);
    m.write_reg(i, i.reg, i.opsize(), addr);
    Ok(())
}

/// 0x63: MOVSXD.
pub fn op_movsxd(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let v = m.read_rm(i, 4)?;
    m.write_reg(i, i.reg, i.opsize(), v as u32 as i32 as i64 as u64);
    Ok(())
}

/// 0F B6/B7: MOVZX.
pub fn op_movzx(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let src_width = if i.opcode == 0xb6 { 1 } else { 2 };
    let v = m.read_rm(i, src_width)?;
    m.write_reg(i, i.reg, i.opsize(), v);
    Ok(())
}

/// 0F BE/BF: MOVSX.
pub fn op_movsx(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let src_width = if i.opcode == 0xbe { 1 } else { 2 };
    let v = m.read_rm(i, src_width)?;
    let sx = ((v << (64 - src_width * 8)) as i64 >> (64 - src_width * 8)) as u64;
    m.write_reg(i, i.reg, i.opsize(), sx);
    Ok(())
}

/// 0x86/0x87: XCHG with r/m. With a memory operand the exchange is
/// implicitly locked.
pub fn op_xchg(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = if i.opcode == 0x86 { 1 } else { i.opsize() };
    let v = m.read_reg(i, i.reg, width);
    if i.mem.is_some() {
        let addr = m.ea(i);
        let old = super::locked_rmw(m, addr, width, |_| v)?;
        m.write_reg(i, i.reg, width, old);
    } else {
        let old = m.read_reg(i, i.rm, width);
        m.write_reg(i, i.rm, width, v);
        m.write_reg(i, i.reg, width, old);
    }
    Ok(())
}

/// 0x91..=0x97: XCHG eAX, reg.
pub fn op_xchg_ax(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = i.opsize();
    let reg = (i.opcode & 7) | ((i.rex & 1) << 3);
    let a = m.read_reg(i, RAX, width);
    let b = m.read_reg(i, reg, width);
    m.write_reg(i, RAX, width, b);
    m.write_reg(i, reg, width, a);
    Ok(())
}

/// 0F 40..=4F: CMOVcc.
pub fn op_cmov(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = i.opsize();
    let v = m.read_rm(i, width)?;
    if m.cond(i.opcode & 0xf) {
        m.write_reg(i, i.reg, width, v);
    } else if width == 4 {
        // Even a false condition zero-extends the destination.
        let keep = m.read_reg(i, i.reg, 4);
        m.write_reg(i, i.reg, 4, keep);
    }
    Ok(())
}

/// 0F 90..=9F: SETcc.
pub fn op_setcc(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let v = m.cond(i.opcode & 0xf) as u64;
    m.write_rm(i, 1, v)
}

/// 0F C8..=CF: BSWAP.
pub fn op_bswap(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = i.opsize();
    let reg = (i.opcode & 7) | ((i.rex & 1) << 3);
    let v = m.read_reg(i, reg, width);
    let swapped = match width {
        8 => v.swap_bytes(),
        _ => (v as u32).swap_bytes() as u64,
    };
    m.write_reg(i, reg, width, swapped);
    Ok(())
}

/// 0xD7: XLAT.
pub fn op_xlat(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let base = m.gpr(RBX);
    let al = m.read_reg(i, RAX, 1);
    let v = m.read_mem(base.wrapping_add(al), 1)?;
    m.write_reg(i, RAX, 1, v);
    Ok(())
}
