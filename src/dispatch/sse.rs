//! The SSE/SSE2 subset compiled C code actually leans on: 128-bit moves,
//! bitwise ops, packed-integer compare/add/sub, the byte-mask extraction
//! that string routines use, and scalar float arithmetic.

use crate::decode::{DecodedInsn, Rep};
use crate::endian::{read_u16, read_u32, read_u64, write_u16, write_u32, write_u64};
use crate::error::Trap;
use crate::flags::Rflags;
use crate::machine::Machine;

type Xmm = [u8; 16];

fn read_xmm_rm(m: &mut Machine, i: &DecodedInsn, len: usize) -> Result<Xmm, Trap> {
    let mut v = [0u8; 16];
    if i.mem.is_some() {
        let addr = m.ea(i);
        m.read_bytes(addr, &mut v[..len])?;
        m.last_read = Some((addr, len));
    } else {
        v = m.xmm[i.rm as usize];
    }
    Ok(v)
}

fn write_xmm_rm(m: &mut Machine, i: &DecodedInsn, v: &Xmm, len: usize) -> Result<(), Trap> {
    if i.mem.is_some() {
        let addr = m.ea(i);
        m.write_bytes(addr, &v[..len])?;
        m.last_write = Some((addr, len));
    } else {
        // Register targets narrower than 16 bytes merge.
        m.xmm[i.rm as usize][..len].copy_from_slice(&v[..len]);
    }
    Ok(())
}

/// Scalar element width selected by the repeat prefix: F3 = f32, F2 =
/// f64, none = packed.
fn scalar_len(i: &DecodedInsn) -> Option<usize> {
    match i.rep {
        Rep::Rep => Some(4),
        Rep::Repne => Some(8),
        Rep::None => None,
    }
}

/// 0F 10/11 (and the aligned 28/29 forms): MOVUPS-family.
pub fn op_movu(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let store = i.opcode & 1 != 0;
    let len = if i.opcode >= 0x28 {
        16
    } else {
        scalar_len(i).unwrap_or(16)
    };
    if store {
        let v = m.xmm[i.reg as usize];
        write_xmm_rm(m, i, &v, len)
    } else {
        let v = read_xmm_rm(m, i, len)?;
        if len == 16 || i.mem.is_none() {
            // Full copy, or scalar register-to-register merge.
            m.xmm[i.reg as usize][..len].copy_from_slice(&v[..len]);
        } else {
            // Scalar load from memory zeroes the rest.
            let mut out = [0u8; 16];
            out[..len].copy_from_slice(&v[..len]);
            m.xmm[i.reg as usize] = out;
        }
        Ok(())
    }
}

/// 0F 12/13/16/17: MOVLPS/MOVHPS.
pub fn op_movlh(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let high = i.opcode & 4 != 0;
    let store = i.opcode & 1 != 0;
    let off = if high { 8 } else { 0 };
    if store {
        let mut v = [0u8; 16];
        v[..8].copy_from_slice(&m.xmm[i.reg as usize][off..off + 8]);
        write_xmm_rm(m, i, &v, 8)
    } else {
        let v = read_xmm_rm(m, i, 8)?;
        m.xmm[i.reg as usize][off..off + 8].copy_from_slice(&v[..8]);
        Ok(())
    }
}

/// 0F 6F/7F: MOVDQA/MOVDQU.
pub fn op_movdq(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    if i.opcode == 0x6f {
        let v = read_xmm_rm(m, i, 16)?;
        m.xmm[i.reg as usize] = v;
        Ok(())
    } else {
        let v = m.xmm[i.reg as usize];
        write_xmm_rm(m, i, &v, 16)
    }
}

/// 0F 6E: MOVD/MOVQ from a general register or memory.
pub fn op_movd_in(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = if i.rexw() { 8 } else { 4 };
    let v = m.read_rm(i, width)?;
    let mut out = [0u8; 16];
    write_u64(&mut out[..8], if width == 4 { v & 0xffff_ffff } else { v });
    m.xmm[i.reg as usize] = out;
    Ok(())
}

/// 0F 7E: MOVD/MOVQ out (66), or MOVQ xmm load (F3).
pub fn op_movd_out(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    if i.rep == Rep::Rep {
        let v = read_xmm_rm(m, i, 8)?;
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&v[..8]);
        m.xmm[i.reg as usize] = out;
        return Ok(());
    }
    let width = if i.rexw() { 8 } else { 4 };
    let v = read_u64(&m.xmm[i.reg as usize][..8]);
    m.write_rm(i, width, v)
}

/// 0F 54..=57: ANDPS/ANDNPS/ORPS/XORPS (and the PD forms).
pub fn op_bitwise(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let b = read_xmm_rm(m, i, 16)?;
    let a = m.xmm[i.reg as usize];
    let (al, ah) = (read_u64(&a[..8]), read_u64(&a[8..]));
    let (bl, bh) = (read_u64(&b[..8]), read_u64(&b[8..]));
    let (rl, rh) = match i.opcode {
        0x54 => (al & bl, ah & bh),
        0x55 => (!al & bl, !ah & bh),
        0x56 => (al | bl, ah | bh),
        _ => (al ^ bl, ah ^ bh),
    };
    let out = &mut m.xmm[i.reg as usize];
    write_u64(&mut out[..8], rl);
    write_u64(&mut out[8..], rh);
    Ok(())
}

fn lane_f32(v: &Xmm, n: usize) -> f32 {
    f32::from_bits(read_u32(&v[n * 4..]))
}

fn lane_f64(v: &Xmm, n: usize) -> f64 {
    f64::from_bits(read_u64(&v[n * 8..]))
}

fn scalar_apply(op: u8, x: f64, y: f64) -> f64 {
    match op {
        0x51 => y.sqrt(),
        0x58 => x + y,
        0x59 => x * y,
        0x5c => x - y,
        0x5d => {
            // MIN returns the second operand on ties and NaNs.
            if x < y {
                x
            } else {
                y
            }
        }
        0x5e => x / y,
        _ => {
            if x > y {
                x
            } else {
                y
            }
        }
    }
}

/// 0F 51/58/59/5C/5D/5E/5F: arithmetic, scalar and packed.
pub fn op_scalar_arith(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    match scalar_len(i) {
        Some(4) => {
            let b = read_xmm_rm(m, i, 4)?;
            let y = lane_f32(&b, 0) as f64;
            let x = lane_f32(&m.xmm[i.reg as usize], 0) as f64;
            let r = scalar_apply(i.opcode, x, y) as f32;
            write_u32(&mut m.xmm[i.reg as usize][..4], r.to_bits());
        }
        Some(_) => {
            let b = read_xmm_rm(m, i, 8)?;
            let y = lane_f64(&b, 0);
            let x = lane_f64(&m.xmm[i.reg as usize], 0);
            let r = scalar_apply(i.opcode, x, y);
            write_u64(&mut m.xmm[i.reg as usize][..8], r.to_bits());
        }
        None => {
            let b = read_xmm_rm(m, i, 16)?;
            if i.osz {
                // Packed double.
                for n in 0..2 {
                    let x = lane_f64(&m.xmm[i.reg as usize], n);
                    let y = lane_f64(&b, n);
                    let r = scalar_apply(i.opcode, x, y);
                    write_u64(&mut m.xmm[i.reg as usize][n * 8..], r.to_bits());
                }
            } else {
                for n in 0..4 {
                    let x = lane_f32(&m.xmm[i.reg as usize], n) as f64;
                    let y = lane_f32(&b, n) as f64;
                    let r = scalar_apply(i.opcode, x, y) as f32;
                    write_u32(&mut m.xmm[i.reg as usize][n * 4..], r.to_bits());
                }
            }
        }
    }
    Ok(())
}

/// 0F 2A: CVTSI2SS/SD.
pub fn op_cvtsi2s(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let src_width = if i.rexw() { 8 } else { 4 };
    let v = m.read_rm(i, src_width)?;
    let sv = if src_width == 4 {
        v as u32 as i32 as i64
    } else {
        v as i64
    };
    match i.rep {
        Rep::Rep => write_u32(&mut m.xmm[i.reg as usize][..4], (sv as f32).to_bits()),
        Rep::Repne => write_u64(&mut m.xmm[i.reg as usize][..8], (sv as f64).to_bits()),
        Rep::None => return Err(Trap::InvalidOpcode),
    }
    Ok(())
}

/// 0F 2C/2D: CVTT/CVT scalar float to integer.
pub fn op_cvts2si(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = if i.rexw() { 8 } else { 4 };
    let v = match i.rep {
        Rep::Rep => lane_f32(&read_xmm_rm(m, i, 4)?, 0) as f64,
        Rep::Repne => lane_f64(&read_xmm_rm(m, i, 8)?, 0),
        Rep::None => return Err(Trap::InvalidOpcode),
    };
    let v = if i.opcode == 0x2c { v.trunc() } else { v.round() };
    let out = if width == 4 {
        (v as i32) as u64 & 0xffff_ffff
    } else {
        v as i64 as u64
    };
    m.write_reg(i, i.reg, width, out);
    Ok(())
}

/// 0F 5A: CVTSS2SD and CVTSD2SS.
pub fn op_cvts2s(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    match i.rep {
        Rep::Rep => {
            let v = lane_f32(&read_xmm_rm(m, i, 4)?, 0) as f64;
            write_u64(&mut m.xmm[i.reg as usize][..8], v.to_bits());
        }
        Rep::Repne => {
            let v = lane_f64(&read_xmm_rm(m, i, 8)?, 0) as f32;
            write_u32(&mut m.xmm[i.reg as usize][..4], v.to_bits());
        }
        Rep::None => return Err(Trap::InvalidOpcode),
    }
    Ok(())
}

/// 0F 2E/2F: UCOMIS/COMIS into RFLAGS.
pub fn op_ucomis(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let (x, y) = if i.osz {
        let b = read_xmm_rm(m, i, 8)?;
        (lane_f64(&m.xmm[i.reg as usize], 0), lane_f64(&b, 0))
    } else {
        let b = read_xmm_rm(m, i, 4)?;
        (
            lane_f32(&m.xmm[i.reg as usize], 0) as f64,
            lane_f32(&b, 0) as f64,
        )
    };
    m.set_flag(Rflags::OF, false);
    m.set_flag(Rflags::AF, false);
    m.set_flag(Rflags::SF, false);
    if x.is_nan() || y.is_nan() {
        m.set_flag(Rflags::ZF, true);
        m.set_flag(Rflags::PF, true);
        m.set_flag(Rflags::CF, true);
    } else {
        m.set_flag(Rflags::PF, false);
        m.set_flag(Rflags::ZF, x == y);
        m.set_flag(Rflags::CF, x < y);
    }
    Ok(())
}

/// 0F 50: MOVMSKPS/PD.
pub fn op_movmskps(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    if i.mem.is_some() {
        return Err(Trap::InvalidOpcode);
    }
    let v = m.xmm[i.rm as usize];
    let mask = if i.osz {
        ((v[15] >> 7) as u64) << 1 | (v[7] >> 7) as u64
    } else {
        (0..4).fold(0u64, |acc, n| acc | (((v[n * 4 + 3] >> 7) as u64) << n))
    };
    m.write_reg(i, i.reg, i.opsize().max(4), mask);
    Ok(())
}

/// 0F 60/61/62/6C: PUNPCKL*.
pub fn op_punpckl(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let b = read_xmm_rm(m, i, 16)?;
    let a = m.xmm[i.reg as usize];
    let step = match i.opcode {
        0x60 => 1,
        0x61 => 2,
        0x62 => 4,
        _ => 8,
    };
    let mut out = [0u8; 16];
    let lanes = 8 / step;
    for n in 0..lanes {
        out[n * 2 * step..n * 2 * step + step].copy_from_slice(&a[n * step..(n + 1) * step]);
        out[n * 2 * step + step..(n + 1) * 2 * step].copy_from_slice(&b[n * step..(n + 1) * step]);
    }
    m.xmm[i.reg as usize] = out;
    Ok(())
}

/// 0F 70: PSHUFD (66), PSHUFHW (F3), PSHUFLW (F2).
pub fn op_pshufd(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let v = read_xmm_rm(m, i, 16)?;
    let sel = i.imm as usize;
    let mut out = v;
    match i.rep {
        Rep::None if i.osz => {
            for n in 0..4 {
                let src = (sel >> (n * 2)) & 3;
                let word = read_u32(&v[src * 4..]);
                write_u32(&mut out[n * 4..], word);
            }
        }
        Rep::Rep => {
            for n in 0..4 {
                let src = (sel >> (n * 2)) & 3;
                let word = read_u16(&v[8 + src * 2..]);
                write_u16(&mut out[8 + n * 2..], word);
            }
        }
        Rep::Repne => {
            for n in 0..4 {
                let src = (sel >> (n * 2)) & 3;
                let word = read_u16(&v[src * 2..]);
                write_u16(&mut out[n * 2..], word);
            }
        }
        _ => return Err(Trap::InvalidOpcode),
    }
    m.xmm[i.reg as usize] = out;
    Ok(())
}

/// 0F 73: the immediate qword/dqword shift group.
pub fn op_pshift_imm(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    if i.mem.is_some() {
        return Err(Trap::InvalidOpcode);
    }
    let n = i.imm as usize;
    let v = &mut m.xmm[i.rm as usize];
    match i.reg & 7 {
        2 => {
            // PSRLQ
            for half in 0..2 {
                let q = read_u64(&v[half * 8..]);
                write_u64(&mut v[half * 8..], if n >= 64 { 0 } else { q >> n });
            }
        }
        3 if i.osz => {
            // PSRLDQ: byte shift right.
            let mut out = [0u8; 16];
            if n < 16 {
                out[..16 - n].copy_from_slice(&v[n..]);
            }
            *v = out;
        }
        6 => {
            // PSLLQ
            for half in 0..2 {
                let q = read_u64(&v[half * 8..]);
                write_u64(&mut v[half * 8..], if n >= 64 { 0 } else { q << n });
            }
        }
        7 if i.osz => {
            // PSLLDQ: byte shift left.
            let mut out = [0u8; 16];
            if n < 16 {
                out[n..].copy_from_slice(&v[..16 - n]);
            }
            *v = out;
        }
        _ => return Err(Trap::InvalidOpcode),
    }
    Ok(())
}

/// 0F 74/75/76: PCMPEQB/W/D.
pub fn op_pcmpeq(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let b = read_xmm_rm(m, i, 16)?;
    let a = m.xmm[i.reg as usize];
    let step = match i.opcode {
        0x74 => 1,
        0x75 => 2,
        _ => 4,
    };
    let mut out = [0u8; 16];
    for n in (0..16).step_by(step) {
        let eq = a[n..n + step] == b[n..n + step];
        for byte in &mut out[n..n + step] {
            *byte = if eq { 0xff } else { 0 };
        }
    }
    m.xmm[i.reg as usize] = out;
    Ok(())
}

/// 0F D7: PMOVMSKB.
pub fn op_pmovmskb(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    if i.mem.is_some() {
        return Err(Trap::InvalidOpcode);
    }
    let v = m.xmm[i.rm as usize];
    let mask = (0..16).fold(0u64, |acc, n| acc | (((v[n] >> 7) as u64) << n));
    m.write_reg(i, i.reg, i.opsize().max(4), mask);
    Ok(())
}

/// Packed-integer binary ops sharing the lane loop, plus the MOVQ store
/// that lives at 0F D6.
pub fn op_pint(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    if i.opcode == 0xd6 {
        let mut v = [0u8; 16];
        v[..8].copy_from_slice(&m.xmm[i.reg as usize][..8]);
        return write_xmm_rm(m, i, &v, 8);
    }
    let b = read_xmm_rm(m, i, 16)?;
    let a = m.xmm[i.reg as usize];
    let mut out = [0u8; 16];
    let lane = |op: u8| -> usize {
        match op {
            0xf8 | 0xfc => 1,
            0xf9 | 0xfd => 2,
            0xfa | 0xfe => 4,
            _ => 8,
        }
    };
    match i.opcode {
        0xdb | 0xdf | 0xeb | 0xef => {
            let (al, ah) = (read_u64(&a[..8]), read_u64(&a[8..]));
            let (bl, bh) = (read_u64(&b[..8]), read_u64(&b[8..]));
            let (rl, rh) = match i.opcode {
                0xdb => (al & bl, ah & bh),
                0xdf => (!al & bl, !ah & bh),
                0xeb => (al | bl, ah | bh),
                _ => (al ^ bl, ah ^ bh),
            };
            write_u64(&mut out[..8], rl);
            write_u64(&mut out[8..], rh);
        }
        0xf8..=0xfb => {
            let step = lane(i.opcode);
            for n in (0..16).step_by(step) {
                let x = crate::endian::read_uw(&a[n..], step);
                let y = crate::endian::read_uw(&b[n..], step);
                crate::endian::write_uw(&mut out[n..], x.wrapping_sub(y), step);
            }
        }
        0xd4 | 0xfc..=0xfe => {
            let step = lane(i.opcode);
            for n in (0..16).step_by(step) {
                let x = crate::endian::read_uw(&a[n..], step);
                let y = crate::endian::read_uw(&b[n..], step);
                crate::endian::write_uw(&mut out[n..], x.wrapping_add(y), step);
            }
        }
        _ => return Err(Trap::InvalidOpcode),
    }
    m.xmm[i.reg as usize] = out;
    Ok(())
}
