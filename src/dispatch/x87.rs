//! The x87 escape block (0xD8..=0xDF).
//!
//! Memory forms convert through f32/f64/integers; the 80-bit loads and
//! stores go through the same extended-precision conversion the signal
//! frames use. Exotic control ops decode to invalid-opcode.

use crate::decode::DecodedInsn;
use crate::error::Trap;
use crate::fpu::{SW_C0, SW_C2, SW_C3};
use crate::machine::{Machine, RAX};

fn arith(m: &mut Machine, kind: u8, x: f64, y: f64) -> Result<f64, Trap> {
    Ok(match kind {
        0 => x + y,
        1 => x * y,
        4 => x - y,
        5 => y - x,
        6 => m.fpu.div(x, y)?,
        _ => m.fpu.div(y, x)?,
    })
}

pub fn op_x87(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let esc = i.opcode - 0xd8;
    let modrm = i.modrm.unwrap_or(0);
    if i.mem.is_some() {
        mem_form(m, i, esc, i.reg & 7)
    } else {
        reg_form(m, esc, modrm)
    }
}

fn mem_form(m: &mut Machine, i: &DecodedInsn, esc: u8, op: u8) -> Result<(), Trap> {
    let addr = m.ea(i);
    m.fpu.dp = addr;
    match esc {
        0 => {
            // Single-precision arithmetic against ST(0).
            let v = f32::from_bits(m.read_mem(addr, 4)? as u32) as f64;
            let x = m.fpu.get(0);
            if op == 2 || op == 3 {
                m.fpu.compare(v);
                if op == 3 {
                    m.fpu.pop()?;
                }
            } else {
                let r = arith(m, op, x, v)?;
                m.fpu.set(0, r);
            }
        }
        1 => match op {
            0 => {
                let v = f32::from_bits(m.read_mem(addr, 4)? as u32) as f64;
                m.fpu.push(v)?;
            }
            2 | 3 => {
                let v = m.fpu.get(0) as f32;
                m.write_mem(addr, v.to_bits() as u64, 4)?;
                if op == 3 {
                    m.fpu.pop()?;
                }
            }
            5 => {
                m.fpu.cw = m.read_mem(addr, 2)? as u16;
            }
            7 => {
                m.write_mem(addr, m.fpu.cw as u64, 2)?;
            }
            _ => return Err(Trap::InvalidOpcode),
        },
        2 => {
            // 32-bit integer arithmetic.
            let v = m.read_mem(addr, 4)? as u32 as i32 as f64;
            let x = m.fpu.get(0);
            if op == 2 || op == 3 {
                m.fpu.compare(v);
                if op == 3 {
                    m.fpu.pop()?;
                }
            } else {
                let r = arith(m, op, x, v)?;
                m.fpu.set(0, r);
            }
        }
        3 => match op {
            0 => {
                let v = m.read_mem(addr, 4)? as u32 as i32 as f64;
                m.fpu.push(v)?;
            }
            2 | 3 => {
                let v = round_current(m, m.fpu.get(0)) as i32;
                m.write_mem(addr, v as u32 as u64, 4)?;
                if op == 3 {
                    m.fpu.pop()?;
                }
            }
            1 => {
                // FISTTP m32: truncate.
                let v = m.fpu.get(0) as i32;
                m.write_mem(addr, v as u32 as u64, 4)?;
                m.fpu.pop()?;
            }
            5 => {
                // FLD m80.
                let mut b = [0u8; 10];
                m.read_bytes(addr, &mut b)?;
                let mut full = [0u8; 16];
                full[..10].copy_from_slice(&b);
                m.fpu.push(crate::signals::f80_bytes_to_f64(&full))?;
            }
            7 => {
                // FSTP m80.
                let v = m.fpu.pop()?;
                let b = crate::signals::f64_to_f80_bytes(v);
                m.write_bytes(addr, &b[..10])?;
            }
            _ => return Err(Trap::InvalidOpcode),
        },
        4 => {
            // Double-precision arithmetic.
            let v = f64::from_bits(m.read_mem(addr, 8)?);
            let x = m.fpu.get(0);
            if op == 2 || op == 3 {
                m.fpu.compare(v);
                if op == 3 {
                    m.fpu.pop()?;
                }
            } else {
                let r = arith(m, op, x, v)?;
                m.fpu.set(0, r);
            }
        }
        5 => match op {
            0 => {
                let v = f64::from_bits(m.read_mem(addr, 8)?);
                m.fpu.push(v)?;
            }
            2 | 3 => {
                let v = m.fpu.get(0);
                m.write_mem(addr, v.to_bits(), 8)?;
                if op == 3 {
                    m.fpu.pop()?;
                }
            }
            _ => return Err(Trap::InvalidOpcode),
        },
        6 => {
            // 16-bit integer arithmetic.
            let v = m.read_mem(addr, 2)? as u16 as i16 as f64;
            let x = m.fpu.get(0);
            if op == 2 || op == 3 {
                m.fpu.compare(v);
                if op == 3 {
                    m.fpu.pop()?;
                }
            } else {
                let r = arith(m, op, x, v)?;
                m.fpu.set(0, r);
            }
        }
        _ => match op {
            0 => {
                let v = m.read_mem(addr, 2)? as u16 as i16 as f64;
                m.fpu.push(v)?;
            }
            2 | 3 => {
                let v = round_current(m, m.fpu.get(0)) as i16;
                m.write_mem(addr, v as u16 as u64, 2)?;
                if op == 3 {
                    m.fpu.pop()?;
                }
            }
            5 => {
                let v = m.read_mem(addr, 8)? as i64 as f64;
                m.fpu.push(v)?;
            }
            7 => {
                let v = round_current(m, m.fpu.get(0)) as i64;
                m.write_mem(addr, v as u64, 8)?;
                m.fpu.pop()?;
            }
            _ => return Err(Trap::InvalidOpcode),
        },
    }
    Ok(())
}

/// Rounds per the control word's RC field.
fn round_current(m: &Machine, v: f64) -> f64 {
    match (m.fpu.cw >> 10) & 3 {
        0 => {
            // Round to nearest even.
            let r = v.round();
            if (v - v.trunc()).abs() == 0.5 && r % 2.0 != 0.0 {
                r - v.signum()
            } else {
                r
            }
        }
        1 => v.floor(),
        2 => v.ceil(),
        _ => v.trunc(),
    }
}

fn reg_form(m: &mut Machine, esc: u8, modrm: u8) -> Result<(), Trap> {
    let st = (modrm & 7) as u16;
    let group = (modrm >> 3) & 7;
    match (esc, group, modrm) {
        (0, 0..=7, _) => {
            // Arithmetic ST(0), ST(i).
            let x = m.fpu.get(0);
            let y = m.fpu.get(st);
            if group == 2 || group == 3 {
                let _ = x;
                m.fpu.compare(y);
                if group == 3 {
                    m.fpu.pop()?;
                }
            } else {
                let r = arith(m, group, x, y)?;
                m.fpu.set(0, r);
            }
        }
        (1, 0, _) => {
            let v = m.fpu.get(st);
            m.fpu.push(v)?;
        }
        (1, 1, _) => m.fpu.xch(st),
        (1, _, 0xd0) => {} // FNOP
        (1, _, 0xe0) => {
            let v = m.fpu.get(0);
            m.fpu.set(0, -v);
        }
        (1, _, 0xe1) => {
            let v = m.fpu.get(0);
            m.fpu.set(0, v.abs());
        }
        (1, _, 0xe4) => m.fpu.compare(0.0), // FTST
        (1, _, 0xe5) => {
            // FXAM, reduced to the common classes.
            let v = m.fpu.get(0);
            m.fpu.sw &= !(SW_C0 | SW_C2 | SW_C3);
            if m.fpu.is_empty(0) {
                m.fpu.sw |= SW_C0 | SW_C3;
            } else if v.is_nan() {
                m.fpu.sw |= SW_C0;
            } else if v.is_infinite() {
                m.fpu.sw |= SW_C0 | SW_C2;
            } else if v == 0.0 {
                m.fpu.sw |= SW_C3;
            } else {
                m.fpu.sw |= SW_C2;
            }
        }
        (1, _, 0xe8) => m.fpu.push(1.0)?,
        (1, _, 0xe9) => m.fpu.push(std::f64::consts::LOG2_10)?,
        (1, _, 0xea) => m.fpu.push(std::f64::consts::LOG2_E)?,
        (1, _, 0xeb) => m.fpu.push(std::f64::consts::PI)?,
        (1, _, 0xec) => m.fpu.push(std::f64::consts::LOG10_2)?,
        (1, _, 0xed) => m.fpu.push(std::f64::consts::LN_2)?,
        (1, _, 0xee) => m.fpu.push(0.0)?,
        (1, _, 0xf0) => {
            let v = m.fpu.get(0);
            m.fpu.set(0, v.exp2() - 1.0); // F2XM1
        }
        (1, _, 0xf1) => {
            // FYL2X
            let x = m.fpu.pop()?;
            let y = m.fpu.get(0);
            m.fpu.set(0, y * x.log2());
        }
        (1, _, 0xf3) => {
            // FPATAN
            let x = m.fpu.pop()?;
            let y = m.fpu.get(0);
            m.fpu.set(0, y.atan2(x));
        }
        (1, _, 0xf8) => {
            // FPREM
            let x = m.fpu.get(0);
            let y = m.fpu.get(1);
            m.fpu.set(0, x % y);
            m.fpu.sw &= !SW_C2;
        }
        (1, _, 0xfa) => {
            let v = m.fpu.get(0);
            m.fpu.set(0, v.sqrt());
        }
        (1, _, 0xfc) => {
            let v = round_current(m, m.fpu.get(0));
            m.fpu.set(0, v); // FRNDINT
        }
        (1, _, 0xfd) => {
            // FSCALE
            let x = m.fpu.get(0);
            let y = m.fpu.get(1).trunc();
            m.fpu.set(0, x * y.exp2());
        }
        (1, _, 0xfe) => {
            let v = m.fpu.get(0);
            m.fpu.set(0, v.sin());
        }
        (1, _, 0xff) => {
            let v = m.fpu.get(0);
            m.fpu.set(0, v.cos());
        }
        (2, _, 0xe9) => {
            // FUCOMPP
            let y = m.fpu.get(1);
            m.fpu.compare(y);
            m.fpu.pop()?;
            m.fpu.pop()?;
        }
        (3, _, 0xe2) => m.fpu.sw &= 0x7f00, // FNCLEX
        (3, _, 0xe3) => m.fpu.init(),       // FNINIT
        (3, 5, _) | (3, 6, _) => {
            // FUCOMI/FCOMI: condition codes into RFLAGS.
            let y = m.fpu.get(st);
            compare_into_rflags(m, y);
        }
        (4, 0..=7, _) => {
            // Arithmetic ST(i), ST(0); subtraction directions swap.
            let x = m.fpu.get(st);
            let y = m.fpu.get(0);
            let group = swap_dir(group);
            if group == 2 || group == 3 {
                return Err(Trap::InvalidOpcode);
            }
            let r = arith(m, group, x, y)?;
            m.fpu.set(st, r);
        }
        (5, 0, _) => m.fpu.free(st),
        (5, 2, _) => {
            let v = m.fpu.get(0);
            m.fpu.set(st, v);
        }
        (5, 3, _) => {
            let v = m.fpu.get(0);
            m.fpu.set(st, v);
            m.fpu.pop()?;
        }
        (5, 4, _) | (5, 5, _) => {
            // FUCOM/FUCOMP
            let y = m.fpu.get(st);
            m.fpu.compare(y);
            if group == 5 {
                m.fpu.pop()?;
            }
        }
        (6, _, 0xd9) => {
            // FCOMPP
            let y = m.fpu.get(1);
            m.fpu.compare(y);
            m.fpu.pop()?;
            m.fpu.pop()?;
        }
        (6, 0 | 1 | 4..=7, _) => {
            // Arithmetic ST(i), ST(0) then pop.
            let x = m.fpu.get(st);
            let y = m.fpu.get(0);
            let group = swap_dir(group);
            let r = arith(m, group, x, y)?;
            m.fpu.set(st, r);
            m.fpu.pop()?;
        }
        (7, _, 0xe0) => {
            // FNSTSW AX.
            let sw = m.fpu.sw as u64;
            m.set_gpr(RAX, (m.gpr(RAX) & !0xffff) | (sw & 0xffff));
        }
        (7, 5, _) | (7, 6, _) => {
            // FUCOMIP/FCOMIP
            let y = m.fpu.get(st);
            compare_into_rflags(m, y);
            m.fpu.pop()?;
        }
        _ => return Err(Trap::InvalidOpcode),
    }
    Ok(())
}

/// FSUB/FSUBR and FDIV/FDIVR swap direction in the ST(i)-destination
/// encodings.
fn swap_dir(group: u8) -> u8 {
    match group {
        4 => 5,
        5 => 4,
        6 => 7,
        7 => 6,
        g => g,
    }
}

fn compare_into_rflags(m: &mut Machine, y: f64) {
    use crate::flags::Rflags;
    let x = m.fpu.get(0);
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
}
