//! String instructions and their REP loops.
//!
//! A REP loop checks for pending attention between iterations; when it
//! sees any, it rewinds IP to the instruction and reports an interrupt
//! so the boundary machinery runs, then the instruction resumes with
//! the partially advanced registers.

use crate::decode::{DecodedInsn, Rep};
use crate::error::Trap;
use crate::flags::{self, Rflags};
use crate::machine::{Machine, RAX, RCX, RDI, RSI};
use std::sync::atomic::Ordering;

/// 0xA4..=0xA7, 0xAA..=0xAF.
pub fn op_string(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    let width = if i.opcode & 1 == 0 { 1 } else { i.opsize() };
    let asz = i.addrsize();
    let rep = i.rep != Rep::None;

    loop {
        if rep && m.read_reg(i, RCX, asz) == 0 {
            return Ok(());
        }

        let delta = if m.flag(Rflags::DF) {
            (width as u64).wrapping_neg()
        } else {
            width as u64
        };

        let mut cmp_flags = None;
        match i.opcode & 0xfe {
            0xa4 => {
                // MOVS
                let v = m.read_mem(m.read_reg(i, RSI, asz), width)?;
                m.write_mem(m.read_reg(i, RDI, asz), v, width)?;
                bump(m, i, RSI, delta, asz);
                bump(m, i, RDI, delta, asz);
            }
            0xa6 => {
                // CMPS
                let a = m.read_mem(m.read_reg(i, RSI, asz), width)?;
                let b = m.read_mem(m.read_reg(i, RDI, asz), width)?;
                cmp_flags = Some(flags::sub(a, b, false, width).1);
                bump(m, i, RSI, delta, asz);
                bump(m, i, RDI, delta, asz);
            }
            0xaa => {
                // STOS
                let v = m.read_reg(i, RAX, width);
                m.write_mem(m.read_reg(i, RDI, asz), v, width)?;
                bump(m, i, RDI, delta, asz);
            }
            0xac => {
                // LODS
                let v = m.read_mem(m.read_reg(i, RSI, asz), width)?;
                m.write_reg(i, RAX, width, v);
                bump(m, i, RSI, delta, asz);
            }
            _ => {
                // SCAS
                let a = m.read_reg(i, RAX, width);
                let b = m.read_mem(m.read_reg(i, RDI, asz), width)?;
                cmp_flags = Some(flags::sub(a, b, false, width).1);
                bump(m, i, RDI, delta, asz);
            }
        }
        if let Some(f) = cmp_flags {
            m.set_arith_flags(f);
        }

        if !rep {
            return Ok(());
        }
        let count = m.read_reg(i, RCX, asz).wrapping_sub(1);
        m.write_reg(i, RCX, asz, count);

        // REPE/REPNE termination applies to the comparing forms.
        if cmp_flags.is_some() {
            let zf = m.flag(Rflags::ZF);
            match i.rep {
                Rep::Rep if !zf => return Ok(()),
                Rep::Repne if zf => return Ok(()),
                _ => {}
            }
        }

        if count != 0 && m.shared.attention.load(Ordering::Acquire) {
            // Resume here after the boundary work.
            return Err(Trap::Interrupted);
        }
    }
}

fn bump(m: &mut Machine, i: &DecodedInsn, reg: u8, delta: u64, asz: usize) {
    let v = m.read_reg(i, reg, asz).wrapping_add(delta);
    m.write_reg(i, reg, asz, v);
}
