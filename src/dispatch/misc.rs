//! Odds and ends: flag toggles, breakpoints, cpuid, the indirect group.

use crate::decode::DecodedInsn;
use crate::error::Trap;
use crate::flags::Rflags;
use crate::machine::{Machine, RAX, RBX, RCX, RDX};

pub fn op_nop(_m: &mut Machine, _i: &DecodedInsn) -> Result<(), Trap> {
    Ok(())
}

/// 0xCC: INT3. si_addr is the next instruction, like the hardware trap.
pub fn op_int3(m: &mut Machine, _i: &DecodedInsn) -> Result<(), Trap> {
    m.fault_addr = m.ip;
    Err(Trap::Debug)
}

/// 0xF1: INT1/ICEBP.
pub fn op_int1(m: &mut Machine, _i: &DecodedInsn) -> Result<(), Trap> {
    m.fault_addr = m.ip;
    Err(Trap::Debug)
}

/// 0xF5/0xF8/0xF9/0xFC/0xFD: CMC/CLC/STC/CLD/STD.
pub fn op_flagtoggle(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    match i.opcode {
        0xf5 => {
            let cf = m.flag(Rflags::CF);
            m.set_flag(Rflags::CF, !cf);
        }
        0xf8 => m.set_flag(Rflags::CF, false),
        0xf9 => m.set_flag(Rflags::CF, true),
        0xfc => m.set_flag(Rflags::DF, false),
        _ => m.set_flag(Rflags::DF, true),
    }
    Ok(())
}

/// 0x9E: SAHF.
pub fn op_sahf(m: &mut Machine, _i: &DecodedInsn) -> Result<(), Trap> {
    let ah = (m.gpr(RAX) >> 8) & 0xff;
    let keep = 0xd5; // SF ZF AF PF CF positions within the low byte
    m.flags = (m.flags & !keep) | (ah & keep) | Rflags::FIXED.bits();
    Ok(())
}

/// 0x9F: LAHF.
pub fn op_lahf(m: &mut Machine, _i: &DecodedInsn) -> Result<(), Trap> {
    let low = (m.flags & 0xd5) | Rflags::FIXED.bits();
    m.write_ah(low);
    Ok(())
}

/// 0F A2: CPUID. Reports a minimal long-mode-capable profile.
pub fn op_cpuid(m: &mut Machine, _i: &DecodedInsn) -> Result<(), Trap> {
    let leaf = m.gpr(RAX) as u32;
    let (a, b, c, d): (u32, u32, u32, u32) = match leaf {
        0 => (0x0000_0001, 0x756e_6547, 0x6c65_746e, 0x4965_6e69), // "GenuineIntel"
        1 => {
            // Family 6, SSE2 + CX8 + CMOV + FPU + TSC.
            let edx = (1 << 0) | (1 << 4) | (1 << 8) | (1 << 15) | (1 << 23) | (1 << 25) | (1 << 26);
            (0x0000_0600, 0, 0, edx)
        }
        0x8000_0000 => (0x8000_0001, 0, 0, 0),
        0x8000_0001 => (0, 0, 0, (1 << 29) | (1 << 11)), // long mode + syscall
        _ => (0, 0, 0, 0),
    };
    m.set_gpr(RAX, a as u64);
    m.set_gpr(RBX, b as u64);
    m.set_gpr(RCX, c as u64);
    m.set_gpr(RDX, d as u64);
    Ok(())
}

/// 0F 31: RDTSC.
pub fn op_rdtsc(m: &mut Machine, _i: &DecodedInsn) -> Result<(), Trap> {
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    m.set_gpr(RAX, t & 0xffff_ffff);
    m.set_gpr(RDX, t >> 32);
    Ok(())
}

/// 0xFF: group 5 (INC/DEC/CALL/JMP/PUSH r/m).
pub fn op_group5(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    match i.reg & 7 {
        0 | 1 => super::alu::incdec_rm(m, i, i.opsize()),
        2 => super::branch::call_rm(m, i),
        4 => super::branch::jmp_rm(m, i),
        6 => {
            let width = i.opsize_default64();
            let v = m.read_rm(i, width)?;
            m.push(v, width)
        }
        _ => Err(Trap::InvalidOpcode), // far forms
    }
}

/// 0F AE: group 15. Fences are ordering no-ops here; LDMXCSR and
/// STMXCSR move the SSE control word.
pub fn op_group15(m: &mut Machine, i: &DecodedInsn) -> Result<(), Trap> {
    if i.mem.is_none() {
        return match i.reg & 7 {
            5 | 6 | 7 => {
                std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
            _ => Err(Trap::InvalidOpcode),
        };
    }
    match i.reg & 7 {
        2 => {
            let addr = m.ea(i);
            m.mxcsr = m.read_mem(addr, 4)? as u32;
            Ok(())
        }
        3 => {
            let addr = m.ea(i);
            m.write_mem(addr, m.mxcsr as u64, 4)
        }
        _ => Err(Trap::InvalidOpcode),
    }
}
