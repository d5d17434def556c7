//! AT&T-syntax disassembly of decoded instructions.
//!
//! Coverage tracks what the dispatcher executes; anything else prints
//! as `(bad)`. Used by the decoder tests and the unhandled-fault dump.

use crate::decode::{DecodedInsn, MemRef, OpMap, Rep};

const R64: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];
const R32: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d", "r12d",
    "r13d", "r14d", "r15d",
];
const R16: [&str; 16] = [
    "ax", "cx", "dx", "bx", "sp", "bp", "si", "di", "r8w", "r9w", "r10w", "r11w", "r12w", "r13w",
    "r14w", "r15w",
];
const R8REX: [&str; 16] = [
    "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b", "r12b",
    "r13b", "r14b", "r15b",
];
const R8: [&str; 8] = ["al", "cl", "dl", "bl", "ah", "ch", "dh", "bh"];

fn reg_name(insn: &DecodedInsn, idx: u8, width: usize) -> String {
    let i = idx as usize & 15;
    let name = match width {
        1 => {
            if insn.has_rex() {
                R8REX[i]
            } else {
                R8[i & 7]
            }
        }
        2 => R16[i],
        4 => R32[i],
        _ => R64[i],
    };
    format!("%{}", name)
}

fn mem_name(insn: &DecodedInsn, mem: &MemRef) -> String {
    let mut out = String::new();
    if mem.rip_rel {
        return format!("{:#x}(%rip)", mem.disp);
    }
    if mem.disp != 0 || (mem.base.is_none() && mem.index.is_none()) {
        if mem.disp < 0 {
            out.push_str(&format!("-{:#x}", -mem.disp));
        } else {
            out.push_str(&format!("{:#x}", mem.disp));
        }
    }
    let addr_reg = |r: u8| -> &str {
        match insn.addrsize() {
            2 => R16[r as usize & 15],
            4 => R32[r as usize & 15],
            _ => R64[r as usize & 15],
        }
    };
    match (mem.base, mem.index) {
        (Some(b), Some(x)) => {
            out.push_str(&format!("(%{},%{},{})", addr_reg(b), addr_reg(x), 1 << mem.scale))
        }
        (Some(b), None) => out.push_str(&format!("(%{})", addr_reg(b))),
        (None, Some(x)) => out.push_str(&format!("(,%{},{})", addr_reg(x), 1 << mem.scale)),
        (None, None) => {}
    }
    out
}

fn rm_name(insn: &DecodedInsn, width: usize) -> String {
    match &insn.mem {
        Some(mem) => mem_name(insn, mem),
        None => reg_name(insn, insn.rm, width),
    }
}

const ALU: [&str; 8] = ["add", "or", "adc", "sbb", "and", "sub", "xor", "cmp"];
const SHIFT: [&str; 8] = ["rol", "ror", "rcl", "rcr", "shl", "shr", "shl", "sar"];
const CC: [&str; 16] = [
    "o", "no", "b", "ae", "e", "ne", "be", "a", "s", "ns", "p", "np", "l", "ge", "le", "g",
];

/// Renders one decoded instruction, given the address it was fetched
/// from (for relative branch targets).
pub fn disassemble(insn: &DecodedInsn, addr: u64) -> String {
    match insn.map {
        OpMap::One => dis_one(insn, addr),
        OpMap::Two => dis_two(insn, addr),
        _ => "(bad)".into(),
    }
}

fn width_of(insn: &DecodedInsn, byte_op: bool) -> usize {
    if byte_op {
        1
    } else {
        insn.opsize()
    }
}

fn branch_target(insn: &DecodedInsn, addr: u64, short: bool) -> u64 {
    let next = addr + insn.len as u64;
    let off = if short {
        insn.imm as u8 as i8 as i64
    } else {
        insn.imm as u32 as i32 as i64
    };
    next.wrapping_add(off as u64)
}

fn dis_one(insn: &DecodedInsn, addr: u64) -> String {
    let op = insn.opcode;
    match op {
        0x00..=0x3d if op & 7 < 6 => {
            let name = ALU[(op >> 3) as usize & 7];
            let w = width_of(insn, op & 1 == 0);
            match op & 7 {
                0 | 1 => format!("{} {},{}", name, reg_name(insn, insn.reg, w), rm_name(insn, w)),
                2 | 3 => format!("{} {},{}", name, rm_name(insn, w), reg_name(insn, insn.reg, w)),
                _ => format!("{} ${:#x},{}", name, insn.imm, reg_name(insn, 0, w)),
            }
        }
        0x50..=0x57 => format!("push {}", reg_name(insn, (op & 7) | ((insn.rex & 1) << 3), 8)),
        0x58..=0x5f => format!("pop {}", reg_name(insn, (op & 7) | ((insn.rex & 1) << 3), 8)),
        0x63 => format!(
            "movslq {},{}",
            rm_name(insn, 4),
            reg_name(insn, insn.reg, insn.opsize())
        ),
        0x68 | 0x6a => format!("push ${:#x}", insn.imm),
        0x70..=0x7f => format!("j{} {:#x}", CC[(op & 0xf) as usize], branch_target(insn, addr, true)),
        0x80 | 0x81 | 0x83 => {
            let w = width_of(insn, op == 0x80);
            format!(
                "{} ${:#x},{}",
                ALU[(insn.reg & 7) as usize],
                insn.imm,
                rm_name(insn, w)
            )
        }
        0x84 | 0x85 => {
            let w = width_of(insn, op == 0x84);
            format!("test {},{}", reg_name(insn, insn.reg, w), rm_name(insn, w))
        }
        0x86 | 0x87 => {
            let w = width_of(insn, op == 0x86);
            format!("xchg {},{}", reg_name(insn, insn.reg, w), rm_name(insn, w))
        }
        0x88..=0x8b => {
            let w = width_of(insn, op & 1 == 0);
            if op < 0x8a {
                format!("mov {},{}", reg_name(insn, insn.reg, w), rm_name(insn, w))
            } else {
                format!("mov {},{}", rm_name(insn, w), reg_name(insn, insn.reg, w))
            }
        }
        0x8d => format!(
            "lea {},{}",
            rm_name(insn, insn.opsize()),
            reg_name(insn, insn.reg, insn.opsize())
        ),
        0x8f => format!("pop {}", rm_name(insn, 8)),
        0x90 if insn.rep == Rep::Rep => "pause".into(),
        0x90 if !insn.has_rex() => "nop".into(),
        0x90..=0x97 => format!(
            "xchg {},{}",
            reg_name(insn, (op & 7) | ((insn.rex & 1) << 3), insn.opsize()),
            reg_name(insn, 0, insn.opsize())
        ),
        0x98 => match insn.opsize() {
            2 => "cbtw".into(),
            8 => "cltq".into(),
            _ => "cwtl".into(),
        },
        0x99 => match insn.opsize() {
            2 => "cwtd".into(),
            8 => "cqto".into(),
            _ => "cltd".into(),
        },
        0x9c => "pushf".into(),
        0x9d => "popf".into(),
        0x9e => "sahf".into(),
        0x9f => "lahf".into(),
        0xa0..=0xa3 => {
            let w = width_of(insn, op & 1 == 0);
            if op < 0xa2 {
                format!("mov {:#x},{}", insn.imm, reg_name(insn, 0, w))
            } else {
                format!("mov {},{:#x}", reg_name(insn, 0, w), insn.imm)
            }
        }
        0xa4 | 0xa5 => rep_name(insn, "movs"),
        0xa6 | 0xa7 => rep_name(insn, "cmps"),
        0xa8 | 0xa9 => format!(
            "test ${:#x},{}",
            insn.imm,
            reg_name(insn, 0, width_of(insn, op == 0xa8))
        ),
        0xaa | 0xab => rep_name(insn, "stos"),
        0xac | 0xad => rep_name(insn, "lods"),
        0xae | 0xaf => rep_name(insn, "scas"),
        0xb0..=0xb7 => format!(
            "mov ${:#x},{}",
            insn.imm,
            reg_name(insn, (op & 7) | ((insn.rex & 1) << 3), 1)
        ),
        0xb8..=0xbf => format!(
            "mov ${:#x},{}",
            insn.imm,
            reg_name(insn, (op & 7) | ((insn.rex & 1) << 3), insn.opsize())
        ),
        0xc0 | 0xc1 | 0xd0..=0xd3 => {
            let w = width_of(insn, op & 1 == 0);
            let name = SHIFT[(insn.reg & 7) as usize];
            match op {
                0xc0 | 0xc1 => format!("{} ${:#x},{}", name, insn.imm, rm_name(insn, w)),
                0xd0 | 0xd1 => format!("{} {}", name, rm_name(insn, w)),
                _ => format!("{} %cl,{}", name, rm_name(insn, w)),
            }
        }
        0xc2 => format!("ret ${:#x}", insn.imm),
        0xc3 => "ret".into(),
        0xc6 | 0xc7 => {
            let w = width_of(insn, op == 0xc6);
            format!("mov ${:#x},{}", insn.imm, rm_name(insn, w))
        }
        0xc9 => "leave".into(),
        0xcc => "int3".into(),
        0xcd => format!("int ${:#x}", insn.imm),
        0xd7 => "xlat".into(),
        0xe0 => format!("loopne {:#x}", branch_target(insn, addr, true)),
        0xe1 => format!("loope {:#x}", branch_target(insn, addr, true)),
        0xe2 => format!("loop {:#x}", branch_target(insn, addr, true)),
        0xe3 => format!("jrcxz {:#x}", branch_target(insn, addr, true)),
        0xe8 => format!("call {:#x}", branch_target(insn, addr, false)),
        0xe9 => format!("jmp {:#x}", branch_target(insn, addr, false)),
        0xeb => format!("jmp {:#x}", branch_target(insn, addr, true)),
        0xf1 => "int1".into(),
        0xf4 => "hlt".into(),
        0xf5 => "cmc".into(),
        0xf6 | 0xf7 => {
            let w = width_of(insn, op == 0xf6);
            match insn.reg & 7 {
                0 | 1 => format!("test ${:#x},{}", insn.imm, rm_name(insn, w)),
                2 => format!("not {}", rm_name(insn, w)),
                3 => format!("neg {}", rm_name(insn, w)),
                4 => format!("mul {}", rm_name(insn, w)),
                5 => format!("imul {}", rm_name(insn, w)),
                6 => format!("div {}", rm_name(insn, w)),
                _ => format!("idiv {}", rm_name(insn, w)),
            }
        }
        0xf8 => "clc".into(),
        0xf9 => "stc".into(),
        0xfc => "cld".into(),
        0xfd => "std".into(),
        0xfe | 0xff => match insn.reg & 7 {
            0 => format!("inc {}", rm_name(insn, width_of(insn, op == 0xfe))),
            1 => format!("dec {}", rm_name(insn, width_of(insn, op == 0xfe))),
            2 => format!("call *{}", rm_name(insn, 8)),
            4 => format!("jmp *{}", rm_name(insn, 8)),
            6 => format!("push {}", rm_name(insn, 8)),
            _ => "(bad)".into(),
        },
        _ => "(bad)".into(),
    }
}

fn rep_name(insn: &DecodedInsn, base: &str) -> String {
    let suffix = match (insn.opcode & 1, insn.opsize()) {
        (0, _) => "b",
        (_, 2) => "w",
        (_, 8) => "q",
        _ => "l",
    };
    match insn.rep {
        Rep::None => format!("{}{}", base, suffix),
        Rep::Rep => format!("rep {}{}", base, suffix),
        Rep::Repne => format!("repnz {}{}", base, suffix),
    }
}

fn dis_two(insn: &DecodedInsn, addr: u64) -> String {
    let op = insn.opcode;
    let w = insn.opsize();
    match op {
        0x05 => "syscall".into(),
        0x0b => "ud2".into(),
        0x1f => format!("nop {}", rm_name(insn, w)),
        0x31 => "rdtsc".into(),
        0x40..=0x4f => format!(
            "cmov{} {},{}",
            CC[(op & 0xf) as usize],
            rm_name(insn, w),
            reg_name(insn, insn.reg, w)
        ),
        0x80..=0x8f => format!("j{} {:#x}", CC[(op & 0xf) as usize], branch_target(insn, addr, false)),
        0x90..=0x9f => format!("set{} {}", CC[(op & 0xf) as usize], rm_name(insn, 1)),
        0xa2 => "cpuid".into(),
        0xa3 => format!("bt {},{}", reg_name(insn, insn.reg, w), rm_name(insn, w)),
        0xab => format!("bts {},{}", reg_name(insn, insn.reg, w), rm_name(insn, w)),
        0xaf => format!(
            "imul {},{}",
            rm_name(insn, w),
            reg_name(insn, insn.reg, w)
        ),
        0xb0 | 0xb1 => format!(
            "cmpxchg {},{}",
            reg_name(insn, insn.reg, width_of(insn, op == 0xb0)),
            rm_name(insn, width_of(insn, op == 0xb0))
        ),
        0xb6 => format!("movzbl {},{}", rm_name(insn, 1), reg_name(insn, insn.reg, w)),
        0xb7 => format!("movzwl {},{}", rm_name(insn, 2), reg_name(insn, insn.reg, w)),
        0xbe => format!("movsbl {},{}", rm_name(insn, 1), reg_name(insn, insn.reg, w)),
        0xbf => format!("movswl {},{}", rm_name(insn, 2), reg_name(insn, insn.reg, w)),
        0xc0 | 0xc1 => format!(
            "xadd {},{}",
            reg_name(insn, insn.reg, width_of(insn, op == 0xc0)),
            rm_name(insn, width_of(insn, op == 0xc0))
        ),
        0xc8..=0xcf => format!("bswap {}", reg_name(insn, (op & 7) | ((insn.rex & 1) << 3), w)),
        _ => "(bad)".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{decode, CpuMode};

    fn dis(bytes: &[u8], mode: CpuMode) -> String {
        disassemble(&decode(bytes, mode).unwrap(), 0x1000)
    }

    #[test]
    fn mode_sensitive_modrm() {
        assert_eq!(dis(&[0x8a, 0x1e, 0x0c, 0x32], CpuMode::Long), "mov (%rsi),%bl");
        assert_eq!(dis(&[0x8a, 0x1e, 0x0c, 0x32], CpuMode::Real), "mov 0x320c,%bl");
    }

    #[test]
    fn round_trip_preserves_decode() {
        // Decode, print, and re-decode a few encodings; the record must
        // agree with itself after the trip.
        let cases: &[&[u8]] = &[
            &[0x48, 0x89, 0xf8],
            &[0x8b, 0x04, 0x24],
            &[0x0f, 0x05],
            &[0x74, 0x10],
            &[0xb8, 1, 0, 0, 0],
        ];
        for c in cases {
            let a = decode(c, CpuMode::Long).unwrap();
            let b = decode(a.raw(), CpuMode::Long).unwrap();
            assert_eq!(a.opcode, b.opcode);
            assert_eq!(a.reg, b.reg);
            assert_eq!(a.rm, b.rm);
            assert_eq!(a.mem, b.mem);
            assert_eq!(a.imm, b.imm);
        }
    }

    #[test]
    fn common_spellings() {
        assert_eq!(dis(&[0x48, 0x89, 0xf8], CpuMode::Long), "mov %rdi,%rax");
        assert_eq!(dis(&[0x0f, 0x05], CpuMode::Long), "syscall");
        assert_eq!(dis(&[0xc3], CpuMode::Long), "ret");
        assert_eq!(dis(&[0x99], CpuMode::Long), "cltd");
        assert_eq!(dis(&[0x90], CpuMode::Long), "nop");
        assert_eq!(dis(&[0x55], CpuMode::Long), "push %rbp");
    }

    #[test]
    fn branch_targets_are_absolute() {
        // jmp rel8 +2 from 0x1000, length 2 -> 0x1004.
        assert_eq!(dis(&[0xeb, 0x02], CpuMode::Long), "jmp 0x1004");
    }
}
