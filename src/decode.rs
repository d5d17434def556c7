//! The x86 instruction-length decoder.
//!
//! Turns up to 15 raw bytes into a [`DecodedInsn`]: prefixes, REX/VEX,
//! opcode map and number, ModR/M, SIB, displacement and immediate. The
//! decoder never touches machine state and never advances the instruction
//! pointer; the dispatcher does that after the instruction retires.

use crate::tunables::MAX_INSN_LEN;

/// CPU operating mode as seen by the decoder.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CpuMode {
    /// 16-bit real mode.
    Real,
    /// 32-bit protected/compatibility mode.
    Legacy,
    /// 64-bit long mode.
    Long,
}

/// Opcode map the instruction was found in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpMap {
    /// Single-byte opcodes.
    One,
    /// 0x0F two-byte opcodes.
    Two,
    /// 0x0F 0x38 three-byte opcodes.
    Three38,
    /// 0x0F 0x3A three-byte opcodes.
    Three3A,
}

/// REP-family prefix.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Rep {
    None,
    /// 0xF3: REP / REPE.
    Rep,
    /// 0xF2: REPNE.
    Repne,
}

/// Segment override.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Seg {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
}

/// Decoded memory operand.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemRef {
    /// Base register index, if any.
    pub base: Option<u8>,
    /// Index register index, if any. Index 4 without REX.X is the
    /// implicit-zero register and decodes as `None`.
    pub index: Option<u8>,
    /// Scale as a shift amount (0..=3).
    pub scale: u8,
    /// RIP-relative (long mode, mod=00 rm=101).
    pub rip_rel: bool,
    /// Sign-extended displacement.
    pub disp: i64,
}

/// Why decoding failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecodeError {
    /// The encoding is not a valid instruction.
    InvalidEncoding,
    /// The instruction would exceed 15 bytes.
    TooLong,
    /// The buffer ended before the instruction did. Carries how many
    /// bytes were available; the fetcher uses it to fault at the right
    /// address.
    Truncated(usize),
}

/// One decoded instruction. Immutable once built; owned by the Machine's
/// scratch slot and overwritten on each fetch.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedInsn {
    /// Raw encoding.
    pub bytes: [u8; MAX_INSN_LEN],
    /// Total encoded length.
    pub len: u8,
    pub mode: CpuMode,
    pub map: OpMap,
    pub opcode: u8,
    pub rep: Rep,
    pub lock: bool,
    pub seg: Option<Seg>,
    /// 0x66 operand-size prefix seen.
    pub osz: bool,
    /// 0x67 address-size prefix seen.
    pub asz: bool,
    /// Raw REX byte (0x40..=0x4F), or 0 when absent.
    pub rex: u8,
    /// VEX/XOP encoded (dispatched as unsupported).
    pub vex: bool,
    /// Raw ModR/M byte, when the opcode takes one.
    pub modrm: Option<u8>,
    /// Register field of ModR/M extended by REX.R.
    pub reg: u8,
    /// r/m field extended by REX.B; meaningful when `mem` is `None`.
    pub rm: u8,
    /// Memory operand, when ModR/M encodes one.
    pub mem: Option<MemRef>,
    /// Sign-extended displacement (also inside `mem` when present).
    pub disp: i64,
    /// Immediate, zero-extended from its encoded width.
    pub imm: u64,
    /// Second immediate (ENTER's level byte).
    pub imm2: u64,
}

impl DecodedInsn {
    /// Effective operand size in bytes for the normal (32-bit default)
    /// opcode group.
    pub fn opsize(&self) -> usize {
        match self.mode {
            CpuMode::Long => {
                if self.rex & 0x08 != 0 {
                    8
                } else if self.osz {
                    2
                } else {
                    4
                }
            }
            CpuMode::Legacy => {
                if self.osz {
                    2
                } else {
                    4
                }
            }
            CpuMode::Real => {
                if self.osz {
                    4
                } else {
                    2
                }
            }
        }
    }

    /// Effective operand size for opcodes that default to 64-bit in long
    /// mode (pushes, pops, near calls and jumps).
    pub fn opsize_default64(&self) -> usize {
        match self.mode {
            CpuMode::Long => {
                if self.osz {
                    2
                } else {
                    8
                }
            }
            _ => self.opsize(),
        }
    }

    /// Effective address size in bytes.
    pub fn addrsize(&self) -> usize {
        match self.mode {
            CpuMode::Long => {
                if self.asz {
                    4
                } else {
                    8
                }
            }
            CpuMode::Legacy => {
                if self.asz {
                    2
                } else {
                    4
                }
            }
            CpuMode::Real => {
                if self.asz {
                    4
                } else {
                    2
                }
            }
        }
    }

    /// Whether a REX prefix was present (changes byte-register naming).
    #[inline]
    pub fn has_rex(&self) -> bool {
        self.rex != 0
    }

    /// REX.W.
    #[inline]
    pub fn rexw(&self) -> bool {
        self.rex & 0x08 != 0
    }

    /// ModR/M mod field.
    #[inline]
    pub fn modbits(&self) -> u8 {
        self.modrm.map_or(0, |m| m >> 6)
    }

    /// The encoded bytes as a slice.
    pub fn raw(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

/// What immediate an opcode carries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ImmKind {
    None,
    /// 8-bit.
    B,
    /// 16-bit.
    W,
    /// 16 or 32 per operand size.
    Z,
    /// 16, 32 or 64 per operand size (mov r64, imm64).
    V,
    /// Address-size-wide offset (the A0-A3 moffs forms).
    P,
    /// ENTER: 16-bit then 8-bit.
    Wb,
}

fn one_byte_has_modrm(op: u8, mode: CpuMode) -> bool {
    match op {
        // The ALU block: the first four of every eight-opcode row.
        0x00..=0x3f if op & 7 < 4 => true,
        0x62 => mode != CpuMode::Long, // BOUND
        0x63 => true,                  // MOVSXD / ARPL
        0x69 | 0x6b => true,
        0x80..=0x83 => true,
        0x84..=0x8f => true,
        0xc0 | 0xc1 | 0xc6 | 0xc7 => true,
        0xc4 | 0xc5 => mode != CpuMode::Long, // LES/LDS when not VEX
        0xd0..=0xd3 => true,
        0xd8..=0xdf => true, // x87
        0xf6 | 0xf7 | 0xfe | 0xff => true,
        _ => false,
    }
}

fn two_byte_has_modrm(op: u8) -> bool {
    !matches!(
        op,
        0x05 | 0x06
            | 0x07
            | 0x08
            | 0x09
            | 0x0b
            | 0x0e
            | 0x30..=0x37
            | 0x77
            | 0x80..=0x8f
            | 0xa0
            | 0xa1
            | 0xa2
            | 0xa8
            | 0xa9
            | 0xaa
            | 0xc8..=0xcf
    )
}

fn one_byte_imm(op: u8, modrm_reg: u8) -> ImmKind {
    match op {
        0x04 | 0x0c | 0x14 | 0x1c | 0x24 | 0x2c | 0x34 | 0x3c => ImmKind::B,
        0x05 | 0x0d | 0x15 | 0x1d | 0x25 | 0x2d | 0x35 | 0x3d => ImmKind::Z,
        0x68 => ImmKind::Z,
        0x69 => ImmKind::Z,
        0x6a | 0x6b => ImmKind::B,
        0x70..=0x7f => ImmKind::B,
        0x80 | 0x82 | 0x83 => ImmKind::B,
        0x81 => ImmKind::Z,
        0x9a => ImmKind::None, // far call: rejected in long mode before this
        0xa0..=0xa3 => ImmKind::P,
        0xa8 => ImmKind::B,
        0xa9 => ImmKind::Z,
        0xb0..=0xb7 => ImmKind::B,
        0xb8..=0xbf => ImmKind::V,
        0xc0 | 0xc1 => ImmKind::B,
        0xc2 => ImmKind::W,
        0xc6 => ImmKind::B,
        0xc7 => ImmKind::Z,
        0xc8 => ImmKind::Wb,
        0xca => ImmKind::W,
        0xcd => ImmKind::B,
        0xd4 | 0xd5 => ImmKind::B,
        0xe0..=0xe7 => ImmKind::B,
        0xe8 | 0xe9 => ImmKind::Z,
        0xeb => ImmKind::B,
        0xf6 if modrm_reg < 2 => ImmKind::B,
        0xf7 if modrm_reg < 2 => ImmKind::Z,
        _ => ImmKind::None,
    }
}

fn two_byte_imm(op: u8) -> ImmKind {
    match op {
        0x70..=0x73 => ImmKind::B,
        0x80..=0x8f => ImmKind::Z,
        0xa4 | 0xac => ImmKind::B,
        0xba => ImmKind::B,
        0xc2 | 0xc4 | 0xc5 | 0xc6 => ImmKind::B,
        _ => ImmKind::None,
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self) -> Result<u8, DecodeError> {
        if self.pos >= MAX_INSN_LEN {
            return Err(DecodeError::TooLong);
        }
        let b = *self.buf.get(self.pos).ok_or(DecodeError::Truncated(self.buf.len()))?;
        self.pos += 1;
        Ok(b)
    }

    fn take_n(&mut self, n: usize) -> Result<u64, DecodeError> {
        let mut v: u64 = 0;
        for i in 0..n {
            v |= (self.take()? as u64) << (8 * i);
        }
        Ok(v)
    }
}

fn sign_extend(value: u64, bytes: usize) -> i64 {
    let shift = 64 - 8 * bytes as u32;
    ((value << shift) as i64) >> shift
}

/// Decodes one instruction from `buf` in the given mode.
pub fn decode(buf: &[u8], mode: CpuMode) -> Result<DecodedInsn, DecodeError> {
    let mut cur = Cursor { buf, pos: 0 };
    let mut rep = Rep::None;
    let mut lock = false;
    let mut seg = None;
    let mut osz = false;
    let mut asz = false;
    let mut rex = 0u8;
    let mut vex = false;

    // Legacy prefixes, then (long mode) an optional REX that must sit
    // immediately before the opcode: a later legacy prefix cancels it.
    let mut op = loop {
        let b = cur.take()?;
        match b {
            0x66 => {
                osz = true;
                rex = 0;
            }
            0x67 => {
                asz = true;
                rex = 0;
            }
            0xf0 => {
                lock = true;
                rex = 0;
            }
            0xf2 => {
                rep = Rep::Repne;
                rex = 0;
            }
            0xf3 => {
                rep = Rep::Rep;
                rex = 0;
            }
            0x26 => {
                seg = Some(Seg::Es);
                rex = 0;
            }
            0x2e => {
                seg = Some(Seg::Cs);
                rex = 0;
            }
            0x36 => {
                seg = Some(Seg::Ss);
                rex = 0;
            }
            0x3e => {
                seg = Some(Seg::Ds);
                rex = 0;
            }
            0x64 => {
                seg = Some(Seg::Fs);
                rex = 0;
            }
            0x65 => {
                seg = Some(Seg::Gs);
                rex = 0;
            }
            0x40..=0x4f if mode == CpuMode::Long => {
                rex = b;
            }
            _ => break b,
        }
    };

    let mut map = OpMap::One;

    // VEX and XOP. In legacy modes 0xC4/0xC5 only escape when the next
    // byte's top two bits are 11 (otherwise they are LES/LDS).
    if (op == 0xc4 || op == 0xc5)
        && (mode == CpuMode::Long
            || cur.buf.get(cur.pos).map_or(false, |b| b >> 6 == 3))
    {
        vex = true;
        if op == 0xc5 {
            let b = cur.take()?;
            if b & 0x80 == 0 {
                rex |= 0x44; // inverted R
            } else {
                rex |= 0x40;
            }
            map = OpMap::Two;
        } else {
            let b1 = cur.take()?;
            let b2 = cur.take()?;
            rex = 0x40
                | (if b1 & 0x80 == 0 { 4 } else { 0 })
                | (if b1 & 0x40 == 0 { 2 } else { 0 })
                | (if b1 & 0x20 == 0 { 1 } else { 0 })
                | (if b2 & 0x80 != 0 { 8 } else { 0 });
            map = match b1 & 0x1f {
                1 => OpMap::Two,
                2 => OpMap::Three38,
                3 => OpMap::Three3A,
                _ => return Err(DecodeError::InvalidEncoding),
            };
            match b2 & 3 {
                1 => osz = true,
                2 => rep = Rep::Rep,
                3 => rep = Rep::Repne,
                _ => {}
            }
        }
        op = cur.take()?;
    } else if op == 0x0f {
        op = cur.take()?;
        map = match op {
            0x38 => {
                op = cur.take()?;
                OpMap::Three38
            }
            0x3a => {
                op = cur.take()?;
                OpMap::Three3A
            }
            _ => OpMap::Two,
        };
    }

    // Opcodes that only exist outside long mode.
    if mode == CpuMode::Long
        && map == OpMap::One
        && matches!(
            op,
            0x06 | 0x07
                | 0x0e
                | 0x16
                | 0x17
                | 0x1e
                | 0x1f
                | 0x27
                | 0x2f
                | 0x37
                | 0x3f
                | 0x60
                | 0x61
                | 0x62
                | 0x82
                | 0x9a
                | 0xce
                | 0xd4
                | 0xd5
                | 0xd6
                | 0xea
        )
    {
        return Err(DecodeError::InvalidEncoding);
    }

    let has_modrm = match map {
        OpMap::One => one_byte_has_modrm(op, mode),
        OpMap::Two => two_byte_has_modrm(op),
        OpMap::Three38 | OpMap::Three3A => true,
    } || vex;

    let mut modrm = None;
    let mut reg = (rex & 4) << 1; // REX.R << 3
    let mut rm = 0;
    let mut mem = None;
    let mut disp: i64 = 0;

    // Effective address size, in bytes.
    let asize = match mode {
        CpuMode::Long => {
            if asz {
                4
            } else {
                8
            }
        }
        CpuMode::Legacy => {
            if asz {
                2
            } else {
                4
            }
        }
        CpuMode::Real => {
            if asz {
                4
            } else {
                2
            }
        }
    };

    if has_modrm {
        let m = cur.take()?;
        modrm = Some(m);
        reg = ((m >> 3) & 7) | ((rex & 4) << 1);
        let modf = m >> 6;
        let rmf = m & 7;
        if modf == 3 {
            rm = rmf | ((rex & 1) << 3);
        } else if asize == 2 {
            // 16-bit addressing table.
            const BASES: [(Option<u8>, Option<u8>); 8] = [
                (Some(3), Some(6)), // BX+SI
                (Some(3), Some(7)), // BX+DI
                (Some(5), Some(6)), // BP+SI
                (Some(5), Some(7)), // BP+DI
                (Some(6), None),    // SI
                (Some(7), None),    // DI
                (Some(5), None),    // BP (or disp16 when mod=0)
                (Some(3), None),    // BX
            ];
            let (mut base, index) = BASES[rmf as usize];
            let dsize = match modf {
                0 if rmf == 6 => {
                    base = None;
                    2
                }
                0 => 0,
                1 => 1,
                _ => 2,
            };
            if dsize > 0 {
                disp = sign_extend(cur.take_n(dsize)?, dsize);
            }
            mem = Some(MemRef {
                base,
                index,
                scale: 0,
                rip_rel: false,
                disp,
            });
        } else {
            let mut base = Some(rmf | ((rex & 1) << 3));
            let mut index = None;
            let mut scale = 0;
            let mut rip_rel = false;
            let mut dsize = match modf {
                0 => 0,
                1 => 1,
                _ => 4,
            };
            if rmf == 4 {
                let s = cur.take()?;
                scale = s >> 6;
                let idx = ((s >> 3) & 7) | ((rex & 2) << 2);
                // Index 4 with no REX.X is the implicit-zero register.
                index = if idx == 4 { None } else { Some(idx) };
                let b = (s & 7) | ((rex & 1) << 3);
                if s & 7 == 5 && modf == 0 {
                    base = None;
                    dsize = 4;
                } else {
                    base = Some(b);
                }
            } else if rmf == 5 && modf == 0 {
                base = None;
                dsize = 4;
                rip_rel = mode == CpuMode::Long;
            }
            if dsize > 0 {
                disp = sign_extend(cur.take_n(dsize)?, dsize);
            }
            mem = Some(MemRef {
                base,
                index,
                scale,
                rip_rel,
                disp,
            });
        }
    }

    // Immediate.
    let osize = match mode {
        CpuMode::Long => {
            if rex & 8 != 0 {
                8
            } else if osz {
                2
            } else {
                4
            }
        }
        CpuMode::Legacy => {
            if osz {
                2
            } else {
                4
            }
        }
        CpuMode::Real => {
            if osz {
                4
            } else {
                2
            }
        }
    };
    let ikind = if vex {
        if map == OpMap::Three3A {
            ImmKind::B
        } else {
            ImmKind::None
        }
    } else {
        match map {
            OpMap::One => one_byte_imm(op, reg & 7),
            OpMap::Two => two_byte_imm(op),
            OpMap::Three38 => ImmKind::None,
            OpMap::Three3A => ImmKind::B,
        }
    };
    let mut imm = 0u64;
    let mut imm2 = 0u64;
    match ikind {
        ImmKind::None => {}
        ImmKind::B => imm = cur.take_n(1)?,
        ImmKind::W => imm = cur.take_n(2)?,
        ImmKind::Z => imm = cur.take_n(osize.min(4))?,
        ImmKind::V => imm = cur.take_n(osize)?,
        ImmKind::P => imm = cur.take_n(asize)?,
        ImmKind::Wb => {
            imm = cur.take_n(2)?;
            imm2 = cur.take_n(1)?;
        }
    }

    let len = cur.pos;
    let mut bytes = [0u8; MAX_INSN_LEN];
    bytes[..len].copy_from_slice(&buf[..len]);

    Ok(DecodedInsn {
        bytes,
        len: len as u8,
        mode,
        map,
        opcode: op,
        rep,
        lock,
        seg,
        osz,
        asz,
        rex,
        vex,
        modrm,
        reg,
        rm,
        mem,
        disp,
        imm,
        imm2,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_mov_reg_reg() {
        // mov rax, rdi = 48 89 f8
        let d = decode(&[0x48, 0x89, 0xf8], CpuMode::Long).unwrap();
        assert_eq!(d.len, 3);
        assert_eq!(d.opcode, 0x89);
        assert!(d.rexw());
        assert_eq!(d.reg, 7); // rdi
        assert_eq!(d.rm, 0); // rax
        assert_eq!(d.opsize(), 8);
    }

    #[test]
    fn mode_changes_modrm_tables() {
        // 8a 1e 0c 32: long mode reads (%rsi); real mode reads disp16.
        let long = decode(&[0x8a, 0x1e, 0x0c, 0x32], CpuMode::Long).unwrap();
        assert_eq!(long.len, 2);
        let m = long.mem.unwrap();
        assert_eq!(m.base, Some(6));
        assert_eq!(m.disp, 0);

        let real = decode(&[0x8a, 0x1e, 0x0c, 0x32], CpuMode::Real).unwrap();
        assert_eq!(real.len, 4);
        let m = real.mem.unwrap();
        assert_eq!(m.base, None);
        assert_eq!(m.disp, 0x320c);
    }

    #[test]
    fn rip_relative() {
        // mov eax, [rip+0x1000] = 8b 05 00 10 00 00
        let d = decode(&[0x8b, 0x05, 0, 0x10, 0, 0], CpuMode::Long).unwrap();
        let m = d.mem.unwrap();
        assert!(m.rip_rel);
        assert_eq!(m.disp, 0x1000);
        assert_eq!(d.len, 6);
    }

    #[test]
    fn sib_with_implicit_zero_index() {
        // mov eax, [rsp] = 8b 04 24
        let d = decode(&[0x8b, 0x04, 0x24], CpuMode::Long).unwrap();
        let m = d.mem.unwrap();
        assert_eq!(m.base, Some(4));
        assert_eq!(m.index, None);
    }

    #[test]
    fn sib_no_base() {
        // mov eax, [0x1234] via SIB = 8b 04 25 34 12 00 00
        let d = decode(&[0x8b, 0x04, 0x25, 0x34, 0x12, 0, 0], CpuMode::Long).unwrap();
        let m = d.mem.unwrap();
        assert_eq!(m.base, None);
        assert_eq!(m.index, None);
        assert_eq!(m.disp, 0x1234);
    }

    #[test]
    fn imm64_needs_rexw() {
        // movabs rax, imm64 = 48 b8 ...
        let mut b = vec![0x48, 0xb8];
        b.extend_from_slice(&0x1122334455667788u64.to_le_bytes());
        let d = decode(&b, CpuMode::Long).unwrap();
        assert_eq!(d.imm, 0x1122334455667788);
        assert_eq!(d.len, 10);
        // without REX.W it is imm32
        let d = decode(&[0xb8, 0x78, 0x56, 0x34, 0x12], CpuMode::Long).unwrap();
        assert_eq!(d.imm, 0x12345678);
        assert_eq!(d.len, 5);
    }

    #[test]
    fn redundant_prefixes_do_not_toggle() {
        // 66 66 66 89 d8 is still a 16-bit mov.
        let d = decode(&[0x66, 0x66, 0x66, 0x89, 0xd8], CpuMode::Long).unwrap();
        assert_eq!(d.opsize(), 2);
    }

    #[test]
    fn rex_cancelled_by_later_prefix() {
        // REX before a legacy prefix is dead: 48 66 89 d8 decodes the 66.
        let d = decode(&[0x48, 0x66, 0x89, 0xd8], CpuMode::Long).unwrap();
        assert!(!d.rexw());
        assert_eq!(d.opsize(), 2);
    }

    #[test]
    fn too_long_rejected() {
        let mut b = vec![0x66; 14];
        b.extend_from_slice(&[0x89, 0xd8]);
        assert_eq!(decode(&b, CpuMode::Long), Err(DecodeError::TooLong));
    }

    #[test]
    fn truncated_reports_available() {
        assert_eq!(
            decode(&[0x48, 0x89], CpuMode::Long),
            Err(DecodeError::Truncated(2))
        );
    }

    #[test]
    fn group_f7_immediate_depends_on_reg() {
        // test rax, imm32 = 48 f7 c0 ...
        let d = decode(&[0x48, 0xf7, 0xc0, 1, 0, 0, 0], CpuMode::Long).unwrap();
        assert_eq!(d.imm, 1);
        // not rax = 48 f7 d0 (no immediate)
        let d = decode(&[0x48, 0xf7, 0xd0], CpuMode::Long).unwrap();
        assert_eq!(d.len, 3);
    }

    #[test]
    fn two_byte_map() {
        // syscall = 0f 05
        let d = decode(&[0x0f, 0x05], CpuMode::Long).unwrap();
        assert_eq!(d.map, OpMap::Two);
        assert_eq!(d.opcode, 0x05);
        assert_eq!(d.len, 2);
        // jz rel32 = 0f 84 xx
        let d = decode(&[0x0f, 0x84, 4, 0, 0, 0], CpuMode::Long).unwrap();
        assert_eq!(d.imm, 4);
    }

    #[test]
    fn invalid_in_long_mode() {
        assert_eq!(decode(&[0x60], CpuMode::Long), Err(DecodeError::InvalidEncoding));
        assert!(decode(&[0x60], CpuMode::Legacy).is_ok());
    }

    #[test]
    fn legacy_les_is_not_vex() {
        // c4 with a non-11 modrm top in legacy mode decodes as LES.
        let d = decode(&[0xc4, 0x18], CpuMode::Legacy).unwrap();
        assert!(!d.vex);
        assert_eq!(d.opcode, 0xc4);
    }
}
