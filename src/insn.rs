//! x86-64 instruction-length decoding.
//!
//! The correlator needs one thing from the instruction stream: the end
//! offset of the instruction containing a PC-relative relocation, so the
//! relocation's addend can be turned into an offset from the target
//! section's start. This decoder covers the encodings compilers emit for
//! kernel-style code: legacy and REX prefixes, the one/two/three-byte
//! opcode maps, VEX, ModRM/SIB addressing and the immediate widths.

use crate::error::{Error, Result};

/// Immediate operand width class.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Imm {
    None,
    /// imm8
    B,
    /// imm16
    W,
    /// imm16 + imm8 (`enter`)
    WB,
    /// imm16/imm32 by operand size
    Z,
    /// imm16/imm32/imm64 by operand size and REX.W (`mov r64, imm64`)
    Iv,
    /// 64-bit moffs
    O,
    /// group 3 (`f6`): imm8 when ModRM.reg selects `test`
    Grp3B,
    /// group 3 (`f7`): immZ when ModRM.reg selects `test`
    Grp3Z,
}

#[inline]
fn byte(bytes: &[u8], at: usize) -> Result<u8> {
    bytes
        .get(at)
        .copied()
        .ok_or_else(|| Error::Malformed(format!("truncated instruction at offset {at}")))
}

fn one_byte_opcode(op: u8) -> Result<(bool, Imm)> {
    let entry = match op {
        // add/or/adc/sbb/and/sub/xor/cmp blocks
        0x00..=0x03 | 0x08..=0x0b | 0x10..=0x13 | 0x18..=0x1b => (true, Imm::None),
        0x20..=0x23 | 0x28..=0x2b | 0x30..=0x33 | 0x38..=0x3b => (true, Imm::None),
        0x04 | 0x0c | 0x14 | 0x1c | 0x24 | 0x2c | 0x34 | 0x3c => (false, Imm::B),
        0x05 | 0x0d | 0x15 | 0x1d | 0x25 | 0x2d | 0x35 | 0x3d => (false, Imm::Z),
        // push/pop r64
        0x50..=0x5f => (false, Imm::None),
        // movsxd
        0x63 => (true, Imm::None),
        0x68 => (false, Imm::Z),
        0x69 => (true, Imm::Z),
        0x6a => (false, Imm::B),
        0x6b => (true, Imm::B),
        // ins/outs
        0x6c..=0x6f => (false, Imm::None),
        // jcc rel8
        0x70..=0x7f => (false, Imm::B),
        0x80 => (true, Imm::B),
        0x81 => (true, Imm::Z),
        0x83 => (true, Imm::B),
        // test/xchg/mov/lea/mov sreg/pop r/m
        0x84..=0x8f => (true, Imm::None),
        // nop/xchg/cwde/cdq/fwait/pushf/popf/sahf/lahf
        0x90..=0x99 | 0x9b..=0x9f => (false, Imm::None),
        // mov moffs
        0xa0..=0xa3 => (false, Imm::O),
        0xa4..=0xa7 => (false, Imm::None),
        0xa8 => (false, Imm::B),
        0xa9 => (false, Imm::Z),
        0xaa..=0xaf => (false, Imm::None),
        0xb0..=0xb7 => (false, Imm::B),
        0xb8..=0xbf => (false, Imm::Iv),
        0xc0 | 0xc1 => (true, Imm::B),
        0xc2 => (false, Imm::W),
        0xc3 => (false, Imm::None),
        0xc6 => (true, Imm::B),
        0xc7 => (true, Imm::Z),
        0xc8 => (false, Imm::WB),
        0xc9 | 0xcb | 0xcc | 0xcf => (false, Imm::None),
        0xca => (false, Imm::W),
        0xcd => (false, Imm::B),
        // shifts by 1/cl
        0xd0..=0xd3 => (true, Imm::None),
        0xd7 => (false, Imm::None),
        // x87
        0xd8..=0xdf => (true, Imm::None),
        // loop/jcxz, in/out imm8
        0xe0..=0xe7 => (false, Imm::B),
        // call/jmp rel32
        0xe8 | 0xe9 => (false, Imm::Z),
        0xeb => (false, Imm::B),
        0xec..=0xef => (false, Imm::None),
        0xf1 | 0xf4 | 0xf5 | 0xf8..=0xfd => (false, Imm::None),
        0xf6 => (true, Imm::Grp3B),
        0xf7 => (true, Imm::Grp3Z),
        0xfe | 0xff => (true, Imm::None),
        _ => {
            return Err(Error::Malformed(format!("cannot decode opcode {op:#04x}")));
        }
    };
    Ok(entry)
}

fn two_byte_opcode(op: u8) -> Result<(bool, Imm)> {
    let entry = match op {
        0x00..=0x03 | 0x0d => (true, Imm::None),
        0x05..=0x09 | 0x0b => (false, Imm::None),
        0x10..=0x17 | 0x18..=0x1f | 0x20..=0x23 | 0x28..=0x2f => (true, Imm::None),
        // wrmsr/rdtsc/rdmsr/rdpmc/sysenter/sysexit
        0x30..=0x37 => (false, Imm::None),
        // cmovcc
        0x40..=0x4f => (true, Imm::None),
        0x50..=0x6f => (true, Imm::None),
        // pshuf*/psll*-by-imm
        0x70..=0x73 => (true, Imm::B),
        0x74..=0x76 | 0x78 | 0x79 | 0x7c..=0x7f => (true, Imm::None),
        0x77 => (false, Imm::None),
        // jcc rel32
        0x80..=0x8f => (false, Imm::Z),
        // setcc
        0x90..=0x9f => (true, Imm::None),
        0xa0 | 0xa1 | 0xa2 | 0xa8 | 0xa9 => (false, Imm::None),
        0xa3 | 0xa5 | 0xab | 0xad..=0xaf => (true, Imm::None),
        0xa4 | 0xac => (true, Imm::B),
        0xb0..=0xb9 | 0xbb..=0xbf => (true, Imm::None),
        0xba => (true, Imm::B),
        0xc0 | 0xc1 | 0xc3 | 0xc7 => (true, Imm::None),
        0xc2 | 0xc4..=0xc6 => (true, Imm::B),
        // bswap
        0xc8..=0xcf => (false, Imm::None),
        0xd0..=0xff => (true, Imm::None),
        _ => {
            return Err(Error::Malformed(format!(
                "cannot decode opcode 0f {op:#04x}"
            )));
        }
    };
    Ok(entry)
}

/// The length in bytes of the instruction starting at `bytes[0]`.
pub fn insn_length(bytes: &[u8]) -> Result<usize> {
    let mut at = 0;
    let mut opsize16 = false;

    // legacy prefixes
    loop {
        match byte(bytes, at)? {
            0xf0 | 0xf2 | 0xf3 | 0x2e | 0x36 | 0x3e | 0x26 | 0x64 | 0x65 | 0x67 => at += 1,
            0x66 => {
                opsize16 = true;
                at += 1;
            }
            _ => break,
        }
    }

    let mut rex_w = false;
    if let 0x40..=0x4f = byte(bytes, at)? {
        rex_w = byte(bytes, at)? & 8 != 0;
        at += 1;
    }

    let op = byte(bytes, at)?;
    at += 1;

    let (has_modrm, imm) = match op {
        0x0f => {
            let op2 = byte(bytes, at)?;
            at += 1;
            match op2 {
                0x38 => {
                    at += 1;
                    (true, Imm::None)
                }
                0x3a => {
                    at += 1;
                    (true, Imm::B)
                }
                _ => two_byte_opcode(op2)?,
            }
        }
        // VEX, two-byte form: 0f map
        0xc5 => {
            at += 2;
            two_byte_opcode(byte(bytes, at - 1)?)?
        }
        // VEX, three-byte form: map select in the low bits of the first
        // payload byte
        0xc4 => {
            let map = byte(bytes, at)? & 0x1f;
            at += 3;
            match map {
                1 => two_byte_opcode(byte(bytes, at - 1)?)?,
                2 => (true, Imm::None),
                3 => (true, Imm::B),
                _ => {
                    return Err(Error::Malformed(format!("cannot decode VEX map {map}")));
                }
            }
        }
        _ => one_byte_opcode(op)?,
    };

    let mut modrm_reg = 0;
    if has_modrm {
        let m = byte(bytes, at)?;
        at += 1;
        let md = m >> 6;
        let rm = m & 7;
        modrm_reg = (m >> 3) & 7;
        if md != 3 {
            let mut disp = match md {
                1 => 1,
                2 => 4,
                _ => 0,
            };
            if rm == 4 {
                let sib = byte(bytes, at)?;
                at += 1;
                if md == 0 && (sib & 7) == 5 {
                    disp = 4;
                }
            } else if md == 0 && rm == 5 {
                // RIP-relative
                disp = 4;
            }
            at += disp;
        }
    }

    let immz = if opsize16 { 2 } else { 4 };
    at += match imm {
        Imm::None => 0,
        Imm::B => 1,
        Imm::W => 2,
        Imm::WB => 3,
        Imm::Z => immz,
        Imm::Iv => {
            if rex_w {
                8
            } else {
                immz
            }
        }
        Imm::O => 8,
        Imm::Grp3B => {
            if modrm_reg <= 1 {
                1
            } else {
                0
            }
        }
        Imm::Grp3Z => {
            if modrm_reg <= 1 {
                immz
            } else {
                0
            }
        }
    };

    if at > bytes.len() {
        return Err(Error::Malformed(format!(
            "truncated instruction: need {} bytes, have {}",
            at,
            bytes.len()
        )));
    }
    Ok(at)
}

/// The end offset of the instruction containing `offset`, found by
/// decoding forward from the start of `bytes`.
pub fn next_insn_end(bytes: &[u8], offset: u64) -> Result<u64> {
    let offset = offset as usize;
    let mut at = 0;
    while at < bytes.len() {
        let end = at + insn_length(&bytes[at..])?;
        if offset >= at && offset < end {
            return Ok(end as u64);
        }
        at = end;
    }
    Err(Error::Malformed(format!(
        "no instruction contains offset {offset:#x}"
    )))
}
