//! Instruction boundaries and branch targets of existing method code.
//!
//! Weaving in place grows the code at every return site, so every
//! instruction that names another instruction by offset has to be found and
//! re-targeted. Nothing else about an instruction matters here; operands are
//! copied through untouched.

use thiserror::Error;

pub mod op {
    pub const ILOAD: u8 = 0x15;
    pub const LLOAD: u8 = 0x16;
    pub const FLOAD: u8 = 0x17;
    pub const DLOAD: u8 = 0x18;
    pub const ALOAD: u8 = 0x19;
    pub const ISTORE: u8 = 0x36;
    pub const LSTORE: u8 = 0x37;
    pub const FSTORE: u8 = 0x38;
    pub const DSTORE: u8 = 0x39;
    pub const ASTORE: u8 = 0x3a;
    pub const POP: u8 = 0x57;
    pub const DUP: u8 = 0x59;
    pub const LDC: u8 = 0x12;
    pub const LDC_W: u8 = 0x13;
    pub const IINC: u8 = 0x84;
    pub const GOTO: u8 = 0xa7;
    pub const JSR: u8 = 0xa8;
    pub const TABLESWITCH: u8 = 0xaa;
    pub const LOOKUPSWITCH: u8 = 0xab;
    pub const IRETURN: u8 = 0xac;
    pub const LRETURN: u8 = 0xad;
    pub const FRETURN: u8 = 0xae;
    pub const DRETURN: u8 = 0xaf;
    pub const ARETURN: u8 = 0xb0;
    pub const RETURN: u8 = 0xb1;
    pub const GETSTATIC: u8 = 0xb2;
    pub const INVOKEVIRTUAL: u8 = 0xb6;
    pub const INVOKESPECIAL: u8 = 0xb7;
    pub const INVOKESTATIC: u8 = 0xb8;
    pub const NEW: u8 = 0xbb;
    pub const ATHROW: u8 = 0xbf;
    pub const WIDE: u8 = 0xc4;
    pub const IFNULL: u8 = 0xc6;
    pub const IFNONNULL: u8 = 0xc7;
    pub const GOTO_W: u8 = 0xc8;
    pub const JSR_W: u8 = 0xc9;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BytecodeError {
    #[error("unknown opcode {opcode:#04x} at offset {pc}")]
    UnknownOpcode { opcode: u8, pc: usize },
    #[error("instruction at offset {0} runs past the end of the code")]
    Truncated(usize),
    #[error("branch at offset {0} does not land on an instruction")]
    BadTarget(usize),
    #[error("branch at offset {0} no longer fits a 16-bit offset")]
    OutOfRange(usize),
}

/// Where control may go from an instruction, as absolute offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Branch {
    None,
    /// `if*`, `goto`, `jsr`: a signed 16-bit offset after the opcode.
    Short(usize),
    /// `goto_w`, `jsr_w`.
    Wide(usize),
    Table { default: usize, low: i32, high: i32, targets: Vec<usize> },
    Lookup { default: usize, pairs: Vec<(i32, usize)> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub pc: usize,
    pub len: usize,
    pub opcode: u8,
    pub branch: Branch,
}

impl Instruction {
    pub fn is_return(&self) -> bool {
        (op::IRETURN..=op::RETURN).contains(&self.opcode)
    }
}

fn fixed_length(opcode: u8) -> Option<usize> {
    Some(match opcode {
        0x00..=0x0f => 1,
        0x10 => 2,
        0x11 => 3,
        0x12 => 2,
        0x13 | 0x14 => 3,
        0x15..=0x19 => 2,
        0x1a..=0x35 => 1,
        0x36..=0x3a => 2,
        0x3b..=0x83 => 1,
        0x84 => 3,
        0x85..=0x98 => 1,
        0x99..=0xa8 => 3,
        0xa9 => 2,
        0xac..=0xb1 => 1,
        0xb2..=0xb8 => 3,
        0xb9 | 0xba => 5,
        0xbb => 3,
        0xbc => 2,
        0xbd => 3,
        0xbe | 0xbf => 1,
        0xc0 | 0xc1 => 3,
        0xc2 | 0xc3 => 1,
        0xc5 => 4,
        0xc6 | 0xc7 => 3,
        0xc8 | 0xc9 => 5,
        _ => return None,
    })
}

fn is_short_branch(opcode: u8) -> bool {
    matches!(opcode, 0x99..=op::JSR | op::IFNULL | op::IFNONNULL)
}

struct Cursor<'a> {
    code: &'a [u8],
    insn: usize,
}

impl Cursor<'_> {
    fn bytes<const N: usize>(&self, at: usize) -> Result<[u8; N], BytecodeError> {
        self.code
            .get(at..at + N)
            .and_then(|b| b.try_into().ok())
            .ok_or(BytecodeError::Truncated(self.insn))
    }

    fn i16(&self, at: usize) -> Result<i16, BytecodeError> {
        Ok(i16::from_be_bytes(self.bytes(at)?))
    }

    fn i32(&self, at: usize) -> Result<i32, BytecodeError> {
        Ok(i32::from_be_bytes(self.bytes(at)?))
    }

    fn target(&self, offset: i64) -> Result<usize, BytecodeError> {
        usize::try_from(self.insn as i64 + offset).map_err(|_| BytecodeError::BadTarget(self.insn))
    }
}

/// Splits `code` into instructions.
pub fn decode(code: &[u8]) -> Result<Vec<Instruction>, BytecodeError> {
    let mut out = Vec::new();
    let mut pc = 0;
    while pc < code.len() {
        let opcode = code[pc];
        let c = Cursor { code, insn: pc };
        let (len, branch) = match opcode {
            op::WIDE => {
                let [modified] = c.bytes::<1>(pc + 1)?;
                (if modified == op::IINC { 6 } else { 4 }, Branch::None)
            }
            op::TABLESWITCH => {
                let base = (pc + 4) & !3;
                let default = c.target(i64::from(c.i32(base)?))?;
                let low = c.i32(base + 4)?;
                let high = c.i32(base + 8)?;
                let count = usize::try_from(i64::from(high) - i64::from(low) + 1).map_err(|_| BytecodeError::Truncated(pc))?;
                let mut targets = Vec::with_capacity(count.min(code.len()));
                for i in 0..count {
                    targets.push(c.target(i64::from(c.i32(base + 12 + 4 * i)?))?);
                }
                (base + 12 + 4 * count - pc, Branch::Table { default, low, high, targets })
            }
            op::LOOKUPSWITCH => {
                let base = (pc + 4) & !3;
                let default = c.target(i64::from(c.i32(base)?))?;
                let npairs = usize::try_from(c.i32(base + 4)?).map_err(|_| BytecodeError::Truncated(pc))?;
                let mut pairs = Vec::with_capacity(npairs.min(code.len()));
                for i in 0..npairs {
                    let at = base + 8 + 8 * i;
                    pairs.push((c.i32(at)?, c.target(i64::from(c.i32(at + 4)?))?));
                }
                (base + 8 + 8 * npairs - pc, Branch::Lookup { default, pairs })
            }
            op::GOTO_W | op::JSR_W => (5, Branch::Wide(c.target(i64::from(c.i32(pc + 1)?))?)),
            _ if is_short_branch(opcode) => (3, Branch::Short(c.target(i64::from(c.i16(pc + 1)?))?)),
            _ => (fixed_length(opcode).ok_or(BytecodeError::UnknownOpcode { opcode, pc })?, Branch::None),
        };
        if pc + len > code.len() {
            return Err(BytecodeError::Truncated(pc));
        }
        out.push(Instruction { pc, len, opcode, branch });
        pc += len;
    }
    Ok(out)
}

/// A branch operand waiting for the new offset of its target.
#[derive(Debug, Clone, Copy)]
pub struct Fixup {
    /// New offset of the branching instruction.
    pub insn: usize,
    /// Where the operand sits in the new code.
    pub operand: usize,
    /// Old offset of the target.
    pub target: usize,
    pub wide: bool,
}

/// Old-to-new offset table built while code is being copied.
#[derive(Debug)]
pub struct OffsetMap {
    new: Vec<Option<usize>>,
}

impl OffsetMap {
    pub fn new(old_len: usize) -> Self {
        Self { new: vec![None; old_len + 1] }
    }

    pub fn set(&mut self, old: usize, new: usize) {
        self.new[old] = Some(new);
    }

    /// New offset of an instruction start, or of the end of the code.
    pub fn get(&self, old: usize) -> Option<usize> {
        self.new.get(old).copied().flatten()
    }

    /// Writes every pending branch operand into `code`.
    pub fn apply(&self, code: &mut [u8], fixups: &[Fixup]) -> Result<(), BytecodeError> {
        for fixup in fixups {
            let target = self.get(fixup.target).ok_or(BytecodeError::BadTarget(fixup.insn))?;
            let offset = target as i64 - fixup.insn as i64;
            if fixup.wide {
                let offset = i32::try_from(offset).map_err(|_| BytecodeError::OutOfRange(fixup.insn))?;
                code[fixup.operand..fixup.operand + 4].copy_from_slice(&offset.to_be_bytes());
            } else {
                let offset = i16::try_from(offset).map_err(|_| BytecodeError::OutOfRange(fixup.insn))?;
                code[fixup.operand..fixup.operand + 2].copy_from_slice(&offset.to_be_bytes());
            }
        }
        Ok(())
    }
}
