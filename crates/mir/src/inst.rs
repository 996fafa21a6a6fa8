//! Machine instruction definitions.
//!
//! The opcode set is closed: it contains exactly the Thumb/Thumb-2
//! instructions the instrumentation passes classify or synthesize. Each
//! opcode has a fixed operand layout, documented on its variant; register
//! define/use sets (including the implicit Sp and Lr effects of the stack
//! and return idioms) are derived from that layout in [`InstData::defs`]
//! and [`InstData::uses`].

use core::fmt;
use std::ops;

use smallvec::SmallVec;

use crate::{Cond, Reg, RegSet};

/// An opaque reference to an instruction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Copy, Hash)]
pub struct InstId(pub u32);
cranelift_entity::entity_impl!(InstId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// IT block marker: `[Imm(mask)]`, base condition in the `cond` field.
    It,
    /// `[Reg...]`: the stored register list. Implicitly writes Sp.
    Push,
    /// `[Reg...]`: the loaded register list. Implicitly writes Sp.
    Pop,
    /// Same layout as [`Opcode::Pop`]; returns when the list contains Pc.
    PopRet,
    /// Pre-decrement store: `[Reg(wb), Reg(rt), Reg(rn), Imm]`.
    StrPre,
    /// Store-multiple, decrement-before, writeback: `[Reg(wb), Reg(rn), Reg...]`.
    StmDbUpd,
    /// Post-increment load: `[Reg(rt), Reg(wb), Reg(rn), Imm]`.
    LdrPost,
    /// Load-multiple, increment-after, writeback: `[Reg(wb), Reg(rn), Reg...]`.
    LdmIaUpd,
    /// Same layout as [`Opcode::LdmIaUpd`]; returns by loading Pc.
    LdmIaRet,
    /// Offset store: `[Reg(rt), Reg(rn), Imm]`.
    StrImm,
    /// Register-offset store: `[Reg(rt), Reg(rn), Reg(rm), Imm]`.
    StrReg,
    /// Unprivileged offset store: `[Reg(rt), Reg(rn), Imm]`.
    Strt,
    /// Offset load: `[Reg(rt), Reg(rn), Imm]`.
    LdrImm,
    /// Same layout as [`Opcode::LdrImm`]; returns by loading Pc.
    LdrImmRet,
    /// Register-offset load: `[Reg(rt), Reg(rn), Reg(rm), Imm]`.
    LdrReg,
    /// Same layout as [`Opcode::LdrReg`]; returns by loading Pc.
    LdrRegRet,
    /// Move of a Thumb-2 modified constant: `[Reg(rd), Imm]`.
    MovImm,
    /// Move of a 16-bit immediate into the low half: `[Reg(rd), Imm]`.
    MovImm16,
    /// Move of a 16-bit immediate into the high half: `[Reg(rd), Imm]`;
    /// rd is read-modify-write.
    MovTop,
    /// Sp adjustment by a word count: `[Reg(sp), Reg(sp), Imm(words)]`.
    AddSpImm,
    /// `[Reg(rd), Reg(sp), Reg(rm)]`: rd = sp + rm.
    AddSpReg,
    /// Branch-and-exchange return through Lr: `[]`.
    BxRet,
    /// Call-frame directive: `[]`, does not generate code.
    Cfi,
}

impl Opcode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::It => "it",
            Opcode::Push => "push",
            Opcode::Pop => "pop",
            Opcode::PopRet => "pop_ret",
            Opcode::StrPre => "str_pre",
            Opcode::StmDbUpd => "stmdb_upd",
            Opcode::LdrPost => "ldr_post",
            Opcode::LdmIaUpd => "ldmia_upd",
            Opcode::LdmIaRet => "ldmia_ret",
            Opcode::StrImm => "str_imm",
            Opcode::StrReg => "str_reg",
            Opcode::Strt => "strt",
            Opcode::LdrImm => "ldr_imm",
            Opcode::LdrImmRet => "ldr_imm_ret",
            Opcode::LdrReg => "ldr_reg",
            Opcode::LdrRegRet => "ldr_reg_ret",
            Opcode::MovImm => "mov_imm",
            Opcode::MovImm16 => "movw",
            Opcode::MovTop => "movt",
            Opcode::AddSpImm => "add_sp_imm",
            Opcode::AddSpReg => "add_sp_reg",
            Opcode::BxRet => "bx_ret",
            Opcode::Cfi => "cfi",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    Imm(i32),
}

/// Per-instruction flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstFlags(u8);

impl InstFlags {
    pub const NONE: Self = Self(0);
    /// Part of the function prologue.
    pub const FRAME_SETUP: Self = Self(1);
    /// Part of the function epilogue.
    pub const FRAME_DESTROY: Self = Self(1 << 1);
    /// Synthesized by the shadow stack rewriter; excluded from its scan.
    pub const SHADOW_STACK: Self = Self(1 << 2);

    pub fn contains(self, other: InstFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl ops::BitOr for InstFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for InstFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A machine instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstData {
    pub opcode: Opcode,
    pub operands: SmallVec<[Operand; 4]>,
    pub cond: Cond,
    pub flags: InstFlags,
}

impl InstData {
    pub fn new(opcode: Opcode, cond: Cond) -> Self {
        Self {
            opcode,
            operands: SmallVec::new(),
            cond,
            flags: InstFlags::NONE,
        }
    }

    pub fn reg(mut self, reg: Reg) -> Self {
        self.operands.push(Operand::Reg(reg));
        self
    }

    pub fn regs(mut self, regs: &[Reg]) -> Self {
        self.operands.extend(regs.iter().map(|r| Operand::Reg(*r)));
        self
    }

    pub fn imm(mut self, value: i32) -> Self {
        self.operands.push(Operand::Imm(value));
        self
    }

    pub fn flags(mut self, flags: InstFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// The register at operand position `idx`.
    ///
    /// Panics if the operand is missing or not a register; an instruction
    /// shaped differently from its opcode's layout is a classification bug.
    pub fn reg_at(&self, idx: usize) -> Reg {
        match self.operands.get(idx) {
            Some(Operand::Reg(reg)) => *reg,
            _ => panic!("malformed {}: no register operand at {idx}", self.opcode.mnemonic()),
        }
    }

    /// The immediate at operand position `idx`. Panics like [`Self::reg_at`].
    pub fn imm_at(&self, idx: usize) -> i32 {
        match self.operands.get(idx) {
            Some(Operand::Imm(value)) => *value,
            _ => panic!("malformed {}: no immediate operand at {idx}", self.opcode.mnemonic()),
        }
    }

    /// Iterate the explicit register operands.
    pub fn reg_operands(&self) -> impl Iterator<Item = Reg> + '_ {
        self.operands.iter().filter_map(|op| match op {
            Operand::Reg(reg) => Some(*reg),
            Operand::Imm(..) => None,
        })
    }

    /// Whether this instruction generates no code (directives, debug info).
    pub fn is_meta(&self) -> bool {
        matches!(self.opcode, Opcode::Cfi)
    }

    /// Registers written by this instruction, implicit effects included.
    pub fn defs(&self) -> RegSet {
        let mut set = RegSet::new();
        match self.opcode {
            Opcode::It | Opcode::Cfi | Opcode::BxRet => {}
            Opcode::StrImm | Opcode::StrReg | Opcode::Strt => {}
            Opcode::Push => set.insert(Reg::Sp),
            Opcode::Pop | Opcode::PopRet => {
                set.insert(Reg::Sp);
                for reg in self.reg_operands() {
                    set.insert(reg);
                }
            }
            Opcode::StrPre | Opcode::StmDbUpd => set.insert(self.reg_at(0)),
            Opcode::LdrPost => {
                set.insert(self.reg_at(0));
                set.insert(self.reg_at(1));
            }
            Opcode::LdmIaUpd | Opcode::LdmIaRet => {
                set.insert(self.reg_at(0));
                for op in &self.operands[2..] {
                    if let Operand::Reg(reg) = op {
                        set.insert(*reg);
                    }
                }
            }
            Opcode::LdrImm | Opcode::LdrImmRet | Opcode::LdrReg | Opcode::LdrRegRet => {
                set.insert(self.reg_at(0))
            }
            Opcode::MovImm | Opcode::MovImm16 | Opcode::MovTop => set.insert(self.reg_at(0)),
            Opcode::AddSpImm | Opcode::AddSpReg => set.insert(self.reg_at(0)),
        }
        set
    }

    /// Registers read by this instruction, implicit effects included.
    pub fn uses(&self) -> RegSet {
        let mut set = RegSet::new();
        match self.opcode {
            Opcode::It | Opcode::Cfi => {}
            Opcode::BxRet => set.insert(Reg::Lr),
            Opcode::Push => {
                set.insert(Reg::Sp);
                for reg in self.reg_operands() {
                    set.insert(reg);
                }
            }
            Opcode::Pop | Opcode::PopRet => set.insert(Reg::Sp),
            Opcode::StrPre => {
                set.insert(self.reg_at(1));
                set.insert(self.reg_at(2));
            }
            Opcode::StmDbUpd => {
                set.insert(self.reg_at(1));
                for op in &self.operands[2..] {
                    if let Operand::Reg(reg) = op {
                        set.insert(*reg);
                    }
                }
            }
            Opcode::LdrPost => set.insert(self.reg_at(2)),
            Opcode::LdmIaUpd | Opcode::LdmIaRet => set.insert(self.reg_at(1)),
            Opcode::StrImm | Opcode::Strt => {
                set.insert(self.reg_at(0));
                set.insert(self.reg_at(1));
            }
            Opcode::StrReg => {
                set.insert(self.reg_at(0));
                set.insert(self.reg_at(1));
                set.insert(self.reg_at(2));
            }
            Opcode::LdrImm | Opcode::LdrImmRet => set.insert(self.reg_at(1)),
            Opcode::LdrReg | Opcode::LdrRegRet => {
                set.insert(self.reg_at(1));
                set.insert(self.reg_at(2));
            }
            Opcode::MovImm | Opcode::MovImm16 => {}
            Opcode::MovTop => set.insert(self.reg_at(0)),
            Opcode::AddSpImm => set.insert(self.reg_at(1)),
            Opcode::AddSpReg => {
                set.insert(self.reg_at(1));
                set.insert(self.reg_at(2));
            }
        }
        set
    }
}

impl fmt::Display for InstData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.opcode.mnemonic(), self.cond.suffix())?;
        for (i, op) in self.operands.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            match op {
                Operand::Reg(reg) => write!(f, "{sep}{reg}")?,
                Operand::Imm(value) => write!(f, "{sep}#{value}")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_defs_uses() {
        let push = InstData::new(Opcode::Push, Cond::Al)
            .regs(&[Reg::R4, Reg::R7, Reg::Lr])
            .flags(InstFlags::FRAME_SETUP);
        assert_eq!(push.defs(), RegSet::from([Reg::Sp].as_slice()));
        assert_eq!(
            push.uses(),
            RegSet::from([Reg::R4, Reg::R7, Reg::Sp, Reg::Lr].as_slice())
        );
    }

    #[test]
    fn test_ldr_post_defs_uses() {
        let ldr = InstData::new(Opcode::LdrPost, Cond::Al)
            .reg(Reg::R7)
            .reg(Reg::Sp)
            .reg(Reg::Sp)
            .imm(4);
        assert_eq!(ldr.defs(), RegSet::from([Reg::R7, Reg::Sp].as_slice()));
        assert_eq!(ldr.uses(), RegSet::from([Reg::Sp].as_slice()));
    }

    #[test]
    fn test_display() {
        let str_imm = InstData::new(Opcode::StrImm, Cond::Eq)
            .reg(Reg::Lr)
            .reg(Reg::Sp)
            .imm(4092);
        assert_eq!(str_imm.to_string(), "str_immeq lr, sp, #4092");
    }

    #[test]
    #[should_panic]
    fn test_malformed_operand_access() {
        let it = InstData::new(Opcode::It, Cond::Eq).imm(8);
        let _ = it.reg_at(0);
    }
}
