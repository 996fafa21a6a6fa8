//! Backward register liveness scanning.
//!
//! One query walks one block: seed the live set with the block's live-outs,
//! then step backward instruction by instruction (a define kills liveness,
//! a use creates it). A register is free at a point when it is neither in
//! the computed live set nor reserved by the calling convention. Results
//! are never cached; at most a few instructions are scanned per query.

use pavise_mir::{Function, InstId, Reg, RegSet};
use smallvec::SmallVec;

/// Which registers a query may hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegBank {
    /// R0 through R7, the registers 16-bit Thumb encodings can reach.
    Low,
    /// The low bank plus R8 through R12 and Lr.
    Any,
}

/// Free registers at the point just before `inst` executes, in ascending
/// register order (low bank first).
pub fn free_regs_before(func: &Function, inst: InstId, bank: RegBank) -> SmallVec<[Reg; 8]> {
    assert!(!func.inst(inst).is_meta(), "cannot instrument a meta instruction");
    collect_free(func, step_block_backward(func, inst, true), bank)
}

/// Free registers at the point just after `inst` executes.
pub fn free_regs_after(func: &Function, inst: InstId, bank: RegBank) -> SmallVec<[Reg; 8]> {
    assert!(!func.inst(inst).is_meta(), "cannot instrument a meta instruction");
    collect_free(func, step_block_backward(func, inst, false), bank)
}

/// Walk backward from the end of `inst`'s block, updating the live set at
/// each instruction. When `include_inst` is set the walk steps across
/// `inst` itself, yielding the live set before it; otherwise it stops one
/// short, yielding the live set after it.
fn step_block_backward(func: &Function, inst: InstId, include_inst: bool) -> RegSet {
    let block = func.layout.inst_block(inst);
    let mut live = func.block(block).live_outs;

    let mut cur = func.layout.last_inst_of(block);
    loop {
        let id = cur.expect("instruction not found walking its block backward");
        if !include_inst && id == inst {
            break;
        }
        let data = func.inst(id);
        for reg in data.defs().iter() {
            live.remove(reg);
        }
        for reg in data.uses().iter() {
            live.insert(reg);
        }
        if id == inst {
            break;
        }
        cur = func.layout.prev_inst_of(id);
    }

    live
}

fn collect_free(func: &Function, live: RegSet, bank: RegBank) -> SmallVec<[Reg; 8]> {
    let mut free = SmallVec::new();
    for reg in Reg::LOW {
        if !func.reserved.contains(reg) && !live.contains(reg) {
            free.push(reg);
        }
    }
    if bank == RegBank::Any {
        for reg in Reg::HIGH_SCRATCH {
            if !func.reserved.contains(reg) && !live.contains(reg) {
                free.push(reg);
            }
        }
    }
    free
}

#[cfg(test)]
mod tests {
    use super::*;
    use pavise_mir::{Cond, InstData, Opcode};

    /// A block of `mov rN, #k` instructions with a constructed live-out set.
    fn block_with(func: &mut Function, live_outs: &[Reg], movs: &[Reg]) -> Vec<InstId> {
        let block = func.make_block();
        func.layout.append_block(block);
        func.block_mut(block).live_outs = RegSet::from(live_outs);

        movs.iter()
            .map(|reg| {
                let inst =
                    func.make_inst(InstData::new(Opcode::MovImm, Cond::Al).reg(*reg).imm(0));
                func.layout.append_inst(inst, block);
                inst
            })
            .collect()
    }

    #[test]
    fn test_live_out_registers_are_not_free() {
        let mut func = Function::new("f");
        let insts = block_with(&mut func, &[Reg::R0, Reg::R3], &[Reg::R5]);

        let free = free_regs_before(&func, insts[0], RegBank::Low);
        assert!(!free.contains(&Reg::R0));
        assert!(!free.contains(&Reg::R3));
        assert!(free.contains(&Reg::R1));
        // R5 is defined here without a later use, so it is free before the
        // definition too.
        assert!(free.contains(&Reg::R5));
    }

    #[test]
    fn test_define_kills_liveness_backward() {
        let mut func = Function::new("f");
        // R2 is live out but defined by the second mov: it is dead before it.
        let insts = block_with(&mut func, &[Reg::R2], &[Reg::R1, Reg::R2]);

        let free = free_regs_before(&func, insts[0], RegBank::Low);
        assert!(free.contains(&Reg::R2));

        let free = free_regs_after(&func, insts[1], RegBank::Low);
        assert!(!free.contains(&Reg::R2));
    }

    #[test]
    fn test_use_creates_liveness_backward() {
        let mut func = Function::new("f");
        let block = func.make_block();
        func.layout.append_block(block);

        let mov = func.make_inst(InstData::new(Opcode::MovImm, Cond::Al).reg(Reg::R0).imm(0));
        func.layout.append_inst(mov, block);
        // str r4, [sp, #0] reads R4, making it live before the mov.
        let str_imm = func.make_inst(
            InstData::new(Opcode::StrImm, Cond::Al)
                .reg(Reg::R4)
                .reg(Reg::Sp)
                .imm(0),
        );
        func.layout.append_inst(str_imm, block);

        let free = free_regs_before(&func, mov, RegBank::Low);
        assert!(!free.contains(&Reg::R4));
        let free = free_regs_after(&func, str_imm, RegBank::Low);
        assert!(free.contains(&Reg::R4));
    }

    #[test]
    fn test_reserved_registers_never_free() {
        let mut func = Function::new("f");
        let insts = block_with(&mut func, &[], &[Reg::R0]);

        let free = free_regs_before(&func, insts[0], RegBank::Any);
        assert!(!free.contains(&Reg::Sp));
        assert!(!free.contains(&Reg::Pc));
        assert!(free.contains(&Reg::Lr));
        assert!(free.contains(&Reg::R12));
    }

    #[test]
    fn test_low_bank_excludes_high_registers() {
        let mut func = Function::new("f");
        let insts = block_with(&mut func, &[], &[Reg::R0]);

        let free = free_regs_before(&func, insts[0], RegBank::Low);
        assert!(free.iter().all(|reg| Reg::LOW.contains(reg)));
    }

    #[test]
    fn test_all_live_leaves_nothing_free() {
        let mut func = Function::new("f");
        let block = func.make_block();
        func.layout.append_block(block);
        func.block_mut(block).live_outs = RegSet::all();

        let push = func.make_inst(
            InstData::new(Opcode::Push, Cond::Al)
                .reg(Reg::R4)
                .reg(Reg::Lr),
        );
        func.layout.append_inst(push, block);

        assert!(free_regs_before(&func, push, RegBank::Any).is_empty());
    }
}
