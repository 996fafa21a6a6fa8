//! Prologue/epilogue rewriting against a parallel shadow stack.
//!
//! Every push that spills the return address gets a companion store of Lr
//! into a shadow region at a fixed displacement from Sp, and every pop
//! that would reload Pc or Lr from the stack is demoted in favor of a
//! load from the same shadow slot. The normal-stack traffic is left in
//! place; the shadow copy is additive on the way in and authoritative on
//! the way out.

use pavise_mir::{
    imm::is_t2_so_imm, Cond, Function, InstData, InstFlags, InstId, Opcode, Operand, Reg,
};
use smallvec::SmallVec;

use crate::{
    diag::{Diag, DiagSink},
    itblock,
    liveness::{self, RegBank},
};

/// Spilled around the synthesized sequence when no register is free.
const FALLBACK_SCRATCH: Reg = Reg::R4;

/// Configuration threaded in by the host's option system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowStackConfig {
    /// Byte displacement of the shadow region from Sp.
    pub offset: i32,
    /// Use the inverted addressing mode: compute the shadow address into
    /// the scratch register and store with an unprivileged store, for
    /// configurations where the normal stack is write-protected and only
    /// unprivileged stores may reach the shadow region.
    pub invert: bool,
}

impl Default for ShadowStackConfig {
    fn default() -> Self {
        Self {
            offset: 14_680_064,
            invert: false,
        }
    }
}

/// The recognized stack idioms, resolved once during the scan phase so the
/// rewrite logic dispatches on a closed set instead of raw opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StackIdiom {
    /// Pre-decrement store to Sp acting as a push.
    StorePre,
    /// Store-multiple with Sp writeback acting as a push.
    StoreMultiDec,
    /// A push proper.
    Push,
    /// Post-increment load from Sp acting as a pop.
    LoadPost,
    /// Load-multiple with Sp writeback acting as a pop.
    LoadMultiInc,
    /// Load-multiple that returns by loading Pc.
    LoadMultiRet,
    /// A pop proper.
    Pop,
    /// A pop that returns by loading Pc.
    PopRet,
}

impl StackIdiom {
    fn is_push(self) -> bool {
        matches!(
            self,
            StackIdiom::StorePre | StackIdiom::StoreMultiDec | StackIdiom::Push
        )
    }
}

struct PushSite {
    inst: InstId,
    idiom: StackIdiom,
}

struct PopSite {
    inst: InstId,
    idiom: StackIdiom,
    /// Operand index of the Lr or Pc operand.
    ret_idx: usize,
}

pub struct ShadowStackPass {
    config: ShadowStackConfig,
}

impl ShadowStackPass {
    pub fn new(config: ShadowStackConfig) -> Self {
        Self { config }
    }

    /// Instrument one function. Returns whether anything changed.
    pub fn run(&self, func: &mut Function, diags: &mut dyn DiagSink) -> bool {
        if func.privileged {
            diags.report(Diag::PrivilegedSkipped {
                func: func.name.clone(),
            });
            return false;
        }

        // Var-sized frames are assumed to have been eliminated upstream by
        // store promotion; proceed, but say so.
        if func.frame.has_var_sized_objects {
            diags.report(Diag::VarSizedFrame {
                func: func.name.clone(),
            });
        }

        let (pushes, pops) = scan(func);

        let mut changed = false;
        for site in &pushes {
            self.setup_shadow_stack(func, site, diags);
            changed = true;
        }
        for site in &pops {
            self.pop_from_shadow_stack(func, site, diags);
            changed = true;
        }
        changed
    }

    /// Insert, before a qualifying push, a store of Lr into the shadow
    /// slot. The push itself is left untouched.
    fn setup_shadow_stack(&self, func: &mut Function, site: &PushSite, diags: &mut dyn DiagSink) {
        debug_assert!(site.idiom.is_push());

        let push = site.inst;
        let cond = func.inst(push).cond;
        let offset = self.config.offset;

        let mut seq: SmallVec<[InstData; 8]> = SmallVec::new();

        if (0..=4092).contains(&offset) && !self.config.invert {
            // Single-instruction shortcut.
            seq.push(
                InstData::new(Opcode::StrImm, cond)
                    .reg(Reg::Lr)
                    .reg(Reg::Sp)
                    .imm(offset)
                    .flags(InstFlags::SHADOW_STACK),
            );
        } else {
            let free = liveness::free_regs_before(func, push, RegBank::Any);
            let spill = free.is_empty();
            let scratch = if spill { FALLBACK_SCRATCH } else { free[0] };
            if spill {
                diags.report(Diag::NoFreeReg {
                    func: func.name.clone(),
                    inst: func.inst(push).to_string(),
                });
                seq.push(InstData::new(Opcode::Push, cond).reg(scratch));
            }

            materialize_offset(&mut seq, scratch, offset, cond);

            if self.config.invert {
                // Compute the shadow address, then store unprivileged.
                seq.push(
                    InstData::new(Opcode::AddSpReg, cond)
                        .reg(scratch)
                        .reg(Reg::Sp)
                        .reg(scratch)
                        .flags(InstFlags::SHADOW_STACK),
                );
                seq.push(
                    InstData::new(Opcode::Strt, cond)
                        .reg(Reg::Lr)
                        .reg(scratch)
                        .imm(0)
                        .flags(InstFlags::SHADOW_STACK),
                );
            } else {
                seq.push(
                    InstData::new(Opcode::StrReg, cond)
                        .reg(Reg::Lr)
                        .reg(Reg::Sp)
                        .reg(scratch)
                        .imm(0)
                        .flags(InstFlags::SHADOW_STACK),
                );
            }

            if spill {
                seq.push(InstData::new(Opcode::Pop, cond).reg(scratch));
            }
        }

        itblock::insert_insts_before(func, push, seq);
    }

    /// Insert, after a qualifying pop, a load of the return address from
    /// the shadow slot, then demote the pop so it no longer writes Pc/Lr.
    fn pop_from_shadow_stack(&self, func: &mut Function, site: &PopSite, diags: &mut dyn DiagSink) {
        debug_assert!(!site.idiom.is_push());

        let pop = site.inst;
        let cond = func.inst(pop).cond;
        let offset = self.config.offset;
        let mut ret_reg = func.inst(pop).reg_at(site.ret_idx);

        let mut seq: SmallVec<[InstData; 8]> = SmallVec::new();

        // The slot the pop would have consumed for the return address is no
        // longer trusted; skip over it.
        seq.push(
            InstData::new(Opcode::AddSpImm, cond)
                .reg(Reg::Sp)
                .reg(Reg::Sp)
                .imm(1)
                .flags(InstFlags::SHADOW_STACK),
        );

        if (0..=4092).contains(&offset) {
            let opcode = if ret_reg == Reg::Pc {
                Opcode::LdrImmRet
            } else {
                Opcode::LdrImm
            };
            seq.push(
                InstData::new(opcode, cond)
                    .reg(ret_reg)
                    .reg(Reg::Sp)
                    .imm(offset)
                    .flags(InstFlags::SHADOW_STACK),
            );
        } else {
            let free = liveness::free_regs_after(func, pop, RegBank::Any);
            let spill = free.is_empty();
            let scratch = if spill { FALLBACK_SCRATCH } else { free[0] };
            if spill {
                diags.report(Diag::NoFreeReg {
                    func: func.name.clone(),
                    inst: func.inst(pop).to_string(),
                });
                seq.push(InstData::new(Opcode::Push, cond).reg(scratch));
            }

            // The scratch register must be restored before the final control
            // transfer, so a spilled load cannot target Pc directly: route
            // the return address through Lr and return explicitly.
            let need_return = spill && ret_reg == Reg::Pc;
            if need_return {
                ret_reg = Reg::Lr;
                func.frame.mark_restored(Reg::Lr);
            }

            materialize_offset(&mut seq, scratch, offset, cond);

            let opcode = if ret_reg == Reg::Pc {
                Opcode::LdrRegRet
            } else {
                Opcode::LdrReg
            };
            seq.push(
                InstData::new(opcode, cond)
                    .reg(ret_reg)
                    .reg(Reg::Sp)
                    .reg(scratch)
                    .imm(0)
                    .flags(InstFlags::SHADOW_STACK),
            );

            if spill {
                seq.push(InstData::new(Opcode::Pop, cond).reg(scratch));
            }
            if need_return {
                seq.push(InstData::new(Opcode::BxRet, cond).flags(InstFlags::SHADOW_STACK));
            }
        }

        itblock::insert_insts_after(func, pop, seq);

        demote_pop(func, site);
    }
}

/// Encode `offset` into `scratch`: one mov when it fits a Thumb-2 modified
/// constant, otherwise a movw/movt pair (movt elided when the high half is
/// zero).
fn materialize_offset(seq: &mut SmallVec<[InstData; 8]>, scratch: Reg, offset: i32, cond: Cond) {
    if is_t2_so_imm(offset as u32) {
        seq.push(
            InstData::new(Opcode::MovImm, cond)
                .reg(scratch)
                .imm(offset)
                .flags(InstFlags::SHADOW_STACK),
        );
    } else {
        seq.push(
            InstData::new(Opcode::MovImm16, cond)
                .reg(scratch)
                .imm(offset & 0xffff)
                .flags(InstFlags::SHADOW_STACK),
        );
        if (offset >> 16) != 0 {
            seq.push(
                InstData::new(Opcode::MovTop, cond)
                    .reg(scratch)
                    .imm(offset >> 16)
                    .flags(InstFlags::SHADOW_STACK),
            );
        }
    }
}

/// Strip the Pc/Lr write from an already-instrumented pop. A pop left
/// restoring nothing disappears; a two-register load-multiple keeps its Sp
/// adjustment by degrading to a single post-increment load of the other
/// register.
fn demote_pop(func: &mut Function, site: &PopSite) {
    let pop = site.inst;
    match site.idiom {
        StackIdiom::LoadMultiRet => {
            func.inst_mut(pop).opcode = Opcode::LdmIaUpd;
            demote_load_multi(func, site);
        }
        StackIdiom::LoadMultiInc => demote_load_multi(func, site),
        StackIdiom::PopRet => {
            func.inst_mut(pop).opcode = Opcode::Pop;
            demote_pop_list(func, site);
        }
        StackIdiom::Pop => demote_pop_list(func, site),
        // A post-increment load only loads one register.
        StackIdiom::LoadPost => itblock::remove_inst(func, pop),
        StackIdiom::StorePre | StackIdiom::StoreMultiDec | StackIdiom::Push => {
            unreachable!("push idiom in pop demotion")
        }
    }
}

fn demote_load_multi(func: &mut Function, site: &PopSite) {
    let pop = site.inst;
    let data = func.inst(pop);
    // Writeback, base, and at least two loaded registers.
    assert!(data.operands.len() >= 4, "malformed load-multiple pop");

    if data.operands.len() > 4 {
        func.inst_mut(pop).operands.remove(site.ret_idx);
    } else {
        let other_idx = if site.ret_idx == 2 { 3 } else { 2 };
        let other = data.reg_at(other_idx);
        let cond = data.cond;
        let flags = data.flags;
        itblock::insert_insts_after(
            func,
            pop,
            [InstData::new(Opcode::LdrPost, cond)
                .reg(other)
                .reg(Reg::Sp)
                .reg(Reg::Sp)
                .imm(4)
                .flags(flags)],
        );
        itblock::remove_inst(func, pop);
    }
}

fn demote_pop_list(func: &mut Function, site: &PopSite) {
    let pop = site.inst;
    assert!(!func.inst(pop).operands.is_empty(), "malformed pop");

    if func.inst(pop).operands.len() > 1 {
        func.inst_mut(pop).operands.remove(site.ret_idx);
    } else {
        itblock::remove_inst(func, pop);
    }
}

/// Classify every instruction of `func` into qualifying pushes and pops.
/// Instructions the rewriter generated are tagged and never re-qualify.
fn scan(func: &Function) -> (Vec<PushSite>, Vec<PopSite>) {
    let mut pushes = Vec::new();
    let mut pops = Vec::new();

    for block in func.layout.iter_block() {
        for inst in func.layout.iter_inst(block) {
            let data = func.inst(inst);
            if data.flags.contains(InstFlags::SHADOW_STACK) {
                continue;
            }

            match data.opcode {
                // A pre-decrement store or store-multiple only acts as a
                // push when it writes Sp back.
                Opcode::StrPre | Opcode::StmDbUpd if data.reg_at(0) != Reg::Sp => {}
                Opcode::StrPre | Opcode::StmDbUpd | Opcode::Push => {
                    // Lr can appear as a plain GPR outside the prologue, in
                    // which case it holds no return address.
                    if data.flags.contains(InstFlags::FRAME_SETUP)
                        && data.reg_operands().any(|reg| reg == Reg::Lr)
                    {
                        pushes.push(PushSite {
                            inst,
                            idiom: push_idiom(data.opcode),
                        });
                    }
                }

                Opcode::LdrPost | Opcode::LdmIaUpd | Opcode::LdmIaRet
                    if data.reg_at(1) != Reg::Sp => {}
                Opcode::LdrPost
                | Opcode::LdmIaUpd
                | Opcode::LdmIaRet
                | Opcode::Pop
                | Opcode::PopRet => {
                    if data.flags.contains(InstFlags::FRAME_DESTROY) {
                        let ret = data.operands.iter().position(|op| {
                            matches!(op, Operand::Reg(Reg::Lr) | Operand::Reg(Reg::Pc))
                        });
                        if let Some(ret_idx) = ret {
                            pops.push(PopSite {
                                inst,
                                idiom: pop_idiom(data.opcode),
                                ret_idx,
                            });
                        }
                    }
                }

                _ => {}
            }
        }
    }

    (pushes, pops)
}

fn push_idiom(opcode: Opcode) -> StackIdiom {
    match opcode {
        Opcode::StrPre => StackIdiom::StorePre,
        Opcode::StmDbUpd => StackIdiom::StoreMultiDec,
        Opcode::Push => StackIdiom::Push,
        _ => unreachable!("not a push opcode"),
    }
}

fn pop_idiom(opcode: Opcode) -> StackIdiom {
    match opcode {
        Opcode::LdrPost => StackIdiom::LoadPost,
        Opcode::LdmIaUpd => StackIdiom::LoadMultiInc,
        Opcode::LdmIaRet => StackIdiom::LoadMultiRet,
        Opcode::Pop => StackIdiom::Pop,
        Opcode::PopRet => StackIdiom::PopRet,
        _ => unreachable!("not a pop opcode"),
    }
}
