//! Function, block, and frame metadata.

use cranelift_entity::PrimaryMap;
use smallvec::SmallVec;

use crate::{inst::InstData, inst::InstId, layout::Layout, Reg, RegSet};

/// An opaque reference to a [`Block`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Copy, Hash)]
pub struct BlockId(pub u32);
cranelift_entity::entity_impl!(BlockId);

/// Per-block data. The live-out register set comes from the host's
/// liveness oracle; the instrumentation passes only read it.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub live_outs: RegSet,
}

/// A callee-saved register slot and whether the epilogue restores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalleeSaved {
    pub reg: Reg,
    pub restored: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FrameInfo {
    pub has_var_sized_objects: bool,
    pub callee_saved: SmallVec<[CalleeSaved; 8]>,
    /// Whether `callee_saved` has been populated by the host.
    pub callee_saved_valid: bool,
}

impl FrameInfo {
    pub fn mark_restored(&mut self, reg: Reg) {
        if !self.callee_saved_valid {
            return;
        }
        for slot in &mut self.callee_saved {
            if slot.reg == reg {
                slot.restored = true;
                break;
            }
        }
    }
}

/// A machine function: instruction and block storage plus layout and
/// frame metadata. Instructions are allocated here and positioned through
/// [`Layout`]; an instruction's identity is its id, not its contents.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    /// Privileged functions are exempt from instrumentation.
    pub privileged: bool,
    /// Registers the calling convention reserves; never handed out as
    /// scratch registers.
    pub reserved: RegSet,
    pub frame: FrameInfo,
    pub blocks: PrimaryMap<BlockId, Block>,
    insts: PrimaryMap<InstId, InstData>,
    pub layout: Layout,
}

impl Function {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            privileged: false,
            reserved: RegSet::from([Reg::Sp, Reg::Pc].as_slice()),
            frame: FrameInfo::default(),
            blocks: PrimaryMap::default(),
            insts: PrimaryMap::default(),
            layout: Layout::default(),
        }
    }

    pub fn make_block(&mut self) -> BlockId {
        self.blocks.push(Block::default())
    }

    pub fn make_inst(&mut self, data: InstData) -> InstId {
        self.insts.push(data)
    }

    pub fn inst(&self, inst: InstId) -> &InstData {
        &self.insts[inst]
    }

    pub fn inst_mut(&mut self, inst: InstId) -> &mut InstData {
        &mut self.insts[inst]
    }

    pub fn block(&self, block: BlockId) -> &Block {
        &self.blocks[block]
    }

    pub fn block_mut(&mut self, block: BlockId) -> &mut Block {
        &mut self.blocks[block]
    }
}
