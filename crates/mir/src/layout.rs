//! Block and instruction ordering.
//!
//! Blocks are kept in simple append order; nothing in the instrumentation
//! passes reorders them. Instruction order within a block is an intrusive
//! doubly-linked list so that splicing next to an arbitrary instruction is
//! O(1) and never invalidates other instruction ids.

use cranelift_entity::SecondaryMap;

use crate::{function::BlockId, inst::InstId};

#[derive(Debug, Clone, Default)]
pub struct Layout {
    block_order: Vec<BlockId>,
    blocks: SecondaryMap<BlockId, BlockNode>,
    insts: SecondaryMap<InstId, InstNode>,
}

impl Layout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_block(&mut self, block: BlockId) {
        debug_assert!(!self.is_block_inserted(block));

        self.blocks[block] = BlockNode {
            inserted: true,
            ..BlockNode::default()
        };
        self.block_order.push(block);
    }

    pub fn is_block_inserted(&self, block: BlockId) -> bool {
        self.blocks[block].inserted
    }

    pub fn is_block_empty(&self, block: BlockId) -> bool {
        self.first_inst_of(block).is_none()
    }

    pub fn iter_block(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.block_order.iter().copied()
    }

    pub fn first_inst_of(&self, block: BlockId) -> Option<InstId> {
        debug_assert!(self.is_block_inserted(block));
        self.blocks[block].first_inst
    }

    pub fn last_inst_of(&self, block: BlockId) -> Option<InstId> {
        debug_assert!(self.is_block_inserted(block));
        self.blocks[block].last_inst
    }

    pub fn prev_inst_of(&self, inst: InstId) -> Option<InstId> {
        debug_assert!(self.is_inst_inserted(inst));
        self.insts[inst].prev
    }

    pub fn next_inst_of(&self, inst: InstId) -> Option<InstId> {
        debug_assert!(self.is_inst_inserted(inst));
        self.insts[inst].next
    }

    pub fn inst_block(&self, inst: InstId) -> BlockId {
        debug_assert!(self.is_inst_inserted(inst));
        self.insts[inst].block.unwrap()
    }

    pub fn is_inst_inserted(&self, inst: InstId) -> bool {
        self.insts[inst].block.is_some()
    }

    pub fn iter_inst(&self, block: BlockId) -> impl Iterator<Item = InstId> + '_ {
        debug_assert!(self.is_block_inserted(block));
        InstIter {
            next: self.blocks[block].first_inst,
            insts: &self.insts,
        }
    }

    pub fn append_inst(&mut self, inst: InstId, block: BlockId) {
        debug_assert!(self.is_block_inserted(block));
        debug_assert!(!self.is_inst_inserted(inst));

        let block_node = &mut self.blocks[block];
        let mut inst_node = InstNode::with_block(block);

        if let Some(last_inst) = block_node.last_inst {
            inst_node.prev = Some(last_inst);
            self.insts[last_inst].next = Some(inst);
        } else {
            block_node.first_inst = Some(inst);
        }

        block_node.last_inst = Some(inst);
        self.insts[inst] = inst_node;
    }

    pub fn insert_inst_before(&mut self, inst: InstId, before: InstId) {
        debug_assert!(self.is_inst_inserted(before));
        debug_assert!(!self.is_inst_inserted(inst));

        let before_node = &self.insts[before];
        let block = before_node.block.unwrap();
        let mut inst_node = InstNode::with_block(block);

        match before_node.prev {
            Some(prev) => {
                inst_node.prev = Some(prev);
                self.insts[prev].next = Some(inst);
            }
            None => self.blocks[block].first_inst = Some(inst),
        }
        inst_node.next = Some(before);
        self.insts[before].prev = Some(inst);
        self.insts[inst] = inst_node;
    }

    pub fn insert_inst_after(&mut self, inst: InstId, after: InstId) {
        debug_assert!(self.is_inst_inserted(after));
        debug_assert!(!self.is_inst_inserted(inst));

        let after_node = &self.insts[after];
        let block = after_node.block.unwrap();
        let mut inst_node = InstNode::with_block(block);

        match after_node.next {
            Some(next) => {
                inst_node.next = Some(next);
                self.insts[next].prev = Some(inst);
            }
            None => self.blocks[block].last_inst = Some(inst),
        }
        inst_node.prev = Some(after);
        self.insts[after].next = Some(inst);
        self.insts[inst] = inst_node;
    }

    /// Remove an instruction from the layout. The instruction's data stays
    /// allocated; only its position is forgotten.
    pub fn remove_inst(&mut self, inst: InstId) {
        debug_assert!(self.is_inst_inserted(inst));

        let inst_node = &self.insts[inst];
        let block_node = &mut self.blocks[inst_node.block.unwrap()];
        let prev_inst = inst_node.prev;
        let next_inst = inst_node.next;
        match (prev_inst, next_inst) {
            (Some(prev), Some(next)) => {
                self.insts[prev].next = Some(next);
                self.insts[next].prev = Some(prev);
            }
            (Some(prev), None) => {
                self.insts[prev].next = None;
                block_node.last_inst = Some(prev);
            }
            (None, Some(next)) => {
                self.insts[next].prev = None;
                block_node.first_inst = Some(next);
            }
            (None, None) => {
                block_node.first_inst = None;
                block_node.last_inst = None;
            }
        }

        self.insts[inst] = InstNode::default();
    }
}

struct InstIter<'a> {
    next: Option<InstId>,
    insts: &'a SecondaryMap<InstId, InstNode>,
}

impl Iterator for InstIter<'_> {
    type Item = InstId;

    fn next(&mut self) -> Option<InstId> {
        let next = self.next?;
        self.next = self.insts[next].next;
        Some(next)
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
struct BlockNode {
    inserted: bool,
    first_inst: Option<InstId>,
    last_inst: Option<InstId>,
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
struct InstNode {
    /// The block in which the inst exists.
    block: Option<BlockId>,
    prev: Option<InstId>,
    next: Option<InstId>,
}

impl InstNode {
    fn with_block(block: BlockId) -> Self {
        Self {
            block: Some(block),
            prev: None,
            next: None,
        }
    }
}
