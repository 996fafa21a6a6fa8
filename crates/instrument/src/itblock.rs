//! Predication-preserving editing of instruction sequences.
//!
//! An IT marker makes up to four following non-meta instructions
//! conditional: each either shares the marker's base condition or runs
//! under its opposite, as encoded by a 4-bit hardware mask. Splicing or
//! deleting instructions inside such a region invalidates the mask, so
//! every edit next to a possibly-predicated instruction must go through
//! the helpers here, which re-cover the affected span with freshly
//! encoded markers.
//!
//! The marker covering an instruction is always recomputed with
//! [`find_it`] (a backward walk bounded at four non-meta steps), never
//! cached: block edits would invalidate any stored association.

use std::collections::VecDeque;

use pavise_mir::{Function, InstData, InstId, Opcode, Operand};
use smallvec::{smallvec, SmallVec};

/// A decoded IT mask: one tag per covered instruction, `true` meaning the
/// instruction runs under the marker's base condition, `false` under its
/// opposite. The first tag is always `true`.
pub type ItMask = SmallVec<[bool; 4]>;

/// Decode a 4-bit hardware mask into its tag sequence.
///
/// The position of the lowest set bit gives the region length; the bits
/// above it, read high to low, give the tags of the second and later
/// instructions (clear = same as the base condition).
pub fn decode_it_mask(mask: u8) -> ItMask {
    let mask = mask & 0xf;
    assert!(mask != 0, "invalid IT mask");

    let mut tags: ItMask = smallvec![true];
    let size = 4 - mask.trailing_zeros() as usize;
    for i in ((5 - size)..4).rev() {
        tags.push(mask & (1 << i) == 0);
    }
    tags
}

/// Encode a tag sequence back into the 4-bit hardware mask; exact inverse
/// of [`decode_it_mask`].
pub fn encode_it_mask(tags: &[bool]) -> u8 {
    assert!(
        !tags.is_empty() && tags.len() <= 4,
        "invalid IT tag sequence length"
    );
    assert!(tags[0], "first IT tag must match the base condition");

    let mut mask = 0u8;
    for &tag in &tags[1..] {
        mask |= u8::from(!tag);
        mask <<= 1;
    }
    mask |= 1;
    mask << (4 - tags.len())
}

/// How many predicated instructions an IT marker covers.
pub fn it_block_size(it: &InstData) -> usize {
    assert!(it.opcode == Opcode::It, "not an IT marker");
    let mask = it.imm_at(0) as u8 & 0xf;
    assert!(mask != 0, "invalid IT mask");
    4 - mask.trailing_zeros() as usize
}

/// Find the IT marker whose region contains `inst`, together with the
/// distance between them in non-meta instructions (0 means `inst` is the
/// marker itself). The walk is bounded at four steps.
pub fn find_it(func: &Function, inst: InstId) -> Option<(InstId, usize)> {
    let mut cur = Some(inst);
    let mut dist = 0;
    while let Some(id) = cur {
        let data = func.inst(id);
        if data.opcode == Opcode::It {
            if it_block_size(data) >= dist {
                return Some((id, dist));
            }
            return None;
        }
        if !data.is_meta() {
            dist += 1;
        }
        if dist >= 5 {
            return None;
        }
        cur = func.layout.prev_inst_of(id);
    }
    None
}

/// Splice `seq` immediately before `at`, keeping any enclosing IT region
/// consistent. Returns the ids of the newly created instructions.
pub fn insert_insts_before(
    func: &mut Function,
    at: InstId,
    seq: impl IntoIterator<Item = InstData>,
) -> SmallVec<[InstId; 8]> {
    assert!(!func.inst(at).is_meta(), "cannot instrument a meta instruction");

    let found = find_it(func, at);

    let mut new_ids: SmallVec<[InstId; 8]> = SmallVec::new();
    for data in seq {
        let id = func.make_inst(data);
        func.layout.insert_inst_before(id, at);
        new_ids.push(id);
    }

    if let Some((it, distance)) = found {
        if distance != 0 {
            recover_coverage(func, it, distance, &new_ids, SplicePoint::Before);
        }
    }

    new_ids
}

/// Splice `seq` immediately after `at`, keeping any enclosing IT region
/// consistent. Returns the ids of the newly created instructions.
pub fn insert_insts_after(
    func: &mut Function,
    at: InstId,
    seq: impl IntoIterator<Item = InstData>,
) -> SmallVec<[InstId; 8]> {
    assert!(!func.inst(at).is_meta(), "cannot instrument a meta instruction");

    let found = find_it(func, at);

    let mut new_ids: SmallVec<[InstId; 8]> = SmallVec::new();
    let mut anchor = at;
    for data in seq {
        let id = func.make_inst(data);
        func.layout.insert_inst_after(id, anchor);
        anchor = id;
        new_ids.push(id);
    }

    if let Some((it, distance)) = found {
        if distance != 0 {
            recover_coverage(func, it, distance, &new_ids, SplicePoint::After);
        }
    }

    new_ids
}

/// Remove `inst`, updating or removing the IT marker covering it. `inst`
/// must not itself be an IT marker.
pub fn remove_inst(func: &mut Function, inst: InstId) {
    assert!(!func.inst(inst).is_meta(), "cannot instrument a meta instruction");

    if let Some((it, distance)) = find_it(func, inst) {
        assert!(distance != 0, "cannot remove an IT marker directly");

        let mut tags = decode_it_mask(func.inst(it).imm_at(0) as u8);
        tags.remove(distance - 1);

        if tags.is_empty() {
            func.layout.remove_inst(it);
        } else {
            // Dropping the first instruction may leave an "opposite" tag in
            // front; flip the whole sequence and the base condition so the
            // first tag stays "same".
            if !tags[0] {
                for tag in tags.iter_mut() {
                    *tag = !*tag;
                }
                let flipped = func.inst(it).cond.opposite();
                func.inst_mut(it).cond = flipped;
            }
            let mask = encode_it_mask(&tags);
            func.inst_mut(it).operands[0] = Operand::Imm(mask as i32);
        }
    }

    func.layout.remove_inst(inst);
}

#[derive(Clone, Copy)]
enum SplicePoint {
    Before,
    After,
}

/// Re-cover the predicated span around a splice at distance `distance`
/// from the marker `it`. The new instructions are already in the layout;
/// the original marker is replaced by one fresh marker per chunk of at
/// most four non-meta instructions.
fn recover_coverage(
    func: &mut Function,
    it: InstId,
    distance: usize,
    new_ids: &[InstId],
    point: SplicePoint,
) {
    let base_cond = func.inst(it).cond;
    let mut tags: VecDeque<bool> = decode_it_mask(func.inst(it).imm_at(0) as u8).into_iter().collect();

    // The spliced instructions inherit the tag of the instruction they were
    // placed next to.
    let same_as_first = tags[distance - 1];
    let splice_at = match point {
        SplicePoint::Before => distance - 1,
        SplicePoint::After => distance,
    };
    let new_real = new_ids.iter().filter(|id| !func.inst(**id).is_meta()).count();
    for _ in 0..new_real {
        tags.insert(splice_at, same_as_first);
    }

    // Collect the span to re-cover: everything from right after the marker
    // through the last predicated instruction, interleaved metas included.
    let total = tags.len();
    let mut span: SmallVec<[InstId; 8]> = SmallVec::new();
    let mut seen = 0;
    let mut cur = func.layout.next_inst_of(it);
    while seen < total {
        let id = cur.expect("IT region extends past the end of its block");
        span.push(id);
        if !func.inst(id).is_meta() {
            seen += 1;
        }
        cur = func.layout.next_inst_of(id);
    }

    // Emit one marker per chunk of at most four non-meta instructions. A
    // chunk whose first tag is "opposite" is flipped wholesale and gets the
    // opposite base condition.
    let mut idx = 0;
    while idx < span.len() {
        let chunk_start = span[idx];
        let mut chunk: ItMask = SmallVec::new();
        while idx < span.len() && chunk.len() < 4 {
            let id = span[idx];
            idx += 1;
            if func.inst(id).is_meta() {
                continue;
            }
            chunk.push(tags.pop_front().expect("tag sequence shorter than span"));
        }

        let mut cond = base_cond;
        if !chunk[0] {
            for tag in chunk.iter_mut() {
                *tag = !*tag;
            }
            cond = base_cond.opposite();
        }

        let marker = func.make_inst(
            InstData::new(Opcode::It, cond).imm(encode_it_mask(&chunk) as i32),
        );
        func.layout.insert_inst_before(marker, chunk_start);
    }

    func.layout.remove_inst(it);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pavise_mir::{BlockId, Cond, InstFlags, Reg};

    /// Build a block holding an IT region: the marker plus one `mov`-style
    /// instruction per tag, predicated accordingly.
    fn region(func: &mut Function, cond: Cond, tags: &[bool]) -> (BlockId, InstId, Vec<InstId>) {
        let block = func.make_block();
        func.layout.append_block(block);

        let it = func.make_inst(
            InstData::new(Opcode::It, cond).imm(encode_it_mask(tags) as i32),
        );
        func.layout.append_inst(it, block);

        let mut covered = Vec::new();
        for (i, tag) in tags.iter().enumerate() {
            let inst_cond = if *tag { cond } else { cond.opposite() };
            let inst = func.make_inst(
                InstData::new(Opcode::MovImm, inst_cond)
                    .reg(Reg::from_index(i))
                    .imm(i as i32),
            );
            func.layout.append_inst(inst, block);
            covered.push(inst);
        }
        (block, it, covered)
    }

    /// Walk a block and compute, for every non-meta non-marker instruction,
    /// the effective condition its covering marker assigns (or `None` when
    /// unpredicated).
    fn effective_conds(func: &Function, block: BlockId) -> Vec<(InstId, Option<Cond>)> {
        let mut out = Vec::new();
        let mut pending: VecDeque<Cond> = VecDeque::new();
        for inst in func.layout.iter_inst(block) {
            let data = func.inst(inst);
            if data.is_meta() {
                continue;
            }
            if data.opcode == Opcode::It {
                assert!(pending.is_empty(), "overlapping IT regions");
                for tag in decode_it_mask(data.imm_at(0) as u8) {
                    pending.push_back(if tag { data.cond } else { data.cond.opposite() });
                }
                continue;
            }
            out.push((inst, pending.pop_front()));
        }
        assert!(pending.is_empty(), "IT region not fully covered");
        out
    }

    #[test]
    fn test_mask_round_trip() {
        for mask in 1..=15u8 {
            assert_eq!(encode_it_mask(&decode_it_mask(mask)), mask);
        }
    }

    #[test]
    fn test_tag_round_trip() {
        let seqs: &[&[bool]] = &[
            &[true],
            &[true, true],
            &[true, false],
            &[true, false, true],
            &[true, true, false, true],
            &[true, false, false, false],
        ];
        for tags in seqs {
            let decoded = decode_it_mask(encode_it_mask(tags));
            assert_eq!(decoded.as_slice(), *tags);
        }
    }

    #[test]
    #[should_panic]
    fn test_zero_mask_is_fatal() {
        decode_it_mask(0);
    }

    #[test]
    #[should_panic]
    fn test_opposite_leading_tag_is_fatal() {
        encode_it_mask(&[false, true]);
    }

    #[test]
    fn test_find_it_at_marker() {
        let mut func = Function::new("f");
        let (_, it, covered) = region(&mut func, Cond::Eq, &[true, false]);

        assert_eq!(find_it(&func, it), Some((it, 0)));
        assert_eq!(find_it(&func, covered[0]), Some((it, 1)));
        assert_eq!(find_it(&func, covered[1]), Some((it, 2)));
    }

    #[test]
    fn test_find_it_outside_region() {
        let mut func = Function::new("f");
        let (block, it, _) = region(&mut func, Cond::Eq, &[true, true]);

        // A third instruction behind a two-element region is not covered.
        let loose = func.make_inst(InstData::new(Opcode::MovImm, Cond::Al).reg(Reg::R5).imm(0));
        func.layout.append_inst(loose, block);
        assert_eq!(find_it(&func, loose), None);
        assert_eq!(find_it(&func, it), Some((it, 0)));
    }

    #[test]
    fn test_find_it_skips_meta() {
        let mut func = Function::new("f");
        let (_, it, covered) = region(&mut func, Cond::Eq, &[true, true]);

        let cfi = func.make_inst(InstData::new(Opcode::Cfi, Cond::Al));
        func.layout.insert_inst_after(cfi, covered[0]);
        assert_eq!(find_it(&func, covered[1]), Some((it, 2)));
    }

    #[test]
    fn test_insert_before_extends_region() {
        let mut func = Function::new("f");
        let (block, _, covered) = region(&mut func, Cond::Eq, &[true, false, true]);

        let new = insert_insts_before(
            &mut func,
            covered[1],
            [InstData::new(Opcode::MovImm, Cond::Ne).reg(Reg::R6).imm(0)],
        );

        let conds = effective_conds(&func, block);
        assert_eq!(conds.len(), 4);
        assert_eq!(conds[0], (covered[0], Some(Cond::Eq)));
        assert_eq!(conds[1], (new[0], Some(Cond::Ne)));
        assert_eq!(conds[2], (covered[1], Some(Cond::Ne)));
        assert_eq!(conds[3], (covered[2], Some(Cond::Eq)));
    }

    #[test]
    fn test_insert_after_extends_region() {
        let mut func = Function::new("f");
        let (block, _, covered) = region(&mut func, Cond::Eq, &[true, false, true]);

        let new = insert_insts_after(
            &mut func,
            covered[1],
            [InstData::new(Opcode::MovImm, Cond::Ne).reg(Reg::R6).imm(0)],
        );

        let conds = effective_conds(&func, block);
        assert_eq!(conds.len(), 4);
        assert_eq!(conds[0], (covered[0], Some(Cond::Eq)));
        assert_eq!(conds[1], (covered[1], Some(Cond::Ne)));
        assert_eq!(conds[2], (new[0], Some(Cond::Ne)));
        assert_eq!(conds[3], (covered[2], Some(Cond::Eq)));
    }

    #[test]
    fn test_insert_splits_into_two_markers() {
        let mut func = Function::new("f");
        let (block, _, covered) = region(&mut func, Cond::Eq, &[true, true, false, false]);

        // Two more instructions in the middle force a 4 + 2 split.
        let new = insert_insts_before(
            &mut func,
            covered[1],
            [
                InstData::new(Opcode::MovImm, Cond::Eq).reg(Reg::R5).imm(0),
                InstData::new(Opcode::MovImm, Cond::Eq).reg(Reg::R6).imm(0),
            ],
        );

        let markers: Vec<_> = func
            .layout
            .iter_inst(block)
            .filter(|id| func.inst(*id).opcode == Opcode::It)
            .collect();
        assert_eq!(markers.len(), 2);

        let conds = effective_conds(&func, block);
        assert_eq!(conds.len(), 6);
        assert_eq!(conds[0], (covered[0], Some(Cond::Eq)));
        assert_eq!(conds[1], (new[0], Some(Cond::Eq)));
        assert_eq!(conds[2], (new[1], Some(Cond::Eq)));
        assert_eq!(conds[3], (covered[1], Some(Cond::Eq)));
        assert_eq!(conds[4], (covered[2], Some(Cond::Ne)));
        assert_eq!(conds[5], (covered[3], Some(Cond::Ne)));

        // The trailing chunk starts with an "opposite" instruction, so its
        // marker must carry the flipped base condition.
        assert_eq!(func.inst(markers[1]).cond, Cond::Ne);
    }

    #[test]
    fn test_insert_before_unpredicated_is_plain_splice() {
        let mut func = Function::new("f");
        let block = func.make_block();
        func.layout.append_block(block);
        let inst = func.make_inst(InstData::new(Opcode::MovImm, Cond::Al).reg(Reg::R0).imm(0));
        func.layout.append_inst(inst, block);

        let new = insert_insts_before(
            &mut func,
            inst,
            [InstData::new(Opcode::MovImm, Cond::Al).reg(Reg::R1).imm(1)],
        );

        let insts: Vec<_> = func.layout.iter_inst(block).collect();
        assert_eq!(insts, vec![new[0], inst]);
    }

    #[test]
    fn test_remove_sole_element_removes_marker() {
        let mut func = Function::new("f");
        let (block, _, covered) = region(&mut func, Cond::Eq, &[true]);

        remove_inst(&mut func, covered[0]);
        assert!(func.layout.is_block_empty(block));
    }

    #[test]
    fn test_remove_first_flips_marker() {
        let mut func = Function::new("f");
        let (block, it, covered) = region(&mut func, Cond::Eq, &[true, false, true]);

        remove_inst(&mut func, covered[0]);

        // The region now starts with the previously-opposite instruction.
        assert_eq!(func.inst(it).cond, Cond::Ne);
        assert_eq!(
            decode_it_mask(func.inst(it).imm_at(0) as u8).as_slice(),
            &[true, false]
        );

        let conds = effective_conds(&func, block);
        assert_eq!(conds[0], (covered[1], Some(Cond::Ne)));
        assert_eq!(conds[1], (covered[2], Some(Cond::Eq)));
    }

    #[test]
    fn test_remove_middle_shrinks_mask() {
        let mut func = Function::new("f");
        let (block, it, covered) = region(&mut func, Cond::Eq, &[true, false, true]);

        remove_inst(&mut func, covered[1]);

        assert_eq!(func.inst(it).cond, Cond::Eq);
        let conds = effective_conds(&func, block);
        assert_eq!(conds.len(), 2);
        assert_eq!(conds[0], (covered[0], Some(Cond::Eq)));
        assert_eq!(conds[1], (covered[2], Some(Cond::Eq)));
    }

    #[test]
    fn test_predicated_insert_tags_flags() {
        // Inserted instructions keep their own flags; only coverage changes.
        let mut func = Function::new("f");
        let (block, _, covered) = region(&mut func, Cond::Eq, &[true, true]);

        let new = insert_insts_before(
            &mut func,
            covered[0],
            [InstData::new(Opcode::StrImm, Cond::Eq)
                .reg(Reg::Lr)
                .reg(Reg::Sp)
                .imm(4092)
                .flags(InstFlags::SHADOW_STACK)],
        );

        assert!(func.inst(new[0]).flags.contains(InstFlags::SHADOW_STACK));
        let conds = effective_conds(&func, block);
        assert_eq!(conds.len(), 3);
        assert!(conds.iter().all(|(_, c)| *c == Some(Cond::Eq)));
    }
}
