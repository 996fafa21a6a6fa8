//! Thumb-2 core registers and register sets.

use core::fmt;

/// One of the 16 Thumb-2 core registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Reg {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    R12,
    Sp,
    Lr,
    Pc,
}

impl Reg {
    /// The low GPRs usable by 16-bit Thumb encodings.
    pub const LOW: [Reg; 8] = [
        Reg::R0,
        Reg::R1,
        Reg::R2,
        Reg::R3,
        Reg::R4,
        Reg::R5,
        Reg::R6,
        Reg::R7,
    ];

    /// High registers that are still eligible as scratch registers for
    /// 32-bit encodings. Sp and Pc are never handed out.
    pub const HIGH_SCRATCH: [Reg; 6] = [Reg::R8, Reg::R9, Reg::R10, Reg::R11, Reg::R12, Reg::Lr];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(idx: usize) -> Self {
        assert!(idx < 16, "register index out of range: {idx}");
        match idx {
            0 => Reg::R0,
            1 => Reg::R1,
            2 => Reg::R2,
            3 => Reg::R3,
            4 => Reg::R4,
            5 => Reg::R5,
            6 => Reg::R6,
            7 => Reg::R7,
            8 => Reg::R8,
            9 => Reg::R9,
            10 => Reg::R10,
            11 => Reg::R11,
            12 => Reg::R12,
            13 => Reg::Sp,
            14 => Reg::Lr,
            _ => Reg::Pc,
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::Sp => write!(f, "sp"),
            Reg::Lr => write!(f, "lr"),
            Reg::Pc => write!(f, "pc"),
            r => write!(f, "r{}", r.index()),
        }
    }
}

/// A set of [`Reg`], represented as a 16-bit mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegSet(u16);

impl RegSet {
    pub fn new() -> Self {
        Self(0)
    }

    /// All 16 core registers.
    pub fn all() -> Self {
        Self(u16::MAX)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn insert(&mut self, reg: Reg) {
        self.0 |= 1 << reg.index();
    }

    pub fn remove(&mut self, reg: Reg) {
        self.0 &= !(1 << reg.index());
    }

    pub fn contains(self, reg: Reg) -> bool {
        self.0 & (1 << reg.index()) != 0
    }

    /// Iterate the members in ascending register number.
    pub fn iter(self) -> impl Iterator<Item = Reg> {
        (0..16).filter(move |i| self.0 & (1 << i) != 0).map(Reg::from_index)
    }
}

impl From<&[Reg]> for RegSet {
    fn from(regs: &[Reg]) -> Self {
        regs.iter().copied().collect()
    }
}

impl FromIterator<Reg> for RegSet {
    fn from_iter<I: IntoIterator<Item = Reg>>(iter: I) -> Self {
        let mut set = RegSet::new();
        for reg in iter {
            set.insert(reg);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_ops() {
        let mut set = RegSet::new();
        assert!(set.is_empty());

        set.insert(Reg::R0);
        set.insert(Reg::Lr);
        set.insert(Reg::Sp);
        assert_eq!(set.len(), 3);
        assert!(set.contains(Reg::Lr));
        assert!(!set.contains(Reg::Pc));

        set.remove(Reg::R0);
        assert!(!set.contains(Reg::R0));

        let regs: Vec<_> = set.iter().collect();
        assert_eq!(regs, vec![Reg::Sp, Reg::Lr]);
    }

    #[test]
    fn test_from_slice_and_all() {
        let set = RegSet::from([Reg::R1, Reg::R2, Reg::R2].as_slice());
        assert_eq!(set.len(), 2);
        assert_eq!(RegSet::all().len(), 16);
    }
}
