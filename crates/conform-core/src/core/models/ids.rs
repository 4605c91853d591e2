use slotmap::new_key_type;
use std::fmt;

new_key_type! {
    /// Generational handle to a residue slot.
    ///
    /// Sequence positions shift on every insertion or deletion; a `ResidueKey` stays attached to
    /// the same residue until it is deleted, after which lookups through it fail.
    pub struct ResidueKey;
}

/// Address of a single atom: 1-based residue position and 1-based atom index within the residue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtomId {
    pub rsd: usize,
    pub atomno: usize,
}

impl AtomId {
    pub const fn new(rsd: usize, atomno: usize) -> Self {
        Self { rsd, atomno }
    }
}

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rsd, self.atomno)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DofType {
    Distance,
    BondAngle,
    Torsion,
}

/// One scalar internal coordinate stored on an atom-tree node.
///
/// Angles are in radians, distances in Angstroms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DofId {
    pub atom: AtomId,
    pub kind: DofType,
}

impl DofId {
    pub const fn new(atom: AtomId, kind: DofType) -> Self {
        Self { atom, kind }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TorsionType {
    Backbone,
    Chi,
    Nu,
    Branch,
    Jump,
}

/// Symbolic torsion: residue position, torsion class and 1-based index within the class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TorsionId {
    pub rsd: usize,
    pub kind: TorsionType,
    pub index: usize,
}

impl TorsionId {
    pub const fn new(rsd: usize, kind: TorsionType, index: usize) -> Self {
        Self { rsd, kind, index }
    }

    pub const fn backbone(rsd: usize, index: usize) -> Self {
        Self::new(rsd, TorsionType::Backbone, index)
    }

    pub const fn chi(rsd: usize, index: usize) -> Self {
        Self::new(rsd, TorsionType::Chi, index)
    }

    pub const fn nu(rsd: usize, index: usize) -> Self {
        Self::new(rsd, TorsionType::Nu, index)
    }
}

impl fmt::Display for TorsionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}{}@{}", self.kind, self.index, self.rsd)
    }
}
