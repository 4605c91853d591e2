use nalgebra::Point3;
use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt;

use crate::core::utils::identifiers::{is_heavy_element, is_hydrogen_element, is_virtual_element};

/// Backbone chemistry family; selects how mainchain torsion atoms are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackboneFamily {
    /// Alpha-peptides and nucleic acids; mainchain torsions follow the ordered mainchain list.
    Standard,
    /// Beta-amino acids with an extra methylene (`CM`) between `CA` and `C`.
    BetaPeptide,
    /// Oligoureas: `N-CA-CM-NU-C(=O)` repeat units.
    Oligourea,
    /// No polymer backbone (ligands, ions).
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Representation {
    #[default]
    FullAtom,
    Centroid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    LowerTerminus,
    UpperTerminus,
    Disulfide,
    CutpointLower,
    CutpointUpper,
}

impl VariantKind {
    pub fn as_str(self) -> &'static str {
        match self {
            VariantKind::LowerTerminus => "lower_terminus",
            VariantKind::UpperTerminus => "upper_terminus",
            VariantKind::Disulfide => "disulfide",
            VariantKind::CutpointLower => "cutpoint_lower",
            VariantKind::CutpointUpper => "cutpoint_upper",
        }
    }
}

impl fmt::Display for VariantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    Lower,
    Upper,
    Branch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AtomTemplate {
    pub name: String,
    pub element: String,
    pub ideal: Point3<f64>,
}

impl AtomTemplate {
    pub fn is_hydrogen(&self) -> bool {
        is_hydrogen_element(&self.element)
    }

    pub fn is_virtual(&self) -> bool {
        is_virtual_element(&self.element)
    }

    pub fn is_heavy(&self) -> bool {
        is_heavy_element(&self.element)
    }
}

/// Internal coordinate of an atom: `dihedral(stub[2], stub[1], stub[0], atom)`,
/// `angle(stub[1], stub[0], atom)` and `|atom - stub[0]|`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InternalCoordinate {
    pub stub: [usize; 3],
    pub distance: f64,
    pub angle: f64,
    pub dihedral: f64,
}

/// A declared inter-residue connection point with its ideal partner geometry.
///
/// The partner atom sits at `distance` from `atom`, makes `angle` with `stub[0]` and has
/// `dihedral` about `stub[1] - stub[0] - atom`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionTemplate {
    pub kind: ConnectionKind,
    pub atom: usize,
    pub stub: [usize; 2],
    pub distance: f64,
    pub angle: f64,
    pub dihedral: f64,
}

/// Immutable, shared description of one residue chemistry.
///
/// Atom numbers are 1-based everywhere in the public API.
#[derive(Debug, Clone, PartialEq)]
pub struct ResidueTemplate {
    pub(crate) name: String,
    pub(crate) base_name: String,
    pub(crate) name1: Option<char>,
    pub(crate) family: BackboneFamily,
    pub(crate) representation: Representation,
    pub(crate) variants: Vec<VariantKind>,
    pub(crate) atoms: Vec<AtomTemplate>,
    pub(crate) icoor: Vec<Option<InternalCoordinate>>,
    pub(crate) bonds: Vec<Vec<usize>>,
    pub(crate) mainchain: Vec<usize>,
    pub(crate) chi: Vec<[usize; 4]>,
    pub(crate) nu: Vec<[usize; 4]>,
    pub(crate) connections: Vec<ConnectionTemplate>,
    pub(crate) root_atom: usize,
    pub(crate) nbr_atom: usize,
    pub(crate) nbr_radius: f64,
    pub(crate) thiol_atom: Option<usize>,
    pub(crate) lower_cap: Option<usize>,
    pub(crate) upper_cap: Option<usize>,
    pub(crate) lower_placeholders: Vec<usize>,
    pub(crate) upper_placeholders: Vec<usize>,
}

impl ResidueTemplate {
    /// Full name, including variant suffixes (e.g. `CYS:disulfide`).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn name1(&self) -> Option<char> {
        self.name1
    }

    pub fn family(&self) -> BackboneFamily {
        self.family
    }

    pub fn representation(&self) -> Representation {
        self.representation
    }

    pub fn variants(&self) -> &[VariantKind] {
        &self.variants
    }

    pub fn has_variant(&self, variant: VariantKind) -> bool {
        self.variants.contains(&variant)
    }

    pub fn natoms(&self) -> usize {
        self.atoms.len()
    }

    pub fn atom(&self, atomno: usize) -> &AtomTemplate {
        &self.atoms[atomno - 1]
    }

    pub fn atoms(&self) -> &[AtomTemplate] {
        &self.atoms
    }

    pub fn atom_index(&self, name: &str) -> Option<usize> {
        let name = name.trim();
        self.atoms
            .iter()
            .position(|a| a.name == name)
            .map(|i| i + 1)
    }

    pub fn atom_name(&self, atomno: usize) -> &str {
        &self.atoms[atomno - 1].name
    }

    pub fn icoor(&self, atomno: usize) -> Option<&InternalCoordinate> {
        self.icoor[atomno - 1].as_ref()
    }

    pub fn bonded_neighbors(&self, atomno: usize) -> &[usize] {
        &self.bonds[atomno - 1]
    }

    pub fn mainchain(&self) -> &[usize] {
        &self.mainchain
    }

    pub fn is_mainchain_atom(&self, atomno: usize) -> bool {
        self.mainchain.contains(&atomno)
    }

    pub fn chi_atoms(&self) -> &[[usize; 4]] {
        &self.chi
    }

    pub fn nu_atoms(&self) -> &[[usize; 4]] {
        &self.nu
    }

    pub fn n_connections(&self) -> usize {
        self.connections.len()
    }

    /// Connection template by 1-based connection id.
    pub fn connection(&self, connid: usize) -> &ConnectionTemplate {
        &self.connections[connid - 1]
    }

    pub fn connections(&self) -> &[ConnectionTemplate] {
        &self.connections
    }

    fn connection_of_kind(&self, kind: ConnectionKind) -> Option<usize> {
        self.connections
            .iter()
            .position(|c| c.kind == kind)
            .map(|i| i + 1)
    }

    /// Connection id of the polymer lower connection, if the chemistry has one.
    pub fn lower_connect(&self) -> Option<usize> {
        self.connection_of_kind(ConnectionKind::Lower)
    }

    pub fn upper_connect(&self) -> Option<usize> {
        self.connection_of_kind(ConnectionKind::Upper)
    }

    /// Connection ids of all non-polymer connection points, in declaration order.
    pub fn branch_connections(&self) -> Vec<usize> {
        self.connections
            .iter()
            .enumerate()
            .filter(|(_, c)| c.kind == ConnectionKind::Branch)
            .map(|(i, _)| i + 1)
            .collect()
    }

    /// Connection ids whose anchor atom is `atomno`.
    pub fn connections_at_atom(&self, atomno: usize) -> Vec<usize> {
        self.connections
            .iter()
            .enumerate()
            .filter(|(_, c)| c.atom == atomno)
            .map(|(i, _)| i + 1)
            .collect()
    }

    pub fn is_polymer(&self) -> bool {
        self.family != BackboneFamily::None
    }

    pub fn root_atom(&self) -> usize {
        self.root_atom
    }

    pub fn nbr_atom(&self) -> usize {
        self.nbr_atom
    }

    pub fn nbr_radius(&self) -> f64 {
        self.nbr_radius
    }

    pub fn thiol_atom(&self) -> Option<usize> {
        self.thiol_atom
    }

    pub fn lower_cap(&self) -> Option<usize> {
        self.lower_cap
    }

    pub fn upper_cap(&self) -> Option<usize> {
        self.upper_cap
    }

    /// Virtual atoms standing in for the previous residue across a cut.
    pub fn lower_placeholders(&self) -> &[usize] {
        &self.lower_placeholders
    }

    /// Virtual atoms standing in for the next residue across a cut.
    pub fn upper_placeholders(&self) -> &[usize] {
        &self.upper_placeholders
    }

    pub fn ideal_coordinates(&self) -> Vec<Point3<f64>> {
        self.atoms.iter().map(|a| a.ideal).collect()
    }

    /// Number of bonds on the shortest intra-residue path between two atoms.
    pub fn path_distance(&self, from: usize, to: usize) -> Option<usize> {
        if from == to {
            return Some(0);
        }
        let mut dist = vec![usize::MAX; self.natoms()];
        let mut queue = VecDeque::from([from]);
        dist[from - 1] = 0;
        while let Some(atom) = queue.pop_front() {
            for &next in self.bonded_neighbors(atom) {
                if dist[next - 1] == usize::MAX {
                    dist[next - 1] = dist[atom - 1] + 1;
                    if next == to {
                        return Some(dist[next - 1]);
                    }
                    queue.push_back(next);
                }
            }
        }
        None
    }

    /// Heavy bonded neighbours of `atomno`, mainchain atoms first, then by atom number.
    pub fn heavy_neighbors(&self, atomno: usize) -> Vec<usize> {
        let mut neighbors: Vec<usize> = self
            .bonded_neighbors(atomno)
            .iter()
            .copied()
            .filter(|&n| self.atom(n).is_heavy())
            .collect();
        neighbors.sort_by_key(|&n| (!self.is_mainchain_atom(n), n));
        neighbors
    }
}
