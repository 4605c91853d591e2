use nalgebra::{Isometry3, Point3};
use slotmap::SlotMap;
use std::sync::Arc;
use tracing::{trace, warn};

use super::signals::{ConnectionKind, CoordinateRefresh, Hubs, LengthKind};
use super::torsions;
use crate::core::chemistry::registry::ChemistryRegistry;
use crate::core::kinematics::atom_tree::AtomTree;
use crate::core::kinematics::fold_tree::FoldTree;
use crate::core::kinematics::jump::{jump_component, with_jump_component};
use crate::core::models::ids::{AtomId, DofId, ResidueKey, TorsionId, TorsionType};
use crate::core::models::pseudo_bond::PseudoBond;
use crate::core::models::residue::{PartnerRef, Residue};
use crate::core::utils::geometry::dihedral_degrees;

/// A molecular conformation: ordered residues with a Cartesian cache and an internal-coordinate
/// kinematic tree kept in lazy agreement.
///
/// DOF writes (torsions, bond geometry, jumps) are cheap and only mark coordinates and cached
/// torsions stale; Cartesian writes update both representations immediately except for the
/// torsion cache. Reads require the relevant representation to be fresh, see
/// [`Conformation::ensure_coordinates`] and [`Conformation::ensure_torsions`].
pub struct Conformation {
    pub(super) registry: Arc<ChemistryRegistry>,
    pub(super) residues: SlotMap<ResidueKey, Residue>,
    pub(super) order: Vec<ResidueKey>,
    pub(super) fold_tree: FoldTree,
    pub(super) atom_tree: AtomTree,
    pub(super) chain_endings: Vec<usize>,
    pub(super) secstruct: Vec<char>,
    pub(super) coordinates_dirty: bool,
    pub(super) torsions_dirty: bool,
    pub(super) xyz_moved: Vec<Vec<bool>>,
    pub(super) dof_moved: Vec<Vec<bool>>,
    pub(super) pseudo_bonds: Vec<PseudoBond>,
    pub(super) hubs: Hubs,
}

/// Residues in sequence order, borrowed from the arena.
pub(super) fn ordered<'a>(
    residues: &'a SlotMap<ResidueKey, Residue>,
    order: &[ResidueKey],
) -> Vec<&'a Residue> {
    order.iter().map(|&k| &residues[k]).collect()
}

impl Conformation {
    pub fn new(registry: Arc<ChemistryRegistry>) -> Self {
        Self {
            registry,
            residues: SlotMap::with_key(),
            order: Vec::new(),
            fold_tree: FoldTree::new(),
            atom_tree: AtomTree::new(),
            chain_endings: Vec::new(),
            secstruct: Vec::new(),
            coordinates_dirty: false,
            torsions_dirty: false,
            xyz_moved: Vec::new(),
            dof_moved: Vec::new(),
            pseudo_bonds: Vec::new(),
            hubs: Hubs::default(),
        }
    }

    pub fn registry(&self) -> &Arc<ChemistryRegistry> {
        &self.registry
    }

    pub fn size(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn fold_tree(&self) -> &FoldTree {
        &self.fold_tree
    }

    pub fn atom_tree(&self) -> &AtomTree {
        &self.atom_tree
    }

    pub(super) fn check_seqpos(&self, seqpos: usize) {
        assert!(
            (1..=self.order.len()).contains(&seqpos),
            "residue {} out of range for conformation of {} residues",
            seqpos,
            self.order.len()
        );
    }

    pub(super) fn check_atom(&self, id: AtomId) {
        self.check_seqpos(id.rsd);
        let natoms = self.residues[self.order[id.rsd - 1]].natoms();
        assert!(
            (1..=natoms).contains(&id.atomno),
            "atom {} out of range for residue {} with {} atoms",
            id.atomno,
            id.rsd,
            natoms
        );
    }

    fn assert_fresh_coordinates(&self) {
        assert!(
            !self.coordinates_dirty,
            "coordinates are stale; call ensure_coordinates() first"
        );
    }

    fn assert_fresh_torsions(&self) {
        assert!(
            !self.torsions_dirty,
            "torsions are stale; call ensure_torsions() first"
        );
    }
}

impl Conformation {
    pub fn coordinates_stale(&self) -> bool {
        self.coordinates_dirty
    }

    pub fn torsions_stale(&self) -> bool {
        self.torsions_dirty
    }

    /// Pushes pending DOF changes through the atom tree into the residue cache.
    ///
    /// # Return
    ///
    /// `true` if coordinates were recomputed.
    pub fn ensure_coordinates(&mut self) -> bool {
        if !self.coordinates_dirty {
            return false;
        }
        self.atom_tree.refresh();
        let changed = self.atom_tree.drain_changed();
        for &id in &changed {
            let xyz = self.atom_tree.xyz(id);
            self.residues[self.order[id.rsd - 1]].set_xyz(id.atomno, xyz);
            self.xyz_moved[id.rsd - 1][id.atomno - 1] = true;
        }
        self.coordinates_dirty = false;
        trace!(atoms = changed.len(), "Refreshed coordinates from atom tree.");
        self.hubs.emit_coordinates(CoordinateRefresh::Coordinates);
        true
    }

    /// Recomputes every cached mainchain, chi and nu torsion. Undefined torsions cache `0.0`.
    ///
    /// # Return
    ///
    /// `true` if torsions were recomputed.
    pub fn ensure_torsions(&mut self) -> bool {
        if !self.torsions_dirty {
            return false;
        }
        self.ensure_coordinates();
        let values: Vec<[Vec<f64>; 3]> = {
            let refs = ordered(&self.residues, &self.order);
            (1..=refs.len())
                .map(|seqpos| {
                    let residue = refs[seqpos - 1];
                    let measure = |kind: TorsionType, count: usize| -> Vec<f64> {
                        (1..=count)
                            .map(|k| measure_torsion(&refs, TorsionId::new(seqpos, kind, k)))
                            .collect()
                    };
                    [
                        measure(TorsionType::Backbone, residue.mainchain_torsions().len()),
                        measure(TorsionType::Chi, residue.template().chi_atoms().len()),
                        measure(TorsionType::Nu, residue.template().nu_atoms().len()),
                    ]
                })
                .collect()
        };
        for (&key, [mainchain, chi, nu]) in self.order.iter().zip(values) {
            let residue = &mut self.residues[key];
            residue.mainchain_torsions = mainchain;
            residue.chi = chi;
            residue.nu = nu;
        }
        self.torsions_dirty = false;
        self.hubs.emit_coordinates(CoordinateRefresh::Torsions);
        true
    }
}

impl Conformation {
    pub fn residue(&self, seqpos: usize) -> &Residue {
        self.check_seqpos(seqpos);
        self.assert_fresh_coordinates();
        &self.residues[self.order[seqpos - 1]]
    }

    pub fn residues(&self) -> impl Iterator<Item = &Residue> + '_ {
        self.assert_fresh_coordinates();
        self.order.iter().map(|&k| &self.residues[k])
    }

    /// Stable handle for the residue currently at `seqpos`; it survives renumbering.
    pub fn residue_key(&self, seqpos: usize) -> ResidueKey {
        self.check_seqpos(seqpos);
        self.order[seqpos - 1]
    }

    /// Current position of a residue handle, `None` once the residue was deleted.
    pub fn seqpos_of(&self, key: ResidueKey) -> Option<usize> {
        self.residues.get(key).map(Residue::seqpos)
    }

    pub fn xyz(&self, id: AtomId) -> Point3<f64> {
        self.check_atom(id);
        self.assert_fresh_coordinates();
        self.residues[self.order[id.rsd - 1]].xyz(id.atomno)
    }

    pub fn xyz_by_name(&self, seqpos: usize, atom_name: &str) -> Option<Point3<f64>> {
        self.residue(seqpos).xyz_by_name(atom_name)
    }

    pub fn torsion_atoms(&self, id: TorsionId) -> Option<[AtomId; 4]> {
        self.check_seqpos(id.rsd);
        torsions::torsion_atoms(&ordered(&self.residues, &self.order), id)
    }

    /// Symbolic torsion value in degrees (Å for jump translations).
    ///
    /// Mainchain, chi and nu read the torsion cache; branch torsions are measured from fresh
    /// coordinates and jump components from the atom tree.
    pub fn torsion(&self, id: TorsionId) -> f64 {
        self.check_seqpos(id.rsd);
        match id.kind {
            TorsionType::Backbone => self.mainchain_torsion(id.rsd, id.index),
            TorsionType::Chi => self.chi(id.rsd, id.index),
            TorsionType::Nu => self.nu(id.rsd, id.index),
            TorsionType::Branch => {
                self.assert_fresh_coordinates();
                measure_torsion(&ordered(&self.residues, &self.order), id)
            }
            TorsionType::Jump => self
                .jump_atom_of(id.rsd)
                .and_then(|atom| self.atom_tree.jump(atom))
                .map(|jump| jump_component(&jump, id.index))
                .unwrap_or(0.0),
        }
    }

    pub fn mainchain_torsion(&self, seqpos: usize, k: usize) -> f64 {
        self.check_seqpos(seqpos);
        self.assert_fresh_torsions();
        self.residues[self.order[seqpos - 1]].mainchain_torsion(k)
    }

    pub fn chi(&self, seqpos: usize, k: usize) -> f64 {
        self.check_seqpos(seqpos);
        self.assert_fresh_torsions();
        self.residues[self.order[seqpos - 1]].chi(k)
    }

    pub fn nu(&self, seqpos: usize, k: usize) -> f64 {
        self.check_seqpos(seqpos);
        self.assert_fresh_torsions();
        self.residues[self.order[seqpos - 1]].nu(k)
    }

    pub fn dof(&self, dof: DofId) -> Option<f64> {
        self.check_atom(dof.atom);
        self.atom_tree.dof(dof)
    }

    pub fn jump(&self, atom: AtomId) -> Option<Isometry3<f64>> {
        self.check_atom(atom);
        self.atom_tree.jump(atom)
    }

    /// Downstream jump atom of fold-tree jump `label`.
    pub fn jump_atom(&self, label: usize) -> Option<AtomId> {
        let (_, downstream) = self.fold_tree.jump_edge(label)?;
        self.jump_atom_of(downstream)
    }

    fn jump_atom_of(&self, seqpos: usize) -> Option<AtomId> {
        (1..=self.atom_tree.natoms(seqpos))
            .map(|a| AtomId::new(seqpos, a))
            .find(|&id| self.atom_tree.is_jump(id))
    }

    pub fn pseudo_bonds(&self) -> &[PseudoBond] {
        &self.pseudo_bonds
    }

    pub fn pseudo_bonds_between(&self, a: usize, b: usize) -> Option<&PseudoBond> {
        self.pseudo_bonds.iter().find(|pb| pb.links(a, b))
    }
}

impl Conformation {
    pub fn set_dof(&mut self, dof: DofId, value: f64) -> bool {
        self.check_atom(dof.atom);
        if !self.atom_tree.set_dof(dof, value) {
            warn!(atom = %dof.atom, "Cannot set a bonded DOF on a jump atom.");
            return false;
        }
        self.mark_dof_write(dof.atom);
        true
    }

    pub fn set_jump(&mut self, atom: AtomId, jump: Isometry3<f64>) -> bool {
        self.check_atom(atom);
        if !self.atom_tree.set_jump(atom, jump) {
            warn!(atom = %atom, "Atom is not a jump atom.");
            return false;
        }
        self.mark_dof_write(atom);
        true
    }

    /// Sets a symbolic torsion (degrees; Å for jump translations).
    ///
    /// # Return
    ///
    /// `false` if the torsion is undefined or not driven by a single atom-tree DOF.
    pub fn set_torsion(&mut self, id: TorsionId, value: f64) -> bool {
        self.check_seqpos(id.rsd);
        if id.kind == TorsionType::Jump {
            let Some(atom) = self.jump_atom_of(id.rsd) else {
                warn!(torsion = %id, "Residue has no jump atom.");
                return false;
            };
            let Some(jump) = self.atom_tree.jump(atom) else {
                return false;
            };
            return self.set_jump(atom, with_jump_component(&jump, id.index, value));
        }
        let Some(atoms) = self.torsion_atoms(id) else {
            warn!(torsion = %id, "Torsion is undefined in the current topology.");
            return false;
        };
        let [a1, a2, a3, a4] = atoms;
        let Some(pivot) = self.atom_tree.torsion_dof(a1, a2, a3, a4) else {
            warn!(torsion = %id, "Torsion is not an atom-tree degree of freedom.");
            return false;
        };
        self.atom_tree.set_torsion_angle(atoms, value);
        self.mark_dof_write(pivot);
        true
    }

    fn mark_dof_write(&mut self, atom: AtomId) {
        self.dof_moved[atom.rsd - 1][atom.atomno - 1] = true;
        self.coordinates_dirty = true;
        self.torsions_dirty = true;
    }

    /// Moves one atom; the kinematic tree re-derives its DOFs so that no other atom moves.
    pub fn set_xyz(&mut self, id: AtomId, xyz: Point3<f64>) {
        self.check_atom(id);
        self.ensure_coordinates();
        self.atom_tree.set_xyz(id, xyz);
        self.atom_tree.drain_changed();
        self.residues[self.order[id.rsd - 1]].set_xyz(id.atomno, xyz);
        self.xyz_moved[id.rsd - 1][id.atomno - 1] = true;
        self.torsions_dirty = true;
        self.hubs.emit_coordinates(CoordinateRefresh::Cartesian(id));
    }

    pub fn batch_set_xyz(&mut self, positions: &[(AtomId, Point3<f64>)]) {
        for &(id, xyz) in positions {
            self.set_xyz(id, xyz);
        }
    }

    /// Replaces the residue-level topology and rebuilds the atom tree from current coordinates.
    pub fn set_fold_tree(&mut self, fold_tree: FoldTree) {
        assert_eq!(
            fold_tree.residue_count(),
            self.size(),
            "fold tree size does not match conformation size"
        );
        assert!(fold_tree.check_topology(), "fold tree is not a valid tree");
        self.ensure_coordinates();
        self.fold_tree = fold_tree;
        self.rebuild_atom_tree();
        self.torsions_dirty = true;
    }

    pub(super) fn rebuild_atom_tree(&mut self) {
        let tree = {
            let refs = ordered(&self.residues, &self.order);
            AtomTree::build(&refs, &self.fold_tree)
        };
        self.atom_tree = tree;
    }
}

impl Conformation {
    pub fn xyz_moved(&self, id: AtomId) -> bool {
        self.check_atom(id);
        self.xyz_moved[id.rsd - 1][id.atomno - 1]
    }

    pub fn dof_moved(&self, id: AtomId) -> bool {
        self.check_atom(id);
        self.dof_moved[id.rsd - 1][id.atomno - 1]
    }

    pub fn structure_moved(&self) -> bool {
        self.xyz_moved.iter().flatten().any(|&m| m) || self.dof_moved.iter().flatten().any(|&m| m)
    }

    pub fn reset_move_data(&mut self) {
        self.xyz_moved.iter_mut().flatten().for_each(|m| *m = false);
        self.dof_moved.iter_mut().flatten().for_each(|m| *m = false);
    }
}

impl Conformation {
    pub fn chain_endings(&self) -> &[usize] {
        &self.chain_endings
    }

    /// Redefines chains by their last positions. Endings must be strictly increasing and lie in
    /// `1..size`.
    pub fn set_chain_endings(&mut self, endings: Vec<usize>) {
        assert!(
            endings.windows(2).all(|w| w[0] < w[1]),
            "chain endings must be strictly increasing: {:?}",
            endings
        );
        assert!(
            endings.iter().all(|&e| e >= 1 && e < self.size()),
            "chain endings {:?} out of range for {} residues",
            endings,
            self.size()
        );
        let mut chain = 1;
        for seqpos in 1..=self.size() {
            self.residues[self.order[seqpos - 1]].set_chain(chain);
            if endings.contains(&seqpos) {
                chain += 1;
            }
        }
        self.normalize_chains();
    }

    pub fn num_chains(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            self.chain_endings.len() + 1
        }
    }

    pub fn chain(&self, seqpos: usize) -> usize {
        self.check_seqpos(seqpos);
        self.residues[self.order[seqpos - 1]].chain()
    }

    pub fn chain_begin(&self, chain: usize) -> usize {
        assert!(
            (1..=self.num_chains()).contains(&chain),
            "chain {} out of range",
            chain
        );
        if chain == 1 {
            1
        } else {
            self.chain_endings[chain - 2] + 1
        }
    }

    pub fn chain_end(&self, chain: usize) -> usize {
        assert!(
            (1..=self.num_chains()).contains(&chain),
            "chain {} out of range",
            chain
        );
        if chain == self.num_chains() {
            self.size()
        } else {
            self.chain_endings[chain - 1]
        }
    }

    /// Re-derives chain endings from chain-id changes along the sequence, then renumbers chain
    /// ids to `1..=num_chains`.
    pub(super) fn normalize_chains(&mut self) {
        let chains: Vec<usize> = self.order.iter().map(|&k| self.residues[k].chain()).collect();
        self.chain_endings = chains
            .windows(2)
            .enumerate()
            .filter(|(_, w)| w[0] != w[1])
            .map(|(i, _)| i + 1)
            .collect();
        let mut chain = 1;
        for (i, &key) in self.order.iter().enumerate() {
            self.residues[key].set_chain(chain);
            if self.chain_endings.contains(&(i + 1)) {
                chain += 1;
            }
        }
    }

    pub(super) fn next_chain_id(&self) -> usize {
        self.residues.values().map(Residue::chain).max().unwrap_or(0) + 1
    }

    pub fn secstruct(&self, seqpos: usize) -> char {
        self.check_seqpos(seqpos);
        self.secstruct[seqpos - 1]
    }

    pub fn set_secstruct(&mut self, seqpos: usize, code: char) {
        self.check_seqpos(seqpos);
        self.secstruct[seqpos - 1] = code;
    }
}

impl Conformation {
    /// Notification hubs, for subscribing.
    pub fn signals(&mut self) -> &mut Hubs {
        &mut self.hubs
    }

    pub fn buffer_signals(&mut self) {
        self.hubs.buffer_all();
    }

    pub fn block_signals(&mut self) {
        self.hubs.block_all();
    }

    pub fn unblock_signals(&mut self) {
        self.hubs.unblock_all();
    }

    /// Copies `other`'s content into `self`, keeping `self`'s subscribers.
    pub fn assign(&mut self, other: &Conformation) {
        let old_size = self.size() as isize;
        self.registry = Arc::clone(&other.registry);
        self.residues = other.residues.clone();
        self.order = other.order.clone();
        self.fold_tree = other.fold_tree.clone();
        self.atom_tree = other.atom_tree.clone();
        self.chain_endings = other.chain_endings.clone();
        self.secstruct = other.secstruct.clone();
        self.coordinates_dirty = other.coordinates_dirty;
        self.torsions_dirty = other.torsions_dirty;
        self.xyz_moved = other.xyz_moved.clone();
        self.dof_moved = other.dof_moved.clone();
        self.pseudo_bonds = other.pseudo_bonds.clone();
        self.hubs.emit_connection(ConnectionKind::Transfer);
        self.hubs
            .emit_length(LengthKind::Invalidate, 0, self.size() as isize - old_size);
    }

    /// Checks the structural invariants tying the residue cache, topology and kinematic tree
    /// together.
    pub fn is_consistent(&self) -> bool {
        let n = self.size();
        if self.residues.len() != n
            || self.fold_tree.residue_count() != n
            || self.atom_tree.residue_count() != n
            || self.secstruct.len() != n
            || self.xyz_moved.len() != n
            || self.dof_moved.len() != n
            || !self.fold_tree.check_topology()
        {
            return false;
        }
        let refs = ordered(&self.residues, &self.order);
        for (i, residue) in refs.iter().enumerate() {
            let seqpos = i + 1;
            if residue.seqpos() != seqpos
                || self.atom_tree.natoms(seqpos) != residue.natoms()
                || self.xyz_moved[i].len() != residue.natoms()
            {
                return false;
            }
            for (c, partner) in residue.connect_map().iter().enumerate() {
                if let Some(p) = partner {
                    let back = refs
                        .get(p.rsd.wrapping_sub(1))
                        .map(|other| other.connection_partner(p.connid));
                    if back != Some(Some(PartnerRef::new(seqpos, c + 1))) {
                        return false;
                    }
                }
            }
        }
        let derived: Vec<usize> = refs
            .windows(2)
            .enumerate()
            .filter(|(_, w)| w[0].chain() != w[1].chain())
            .map(|(i, _)| i + 1)
            .collect();
        derived == self.chain_endings
    }
}

/// Dihedral of a symbolic torsion from current residue coordinates, `0.0` when undefined.
fn measure_torsion(residues: &[&Residue], id: TorsionId) -> f64 {
    torsions::torsion_atoms(residues, id)
        .map(|atoms| {
            let [p1, p2, p3, p4] = atoms.map(|a| residues[a.rsd - 1].xyz(a.atomno));
            dihedral_degrees(&p1, &p2, &p3, &p4)
        })
        .unwrap_or(0.0)
}

impl Clone for Conformation {
    /// Deep copy without subscribers.
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            residues: self.residues.clone(),
            order: self.order.clone(),
            fold_tree: self.fold_tree.clone(),
            atom_tree: self.atom_tree.clone(),
            chain_endings: self.chain_endings.clone(),
            secstruct: self.secstruct.clone(),
            coordinates_dirty: self.coordinates_dirty,
            torsions_dirty: self.torsions_dirty,
            xyz_moved: self.xyz_moved.clone(),
            dof_moved: self.dof_moved.clone(),
            pseudo_bonds: self.pseudo_bonds.clone(),
            hubs: Hubs::default(),
        }
    }
}

impl Drop for Conformation {
    fn drop(&mut self) {
        self.hubs.emit_connection(ConnectionKind::Disconnect);
    }
}

impl std::fmt::Debug for Conformation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conformation")
            .field("size", &self.size())
            .field("fold_tree", &self.fold_tree.to_string())
            .field("chain_endings", &self.chain_endings)
            .field("coordinates_dirty", &self.coordinates_dirty)
            .field("torsions_dirty", &self.torsions_dirty)
            .finish()
    }
}
