use std::collections::BTreeSet;
use std::f64::consts::PI;

use nalgebra::{Isometry3, Matrix3, Point3, Rotation3, Translation3, UnitQuaternion, Vector3};
use tracing::{trace, warn};

use super::fold_tree::{FoldTree, Link};
use crate::core::chemistry::template::ResidueTemplate;
use crate::core::models::ids::{AtomId, DofId, DofType};
use crate::core::models::residue::Residue;
use crate::core::utils::geometry::{dihedral_degrees, rotation_x, rotation_z, wrap_degrees};

const DEGENERATE_EPS: f64 = 1e-10;
/// Re-placements below this displacement (Å) are rounding noise, not motion.
const MOVE_EPS: f64 = 1e-9;

/// Internal degrees of freedom of one atom relative to its parent.
///
/// Bonded atoms store bond length, bond angle and a torsion measured relative to the previous
/// bonded sibling (radians). Jump atoms store a rigid-body transform from the parent's frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AtomDofs {
    Bonded { distance: f64, theta: f64, phi: f64 },
    Jump(Isometry3<f64>),
}

impl AtomDofs {
    const UNSET: AtomDofs = AtomDofs::Bonded {
        distance: 0.0,
        theta: 0.0,
        phi: 0.0,
    };
}

#[derive(Debug, Clone)]
struct AtomNode {
    parent: Option<AtomId>,
    children: Vec<AtomId>,
    dofs: AtomDofs,
    xyz: Point3<f64>,
    frame: Isometry3<f64>,
}

impl AtomNode {
    fn detached(xyz: Point3<f64>) -> Self {
        Self {
            parent: None,
            children: Vec::new(),
            dofs: AtomDofs::UNSET,
            xyz,
            frame: Isometry3::translation(xyz.x, xyz.y, xyz.z),
        }
    }

    fn is_jump(&self) -> bool {
        matches!(self.dofs, AtomDofs::Jump(_))
    }
}

/// Parent/child wiring derived from residue chemistry and the fold tree.
struct Wiring {
    parents: Vec<Vec<Option<AtomId>>>,
    children: Vec<Vec<Vec<AtomId>>>,
    jumps: Vec<Vec<bool>>,
    root: Option<AtomId>,
}

/// Atom-level kinematic tree spanning every atom of a conformation.
///
/// Positions and internal coordinates are kept in sync lazily: DOF writes only mark the affected
/// subtree, and [`AtomTree::refresh`] re-places it top-down. Cartesian writes re-derive the
/// internal coordinates of the subtree they influence.
#[derive(Debug, Clone, Default)]
pub struct AtomTree {
    nodes: Vec<Vec<AtomNode>>,
    root: Option<AtomId>,
    stale: BTreeSet<AtomId>,
    root_stale: bool,
    changed: BTreeSet<AtomId>,
}

impl AtomTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the tree from current residue coordinates and the residue-level topology.
    pub fn build(residues: &[&Residue], fold_tree: &FoldTree) -> Self {
        let mut tree = Self {
            nodes: residues.iter().map(|r| detached_nodes(r)).collect(),
            ..Self::default()
        };
        let wiring = wire(residues, fold_tree);
        tree.root = wiring.root;
        for (rsd, atoms) in tree.nodes.iter_mut().enumerate() {
            for (i, node) in atoms.iter_mut().enumerate() {
                node.parent = wiring.parents[rsd][i];
                node.children = wiring.children[rsd][i].clone();
                if wiring.jumps[rsd][i] {
                    node.dofs = AtomDofs::Jump(Isometry3::identity());
                }
            }
        }
        tree.measure_all();
        trace!(residues = residues.len(), "Built atom tree.");
        tree
    }

    pub fn residue_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn natoms(&self, rsd: usize) -> usize {
        self.nodes[rsd - 1].len()
    }

    pub fn root(&self) -> Option<AtomId> {
        self.root
    }

    fn node(&self, id: AtomId) -> &AtomNode {
        &self.nodes[id.rsd - 1][id.atomno - 1]
    }

    fn node_mut(&mut self, id: AtomId) -> &mut AtomNode {
        &mut self.nodes[id.rsd - 1][id.atomno - 1]
    }

    pub fn parent(&self, id: AtomId) -> Option<AtomId> {
        self.node(id).parent
    }

    pub fn children(&self, id: AtomId) -> &[AtomId] {
        &self.node(id).children
    }

    pub fn is_jump(&self, id: AtomId) -> bool {
        self.node(id).is_jump()
    }

    pub fn dofs(&self, id: AtomId) -> AtomDofs {
        self.node(id).dofs
    }

    /// True when DOF writes are pending and positions lag behind them.
    pub fn is_stale(&self) -> bool {
        self.root_stale || !self.stale.is_empty()
    }

    /// Position of `id` as of the last refresh.
    pub fn xyz(&self, id: AtomId) -> Point3<f64> {
        self.node(id).xyz
    }

    pub fn residue_xyz(&self, rsd: usize) -> Vec<Point3<f64>> {
        self.nodes[rsd - 1].iter().map(|n| n.xyz).collect()
    }

    /// Current value of a bonded DOF (radians for angles), `None` on jump atoms.
    pub fn dof(&self, dof: DofId) -> Option<f64> {
        match self.node(dof.atom).dofs {
            AtomDofs::Bonded {
                distance,
                theta,
                phi,
            } => Some(match dof.kind {
                DofType::Distance => distance,
                DofType::BondAngle => theta,
                DofType::Torsion => phi,
            }),
            AtomDofs::Jump(_) => None,
        }
    }

    /// Writes a bonded DOF. Returns `false` if the atom is a jump atom.
    pub fn set_dof(&mut self, dof: DofId, value: f64) -> bool {
        let node = self.node_mut(dof.atom);
        let AtomDofs::Bonded {
            distance,
            theta,
            phi,
        } = &mut node.dofs
        else {
            return false;
        };
        match dof.kind {
            DofType::Distance => *distance = value,
            DofType::BondAngle => *theta = value,
            DofType::Torsion => *phi = value,
        }
        self.mark_stale(dof.atom);
        true
    }

    pub fn jump(&self, id: AtomId) -> Option<Isometry3<f64>> {
        match self.node(id).dofs {
            AtomDofs::Jump(jump) => Some(jump),
            AtomDofs::Bonded { .. } => None,
        }
    }

    /// Replaces the rigid-body transform of a jump atom. Returns `false` on bonded atoms.
    pub fn set_jump(&mut self, id: AtomId, jump: Isometry3<f64>) -> bool {
        let node = self.node_mut(id);
        if !node.is_jump() {
            return false;
        }
        node.dofs = AtomDofs::Jump(jump);
        self.mark_stale(id);
        true
    }

    fn mark_stale(&mut self, id: AtomId) {
        match self.node(id).parent {
            Some(parent) => {
                self.stale.insert(parent);
            }
            None => self.root_stale = true,
        }
    }

    /// The atom whose torsion DOF drives the dihedral `a1-a2-a3-a4`, if the tree has one.
    ///
    /// The dihedral is controlled by rotation about `a2-a3` when the four atoms form a
    /// parent chain in either direction.
    pub fn torsion_dof(&self, a1: AtomId, a2: AtomId, a3: AtomId, a4: AtomId) -> Option<AtomId> {
        if self.parent(a4) == Some(a3) && self.parent(a3) == Some(a2) && !self.is_jump(a3) {
            self.first_bonded_child(a3)
        } else if self.parent(a1) == Some(a2) && self.parent(a2) == Some(a3) && !self.is_jump(a2) {
            self.first_bonded_child(a2)
        } else {
            None
        }
    }

    fn first_bonded_child(&self, id: AtomId) -> Option<AtomId> {
        self.node(id)
            .children
            .iter()
            .copied()
            .find(|&c| !self.is_jump(c))
    }

    /// Rotates about `a2-a3` so that the dihedral `a1-a2-a3-a4` reads `degrees`.
    ///
    /// # Return
    ///
    /// `false` if no tree DOF drives this dihedral.
    pub fn set_torsion_angle(
        &mut self,
        atoms: [AtomId; 4],
        degrees: f64,
    ) -> bool {
        let [a1, a2, a3, a4] = atoms;
        let Some(pivot) = self.torsion_dof(a1, a2, a3, a4) else {
            return false;
        };
        self.refresh();
        let current = dihedral_degrees(&self.xyz(a1), &self.xyz(a2), &self.xyz(a3), &self.xyz(a4));
        let delta = wrap_degrees(degrees - current).to_radians();
        if let AtomDofs::Bonded { phi, .. } = &mut self.node_mut(pivot).dofs {
            *phi += delta;
        }
        self.mark_stale(pivot);
        true
    }

    /// Moves one atom and re-derives the internal coordinates that depend on it.
    pub fn set_xyz(&mut self, id: AtomId, xyz: Point3<f64>) {
        self.refresh();
        self.node_mut(id).xyz = xyz;
        self.changed.insert(id);
        match self.parent(id).and_then(|p| self.measure_anchor(p)) {
            Some(anchor) => self.measure_subtree(anchor),
            None => self.measure_all(),
        }
    }

    /// Re-places every subtree with pending DOF writes.
    pub fn refresh(&mut self) {
        if self.root_stale {
            self.root_stale = false;
            self.stale.clear();
            if let Some(root) = self.root {
                if let AtomDofs::Jump(jump) = self.node(root).dofs {
                    self.place_root(root, jump);
                }
                self.place_subtree(root);
            }
            return;
        }
        if self.stale.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.stale);
        for &top in &pending {
            if !self.has_ancestor_in(top, &pending) {
                self.place_subtree(top);
            }
        }
    }

    /// Atoms whose position changed since the last drain.
    pub fn drain_changed(&mut self) -> BTreeSet<AtomId> {
        std::mem::take(&mut self.changed)
    }

    /// Inserts a residue at `seqpos`. `residues` and `fold_tree` describe the updated system.
    pub fn insert_residue(&mut self, seqpos: usize, residues: &[&Residue], fold_tree: &FoldTree) {
        self.refresh();
        self.remap_ids(|id| {
            Some(if id.rsd >= seqpos {
                AtomId::new(id.rsd + 1, id.atomno)
            } else {
                id
            })
        });
        self.nodes
            .insert(seqpos - 1, detached_nodes(residues[seqpos - 1]));
        self.rewire(residues, fold_tree, Some(seqpos));
    }

    /// Removes the residue at `seqpos`. `residues` and `fold_tree` describe the updated system.
    pub fn delete_residue(&mut self, seqpos: usize, residues: &[&Residue], fold_tree: &FoldTree) {
        self.refresh();
        self.nodes.remove(seqpos - 1);
        self.remap_ids(|id| match id.rsd.cmp(&seqpos) {
            std::cmp::Ordering::Less => Some(id),
            std::cmp::Ordering::Equal => None,
            std::cmp::Ordering::Greater => Some(AtomId::new(id.rsd - 1, id.atomno)),
        });
        self.rewire(residues, fold_tree, None);
    }

    /// Swaps the atoms of the residue at `seqpos` for those of `residues[seqpos - 1]`.
    pub fn replace_residue(&mut self, seqpos: usize, residues: &[&Residue], fold_tree: &FoldTree) {
        self.refresh();
        self.remap_ids(|id| (id.rsd != seqpos).then_some(id));
        self.nodes[seqpos - 1] = detached_nodes(residues[seqpos - 1]);
        self.rewire(residues, fold_tree, Some(seqpos));
    }

    fn remap_ids(&mut self, map: impl Fn(AtomId) -> Option<AtomId>) {
        for node in self.nodes.iter_mut().flatten() {
            node.parent = node.parent.and_then(&map);
            node.children = node.children.iter().filter_map(|&c| map(c)).collect();
        }
        self.root = self.root.and_then(&map);
        self.changed = self.changed.iter().filter_map(|&c| map(c)).collect();
    }

    /// Applies the wiring for the updated system and re-measures only subtrees whose parentage,
    /// sibling order or residue changed.
    fn rewire(&mut self, residues: &[&Residue], fold_tree: &FoldTree, fresh: Option<usize>) {
        let wiring = wire(residues, fold_tree);
        let mut whole = wiring.root != self.root;
        let mut anchors = BTreeSet::new();

        for (r, atoms) in self.nodes.iter_mut().enumerate() {
            for (i, node) in atoms.iter_mut().enumerate() {
                let id = AtomId::new(r + 1, i + 1);
                let parent = wiring.parents[r][i];
                let jump = wiring.jumps[r][i];
                if fresh == Some(r + 1) || node.parent != parent || node.is_jump() != jump {
                    match parent {
                        Some(p) => {
                            anchors.insert(p);
                        }
                        None => whole = true,
                    }
                }
                if node.children != wiring.children[r][i] {
                    anchors.insert(id);
                }
                node.parent = parent;
                node.children = wiring.children[r][i].clone();
                if node.is_jump() != jump {
                    node.dofs = if jump {
                        AtomDofs::Jump(Isometry3::identity())
                    } else {
                        AtomDofs::UNSET
                    };
                }
            }
        }
        self.root = wiring.root;

        if whole {
            self.measure_all();
            return;
        }
        let mut tops = BTreeSet::new();
        for anchor in anchors {
            match self.measure_anchor(anchor) {
                Some(top) => {
                    tops.insert(top);
                }
                None => {
                    self.measure_all();
                    return;
                }
            }
        }
        for &top in &tops {
            if !self.has_ancestor_in(top, &tops) {
                self.measure_subtree(top);
            }
        }
    }

    /// Node from which re-measuring covers every DOF influenced by the children of `start`.
    ///
    /// Jump frames are derived from their bonded children and grandchildren, so anything at or
    /// just below a jump re-measures from the jump's parent. `None` means the whole tree.
    fn measure_anchor(&self, start: AtomId) -> Option<AtomId> {
        for candidate in [Some(start), self.parent(start)].into_iter().flatten() {
            if self.is_jump(candidate) {
                return self.parent(candidate);
            }
        }
        Some(start)
    }

    fn has_ancestor_in(&self, id: AtomId, set: &BTreeSet<AtomId>) -> bool {
        let mut cursor = self.parent(id);
        while let Some(p) = cursor {
            if set.contains(&p) {
                return true;
            }
            cursor = self.parent(p);
        }
        false
    }

    fn place_root(&mut self, root: AtomId, jump: Isometry3<f64>) {
        let xyz = Point3::from(jump.translation.vector);
        if (self.xyz(root) - xyz).norm() > MOVE_EPS {
            self.changed.insert(root);
        }
        let node = self.node_mut(root);
        node.frame = jump;
        node.xyz = xyz;
    }

    /// Forward kinematics: positions and frames of every descendant of `top` from its frame.
    fn place_subtree(&mut self, top: AtomId) {
        let mut stack = vec![top];
        while let Some(id) = stack.pop() {
            let frame = self.node(id).frame;
            let mut running = frame.rotation.to_rotation_matrix();
            let children = self.node(id).children.clone();
            for child in children {
                let child_frame = match self.node(child).dofs {
                    AtomDofs::Bonded {
                        distance,
                        theta,
                        phi,
                    } => {
                        running *= rotation_x(phi);
                        let rotation = running * rotation_z(PI - theta);
                        let xyz = frame.translation.vector
                            + rotation * Vector3::new(distance, 0.0, 0.0);
                        Isometry3::from_parts(
                            Translation3::from(xyz),
                            UnitQuaternion::from_rotation_matrix(&rotation),
                        )
                    }
                    AtomDofs::Jump(jump) => frame * jump,
                };
                let xyz = Point3::from(child_frame.translation.vector);
                if (self.xyz(child) - xyz).norm() > MOVE_EPS {
                    self.changed.insert(child);
                }
                let node = self.node_mut(child);
                node.frame = child_frame;
                node.xyz = xyz;
                stack.push(child);
            }
        }
    }

    fn measure_all(&mut self) {
        let Some(root) = self.root else {
            return;
        };
        let frame = self.jump_frame_from_positions(root);
        let node = self.node_mut(root);
        node.dofs = AtomDofs::Jump(frame);
        node.frame = frame;
        self.measure_subtree(root);
    }

    /// Inverse kinematics: DOFs and frames of every descendant of `top` from positions.
    fn measure_subtree(&mut self, top: AtomId) {
        let mut stack = vec![top];
        while let Some(id) = stack.pop() {
            let frame = self.node(id).frame;
            let mut running = frame.rotation.to_rotation_matrix();
            let children = self.node(id).children.clone();
            for child in children {
                if self.is_jump(child) {
                    let child_frame = self.jump_frame_from_positions(child);
                    let node = self.node_mut(child);
                    node.dofs = AtomDofs::Jump(frame.inverse() * child_frame);
                    node.frame = child_frame;
                } else {
                    let xyz = self.node(child).xyz;
                    let (dofs, child_frame) = measure_bonded(&frame, &mut running, &xyz);
                    let node = self.node_mut(child);
                    node.dofs = dofs;
                    node.frame = child_frame;
                }
                stack.push(child);
            }
        }
    }

    /// Frame of a jump atom: x toward its first bonded child, xy plane through a second
    /// bonded reference atom.
    fn jump_frame_from_positions(&self, id: AtomId) -> Isometry3<f64> {
        let node = self.node(id);
        let origin = node.xyz;
        let bonded: Vec<AtomId> = node
            .children
            .iter()
            .copied()
            .filter(|&c| !self.is_jump(c))
            .collect();
        let rotation = match bonded.first() {
            None => UnitQuaternion::identity(),
            Some(&first) => {
                let reference = bonded
                    .get(1)
                    .copied()
                    .or_else(|| self.first_bonded_child(first))
                    .map(|r| self.xyz(r) - origin);
                frame_from_axes(self.xyz(first) - origin, reference)
            }
        };
        Isometry3::from_parts(Translation3::from(origin.coords), rotation)
    }
}

fn detached_nodes(residue: &Residue) -> Vec<AtomNode> {
    residue
        .coordinates()
        .iter()
        .map(|&p| AtomNode::detached(p))
        .collect()
}

fn measure_bonded(
    parent_frame: &Isometry3<f64>,
    running: &mut Rotation3<f64>,
    xyz: &Point3<f64>,
) -> (AtomDofs, Isometry3<f64>) {
    let offset = xyz.coords - parent_frame.translation.vector;
    let distance = offset.norm();
    let (theta, phi) = if distance < DEGENERATE_EPS {
        (0.0, 0.0)
    } else {
        let local = running.inverse() * offset / distance;
        let theta = (-local.x).clamp(-1.0, 1.0).acos();
        let phi = if local.y.hypot(local.z) < DEGENERATE_EPS {
            0.0
        } else {
            local.z.atan2(local.y)
        };
        (theta, phi)
    };
    *running *= rotation_x(phi);
    let rotation = *running * rotation_z(PI - theta);
    let frame = Isometry3::from_parts(
        Translation3::from(xyz.coords),
        UnitQuaternion::from_rotation_matrix(&rotation),
    );
    (
        AtomDofs::Bonded {
            distance,
            theta,
            phi,
        },
        frame,
    )
}

fn frame_from_axes(x: Vector3<f64>, reference: Option<Vector3<f64>>) -> UnitQuaternion<f64> {
    if x.norm() < DEGENERATE_EPS {
        return UnitQuaternion::identity();
    }
    let x = x.normalize();
    let orthogonal = |v: Vector3<f64>| {
        let v = v - x * x.dot(&v);
        (v.norm() > 1e-6).then(|| v.normalize())
    };
    let fallback = if x.x.abs() < 0.9 {
        Vector3::x()
    } else {
        Vector3::y()
    };
    let y = reference
        .and_then(&orthogonal)
        .or_else(|| orthogonal(fallback))
        .unwrap_or_else(Vector3::y);
    let z = x.cross(&y);
    let rotation = Rotation3::from_matrix_unchecked(Matrix3::from_columns(&[x, y, z]));
    UnitQuaternion::from_rotation_matrix(&rotation)
}

/// Intra-residue children come first (mainchain, then other heavy atoms, then hydrogens),
/// followed by the entry atoms of downstream residues in sequence order.
fn wire(residues: &[&Residue], fold_tree: &FoldTree) -> Wiring {
    assert_eq!(
        residues.len(),
        fold_tree.residue_count(),
        "fold tree size does not match residue count"
    );
    let mut wiring = Wiring {
        parents: residues.iter().map(|r| vec![None; r.natoms()]).collect(),
        children: residues
            .iter()
            .map(|r| vec![Vec::new(); r.natoms()])
            .collect(),
        jumps: residues.iter().map(|r| vec![false; r.natoms()]).collect(),
        root: None,
    };
    let mut entries = Vec::with_capacity(residues.len());

    for (i, residue) in residues.iter().enumerate() {
        let rsd = i + 1;
        let template = residue.template();
        let (entry, upstream, jump) = entry_point(residues, fold_tree, rsd);
        entries.push((entry, upstream));
        wiring.jumps[i][entry - 1] = jump;
        if upstream.is_none() {
            wiring.root = Some(AtomId::new(rsd, entry));
        }

        let mut visited = vec![false; template.natoms()];
        visited[entry - 1] = true;
        visit(
            template,
            rsd,
            entry,
            &mut visited,
            &mut wiring.parents[i],
            &mut wiring.children[i],
        );
        for atomno in 1..=template.natoms() {
            if !visited[atomno - 1] {
                wiring.parents[i][atomno - 1] = Some(AtomId::new(rsd, entry));
                wiring.children[i][entry - 1].push(AtomId::new(rsd, atomno));
            }
        }
    }

    for (i, (entry, upstream)) in entries.into_iter().enumerate() {
        if let Some(up) = upstream {
            wiring.parents[i][entry - 1] = Some(up);
            wiring.children[up.rsd - 1][up.atomno - 1].push(AtomId::new(i + 1, entry));
        }
    }
    wiring
}

fn visit(
    template: &ResidueTemplate,
    rsd: usize,
    atom: usize,
    visited: &mut [bool],
    parents: &mut [Option<AtomId>],
    children: &mut [Vec<AtomId>],
) {
    let mut neighbors = template.bonded_neighbors(atom).to_vec();
    neighbors.sort_by_key(|&a| (!template.is_mainchain_atom(a), template.atom(a).is_hydrogen(), a));
    for next in neighbors {
        if visited[next - 1] {
            continue;
        }
        visited[next - 1] = true;
        parents[next - 1] = Some(AtomId::new(rsd, atom));
        children[atom - 1].push(AtomId::new(rsd, next));
        visit(template, rsd, next, visited, parents, children);
    }
}

/// Entry atom of residue `rsd`, the upstream atom it hangs from, and whether it is a jump atom.
fn entry_point(
    residues: &[&Residue],
    fold_tree: &FoldTree,
    rsd: usize,
) -> (usize, Option<AtomId>, bool) {
    let template = residues[rsd - 1].template();
    match fold_tree.link(rsd) {
        None => (template.root_atom(), None, true),
        Some(Link::Polymer { from }) => {
            let upstream = residues[from - 1].template();
            let (own, theirs) = if from + 1 == rsd {
                (template.lower_connect(), upstream.upper_connect())
            } else {
                (template.upper_connect(), upstream.lower_connect())
            };
            let entry = own
                .map(|c| template.connection(c).atom)
                .unwrap_or_else(|| template.root_atom());
            let parent = theirs
                .map(|c| upstream.connection(c).atom)
                .unwrap_or_else(|| upstream.root_atom());
            (entry, Some(AtomId::new(*from, parent)), false)
        }
        Some(Link::Jump {
            from,
            upstream_atom,
            downstream_atom,
            ..
        }) => {
            let entry = named_atom(template, downstream_atom.as_deref());
            let parent = named_atom(residues[from - 1].template(), upstream_atom.as_deref());
            (entry, Some(AtomId::new(*from, parent)), true)
        }
        Some(Link::Chemical {
            from,
            upstream_atom,
            downstream_atom,
        }) => {
            let entry = named_atom(template, Some(downstream_atom));
            let parent = named_atom(residues[from - 1].template(), Some(upstream_atom));
            (entry, Some(AtomId::new(*from, parent)), false)
        }
    }
}

fn named_atom(template: &ResidueTemplate, name: Option<&str>) -> usize {
    match name {
        None => template.root_atom(),
        Some(name) => template.atom_index(name).unwrap_or_else(|| {
            warn!(
                template = template.name(),
                atom = name,
                "Fold-tree atom not found; using the residue root atom."
            );
            template.root_atom()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chemistry::registry::ChemistryRegistry;
    use crate::core::utils::geometry::bond_angle_degrees;

    const TOL: f64 = 1e-8;

    fn alanine() -> Residue {
        let registry = ChemistryRegistry::embedded().unwrap();
        Residue::from_template(registry.get("ALA").unwrap())
    }

    fn shifted(residue: &Residue, x: f64, y: f64, z: f64) -> Residue {
        let mut moved = residue.clone();
        moved.apply_transform(&Isometry3::translation(x, y, z));
        moved
    }

    fn atom(residue: &Residue, rsd: usize, name: &str) -> AtomId {
        AtomId::new(rsd, residue.atom_index(name).unwrap())
    }

    fn assert_same_positions(tree: &AtomTree, residues: &[&Residue]) {
        for (i, residue) in residues.iter().enumerate() {
            for (j, expected) in residue.coordinates().iter().enumerate() {
                let actual = tree.xyz(AtomId::new(i + 1, j + 1));
                assert!(
                    (actual - expected).norm() < TOL,
                    "atom {}:{} moved from {:?} to {:?}",
                    i + 1,
                    j + 1,
                    expected,
                    actual
                );
            }
        }
    }

    fn force_full_refresh(tree: &mut AtomTree) {
        let root = tree.root().unwrap();
        let jump = tree.jump(root).unwrap();
        tree.set_jump(root, jump);
        tree.refresh();
    }

    #[test]
    fn single_residue_is_rooted_at_root_atom_with_mainchain_first() {
        let ala = alanine();
        let tree = AtomTree::build(&[&ala], &FoldTree::simple(1));
        let ca = atom(&ala, 1, "CA");
        assert_eq!(tree.root(), Some(ca));
        assert!(tree.is_jump(ca));
        let names: Vec<&str> = tree
            .children(ca)
            .iter()
            .map(|c| ala.template().atom_name(c.atomno))
            .collect();
        assert_eq!(names, vec!["N", "C", "CB", "HA"]);
        assert_eq!(tree.parent(atom(&ala, 1, "O")), Some(atom(&ala, 1, "C")));
    }

    #[test]
    fn forward_kinematics_reproduces_measured_positions() {
        let first = alanine();
        let second = shifted(&first, 1.0, 3.5, -0.5);
        let residues = [&first, &second];
        let mut tree = AtomTree::build(&residues, &FoldTree::simple(2));
        force_full_refresh(&mut tree);
        assert_same_positions(&tree, &residues);
    }

    #[test]
    fn polymer_link_hangs_lower_connect_atom_from_upper_connect_atom() {
        let first = alanine();
        let second = shifted(&first, 3.0, 0.0, 0.0);
        let tree = AtomTree::build(&[&first, &second], &FoldTree::simple(2));
        let n2 = atom(&second, 2, "N");
        let c1 = atom(&first, 1, "C");
        assert_eq!(tree.parent(n2), Some(c1));
        assert_eq!(tree.children(c1).last(), Some(&n2));
        assert!(!tree.is_jump(n2));
    }

    #[test]
    fn bonded_dofs_match_internal_geometry() {
        let ala = alanine();
        let tree = AtomTree::build(&[&ala], &FoldTree::simple(1));
        let o = atom(&ala, 1, "O");
        let distance = tree
            .dof(DofId::new(o, DofType::Distance))
            .unwrap();
        let theta = tree.dof(DofId::new(o, DofType::BondAngle)).unwrap();
        assert!((distance - 1.231).abs() < 1e-6);
        let angle = bond_angle_degrees(
            &ala.xyz_by_name("CA").unwrap(),
            &ala.xyz_by_name("C").unwrap(),
            &ala.xyz_by_name("O").unwrap(),
        );
        assert!((theta.to_degrees() - angle).abs() < 1e-6);
    }

    mod torsions {
        use super::*;

        #[test]
        fn setting_torsion_moves_only_downstream_atoms() {
            let ala = alanine();
            let mut tree = AtomTree::build(&[&ala], &FoldTree::simple(1));
            let ids = ["N", "CA", "C", "O"].map(|n| atom(&ala, 1, n));
            tree.drain_changed();

            assert!(tree.set_torsion_angle(ids, 60.0));
            assert!(tree.is_stale());
            tree.refresh();

            let dihedral = dihedral_degrees(
                &tree.xyz(ids[0]),
                &tree.xyz(ids[1]),
                &tree.xyz(ids[2]),
                &tree.xyz(ids[3]),
            );
            assert!((dihedral - 60.0).abs() < 1e-6);
            let changed = tree.drain_changed();
            assert!(changed.contains(&ids[3]));
            for name in ["N", "CA", "C", "CB", "H", "HA"] {
                let id = atom(&ala, 1, name);
                assert!(!changed.contains(&id), "{} should not move", name);
                assert!((tree.xyz(id) - ala.xyz(id.atomno)).norm() < TOL);
            }
        }

        #[test]
        fn torsion_dof_resolves_parent_chains_in_either_direction() {
            let ala = alanine();
            let tree = AtomTree::build(&[&ala], &FoldTree::simple(1));
            let [h, n, ca, c, cb, hb] = ["H", "N", "CA", "C", "CB", "1HB"].map(|x| atom(&ala, 1, x));
            assert_eq!(tree.torsion_dof(n, ca, cb, hb), Some(hb));
            assert_eq!(tree.torsion_dof(hb, cb, ca, n), Some(hb));
            assert_eq!(tree.torsion_dof(h, n, ca, cb), Some(h));
            assert_eq!(tree.torsion_dof(n, ca, c, cb), None);
        }

        #[test]
        fn reverse_direction_torsion_reaches_target() {
            let ala = alanine();
            let mut tree = AtomTree::build(&[&ala], &FoldTree::simple(1));
            let ids = ["H", "N", "CA", "C"].map(|x| atom(&ala, 1, x));
            assert!(tree.set_torsion_angle(ids, -75.0));
            tree.refresh();
            let dihedral = dihedral_degrees(
                &tree.xyz(ids[0]),
                &tree.xyz(ids[1]),
                &tree.xyz(ids[2]),
                &tree.xyz(ids[3]),
            );
            assert!((dihedral + 75.0).abs() < 1e-6);
            assert!((tree.xyz(ids[3]) - ala.xyz(ids[3].atomno)).norm() < TOL);
        }

        #[test]
        fn torsion_across_residues_rotates_the_downstream_residue() {
            let first = alanine();
            let second = shifted(&first, 2.0, 2.0, 0.0);
            let mut tree = AtomTree::build(&[&first, &second], &FoldTree::simple(2));
            let ids = [
                atom(&first, 1, "CA"),
                atom(&first, 1, "C"),
                atom(&second, 2, "N"),
                atom(&second, 2, "CA"),
            ];
            assert!(tree.set_torsion_angle(ids, 180.0));
            tree.refresh();
            let omega = dihedral_degrees(
                &tree.xyz(ids[0]),
                &tree.xyz(ids[1]),
                &tree.xyz(ids[2]),
                &tree.xyz(ids[3]),
            );
            assert!(wrap_degrees(omega - 180.0).abs() < 1e-6);
            assert!((tree.xyz(ids[2]) - second.xyz(ids[2].atomno)).norm() < TOL);
        }
    }

    #[test]
    fn set_xyz_keeps_other_atoms_fixed_under_forward_kinematics() {
        let ala = alanine();
        let mut tree = AtomTree::build(&[&ala], &FoldTree::simple(1));
        let cb = atom(&ala, 1, "CB");
        let target = ala.xyz(cb.atomno) + Vector3::new(0.3, -0.2, 0.1);
        tree.set_xyz(cb, target);
        force_full_refresh(&mut tree);

        assert!((tree.xyz(cb) - target).norm() < TOL);
        for name in ["N", "C", "O", "1HB", "2HB", "3HB"] {
            let id = atom(&ala, 1, name);
            assert!((tree.xyz(id) - ala.xyz(id.atomno)).norm() < TOL, "{} drifted", name);
        }
    }

    #[test]
    fn moving_jump_child_reference_atom_remeasures_the_jump() {
        let ala = alanine();
        let mut tree = AtomTree::build(&[&ala], &FoldTree::simple(1));
        let n = atom(&ala, 1, "N");
        let target = ala.xyz(n.atomno) + Vector3::new(0.0, 0.2, 0.1);
        tree.set_xyz(n, target);
        force_full_refresh(&mut tree);
        assert!((tree.xyz(n) - target).norm() < TOL);
        let o = atom(&ala, 1, "O");
        assert!((tree.xyz(o) - ala.xyz(o.atomno)).norm() < TOL);
    }

    #[test]
    fn jump_transform_moves_the_downstream_residue_rigidly() {
        let first = alanine();
        let second = shifted(&first, 8.0, 0.0, 0.0);
        let mut fold_tree = FoldTree::simple(1);
        fold_tree.append_residue(Some(Link::jump(1)));
        let mut tree = AtomTree::build(&[&first, &second], &fold_tree);
        let ca2 = atom(&second, 2, "CA");
        assert!(tree.is_jump(ca2));

        let jump = tree.jump(ca2).unwrap();
        let shift = Isometry3::translation(0.0, 0.0, 1.5);
        assert!(tree.set_jump(ca2, shift * jump));
        tree.refresh();

        let changed = tree.drain_changed();
        assert!(changed.iter().all(|id| id.rsd == 2));
        assert_eq!(changed.len(), second.natoms());
        for atomno in 1..=second.natoms() {
            let moved = tree.xyz(AtomId::new(2, atomno)) - second.xyz(atomno);
            assert!(moved.norm() > 1e-3);
        }
        for atomno in 1..=first.natoms() {
            assert!((tree.xyz(AtomId::new(1, atomno)) - first.xyz(atomno)).norm() < TOL);
        }
    }

    mod topology_edits {
        use super::*;

        #[test]
        fn insert_residue_shifts_ids_and_preserves_positions() {
            let first = alanine();
            let third = shifted(&first, 7.0, 0.0, 0.0);
            let mut tree = AtomTree::build(&[&first, &third], &FoldTree::simple(2));
            let untouched = tree.dofs(atom(&first, 1, "O"));

            let second = shifted(&first, 3.5, 0.5, 0.0);
            let residues = [&first, &second, &third];
            let mut fold_tree = FoldTree::simple(2);
            fold_tree.insert_polymer_residue_after(2, true);
            tree.insert_residue(2, &residues, &fold_tree);

            assert_eq!(tree.residue_count(), 3);
            assert_eq!(
                tree.parent(atom(&third, 3, "N")),
                Some(atom(&second, 2, "C"))
            );
            assert_eq!(tree.dofs(atom(&first, 1, "O")), untouched);
            force_full_refresh(&mut tree);
            assert_same_positions(&tree, &residues);
        }

        #[test]
        fn delete_residue_relinks_downstream_residue() {
            let first = alanine();
            let second = shifted(&first, 3.5, 0.5, 0.0);
            let third = shifted(&first, 7.0, 0.0, 0.0);
            let mut tree = AtomTree::build(&[&first, &second, &third], &FoldTree::simple(3));

            let residues = [&first, &third];
            let mut fold_tree = FoldTree::simple(3);
            fold_tree.delete_polymer_residue(2);
            tree.delete_residue(2, &residues, &fold_tree);

            assert_eq!(tree.residue_count(), 2);
            assert_eq!(tree.parent(atom(&third, 2, "N")), Some(atom(&first, 1, "C")));
            force_full_refresh(&mut tree);
            assert_same_positions(&tree, &residues);
        }

        #[test]
        fn replace_residue_rewires_new_atoms() {
            let registry = ChemistryRegistry::embedded().unwrap();
            let first = alanine();
            let second = shifted(&first, 3.5, 0.5, 0.0);
            let mut tree = AtomTree::build(&[&first, &second], &FoldTree::simple(2));

            let glycine = shifted(
                &Residue::from_template(registry.get("GLY").unwrap()),
                3.5,
                0.5,
                0.0,
            );
            let residues = [&first, &glycine];
            tree.replace_residue(2, &residues, &FoldTree::simple(2));

            assert_eq!(tree.natoms(2), glycine.natoms());
            assert_eq!(tree.parent(atom(&glycine, 2, "N")), Some(atom(&first, 1, "C")));
            force_full_refresh(&mut tree);
            assert_same_positions(&tree, &residues);
        }
    }
}
