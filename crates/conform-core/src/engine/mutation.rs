use rand::Rng;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::conformation::{Conformation, ordered};
use super::signals::{IdentityKind, LengthKind};
use crate::core::chemistry::template::ResidueTemplate;
use crate::core::kinematics::fold_tree::Link;
use crate::core::models::ids::ResidueKey;
use crate::core::models::residue::{PartnerRef, Residue};
use crate::core::utils::geometry::{bond_angle_degrees, place_atom, superpose};

/// Rigidly moves `residue` so that its connection `residue_conn` sits on the ideal partner
/// geometry of `anchor`'s connection `anchor_conn`, with the torsion about the new bond trans.
///
/// # Return
///
/// `false` if either connection stub is degenerate; the residue is then left where it was.
fn orient_by_connection(
    anchor: &Residue,
    anchor_conn: usize,
    residue: &mut Residue,
    residue_conn: usize,
) -> bool {
    let anchor_ct = anchor.template().connection(anchor_conn).clone();
    let residue_ct = residue.template().connection(residue_conn).clone();
    let a = anchor.xyz(anchor_ct.atom);
    let a_stub = anchor.xyz(anchor_ct.stub[0]);
    let b = residue.xyz(residue_ct.atom);
    let b_stub = residue.xyz(residue_ct.stub[0]);

    let target = anchor
        .predicted_partner_position(anchor_conn)
        .zip(residue.predicted_partner_position(residue_conn))
        .and_then(|(b_target, a_predicted)| {
            let stub_target = place_atom(
                &a_stub,
                &a,
                &b_target,
                (b_stub - b).norm(),
                bond_angle_degrees(&a_predicted, &b, &b_stub),
                180.0,
            )?;
            superpose(&[a_predicted, b, b_stub], &[a, b_target, stub_target])
        });
    match target {
        Some(transform) => {
            residue.apply_transform(&transform);
            true
        }
        None => {
            warn!(
                anchor = anchor.name(),
                residue = residue.name(),
                "Degenerate connection geometry; new residue keeps its input coordinates."
            );
            false
        }
    }
}

/// Old-to-new position map for opening `count` slots at `seqpos` in a sequence of `n`.
fn insertion_map(n: usize, seqpos: usize, count: usize) -> Vec<Option<usize>> {
    (1..=n)
        .map(|i| Some(if i >= seqpos { i + count } else { i }))
        .collect()
}

/// Old-to-new position map for removing `start..=end` from a sequence of `n`.
fn deletion_map(n: usize, start: usize, end: usize) -> Vec<Option<usize>> {
    let count = end - start + 1;
    (1..=n)
        .map(|i| {
            if i < start {
                Some(i)
            } else if i > end {
                Some(i - count)
            } else {
                None
            }
        })
        .collect()
}

impl Conformation {
    pub(super) fn residue_at_mut(&mut self, seqpos: usize) -> &mut Residue {
        let key = self.order[seqpos - 1];
        &mut self.residues[key]
    }

    pub(super) fn residue_at(&self, seqpos: usize) -> &Residue {
        &self.residues[self.order[seqpos - 1]]
    }

    /// Renumbers existing residues around a new slot at `seqpos` and stores `residue` there with
    /// every connection incomplete.
    fn open_position(&mut self, seqpos: usize, mut residue: Residue, chain: usize) -> ResidueKey {
        let map = insertion_map(self.size(), seqpos, 1);
        for r in self.residues.values_mut() {
            r.renumber(&map);
        }
        for connid in 1..=residue.n_connections() {
            residue.mark_connection_incomplete(connid);
        }
        residue.set_seqpos(seqpos);
        residue.set_chain(chain);
        let natoms = residue.natoms();
        let key = self.residues.insert(residue);
        self.order.insert(seqpos - 1, key);
        self.xyz_moved.insert(seqpos - 1, vec![true; natoms]);
        self.dof_moved.insert(seqpos - 1, vec![false; natoms]);
        self.secstruct.insert(seqpos - 1, 'L');
        key
    }

    /// Drops residues `start..=end`; partners pointing into the range become incomplete.
    fn close_positions(&mut self, start: usize, end: usize) {
        let map = deletion_map(self.size(), start, end);
        for key in self.order.drain(start - 1..end) {
            self.residues.remove(key);
        }
        for r in self.residues.values_mut() {
            r.renumber(&map);
        }
        self.xyz_moved.drain(start - 1..end);
        self.dof_moved.drain(start - 1..end);
        self.secstruct.drain(start - 1..end);
    }

    /// Records a symmetric bond between two connection points.
    fn bond(&mut self, a: PartnerRef, b: PartnerRef) {
        self.residue_at_mut(a.rsd).set_connection_partner(a.connid, b);
        self.residue_at_mut(b.rsd).set_connection_partner(b.connid, a);
    }

    /// Breaks the bond on `(rsd, connid)` on both sides.
    ///
    /// # Return
    ///
    /// `false` if the connection was already incomplete.
    fn unbond(&mut self, rsd: usize, connid: usize) -> bool {
        let Some(partner) = self.residue_at(rsd).connection_partner(connid) else {
            return false;
        };
        self.residue_at_mut(rsd).mark_connection_incomplete(connid);
        let back = self.residue_at(partner.rsd).connection_partner(partner.connid);
        if back == Some(PartnerRef::new(rsd, connid)) {
            self.residue_at_mut(partner.rsd)
                .mark_connection_incomplete(partner.connid);
        }
        true
    }

    fn patch_atom_tree_insert(&mut self, seqpos: usize) {
        let refs = ordered(&self.residues, &self.order);
        self.atom_tree.insert_residue(seqpos, &refs, &self.fold_tree);
    }

    fn patch_atom_tree_delete(&mut self, seqpos: usize) {
        let refs = ordered(&self.residues, &self.order);
        self.atom_tree.delete_residue(seqpos, &refs, &self.fold_tree);
    }

    fn finish_edit(&mut self, kind: LengthKind, seqpos: usize, delta: isize) {
        self.normalize_chains();
        self.update_pseudo_bonds();
        self.torsions_dirty = true;
        debug!(?kind, seqpos, delta, size = self.size(), "Topology edited.");
        self.hubs.emit_length(kind, seqpos, delta);
    }

    fn assert_connection(&self, seqpos: usize, connid: usize) {
        let n = self.residue_at(seqpos).n_connections();
        assert!(
            (1..=n).contains(&connid),
            "connection {} out of range for residue {} with {} connections",
            connid,
            seqpos,
            n
        );
    }

    fn polymer_insertion_kind(&self, seqpos: usize) -> LengthKind {
        if seqpos == 1 {
            LengthKind::Prepend
        } else if seqpos == self.size() {
            LengthKind::Append
        } else {
            LengthKind::Insert
        }
    }
}

impl Conformation {
    /// Appends `residue` attached to `anchor_pos` through a rigid-body jump. On an empty
    /// conformation the residue becomes the root and the anchor is ignored.
    ///
    /// `anchor_atom` and `root_atom` name the jump's upstream and downstream atoms; `None` uses
    /// each residue's root atom.
    pub fn append_residue_by_jump(
        &mut self,
        residue: Residue,
        anchor_pos: usize,
        anchor_atom: Option<&str>,
        root_atom: Option<&str>,
        start_new_chain: bool,
    ) {
        self.ensure_coordinates();
        let seqpos = self.size() + 1;
        if self.is_empty() {
            self.open_position(seqpos, residue, 1);
            self.fold_tree.append_residue(None);
            self.rebuild_atom_tree();
        } else {
            self.check_seqpos(anchor_pos);
            let chain = if start_new_chain {
                self.next_chain_id()
            } else {
                self.residue_at(seqpos - 1).chain()
            };
            self.open_position(seqpos, residue, chain);
            self.fold_tree.append_residue(Some(Link::Jump {
                from: anchor_pos,
                label: 0,
                upstream_atom: anchor_atom.map(str::to_owned),
                downstream_atom: root_atom.map(str::to_owned),
            }));
            self.patch_atom_tree_insert(seqpos);
        }
        self.finish_edit(LengthKind::Append, seqpos, 1);
    }

    /// Appends `residue` polymer-bonded to the current last residue.
    pub fn append_residue_by_bond(&mut self, residue: Residue, build_ideal_geometry: bool) {
        assert!(
            !self.is_empty(),
            "cannot append by bond to an empty conformation"
        );
        let anchor = self.size();
        self.append_polymer_residue_after_seqpos(residue, anchor, build_ideal_geometry);
    }

    /// Inserts `residue` at `seqpos + 1`, polymer-bonded to the residue at `seqpos`.
    ///
    /// If `seqpos` was polymer-bonded to its upper neighbour and the new residue has an upper
    /// connection, the neighbour is re-bonded to the new residue; otherwise the neighbour's lower
    /// connection becomes incomplete.
    pub fn append_polymer_residue_after_seqpos(
        &mut self,
        mut residue: Residue,
        seqpos: usize,
        build_ideal_geometry: bool,
    ) {
        self.check_seqpos(seqpos);
        self.ensure_coordinates();
        let anchor = self.residue_at(seqpos);
        let anchor_conn = anchor.upper_connect().unwrap_or_else(|| {
            panic!(
                "residue {} ({}) has no upper connection",
                seqpos,
                anchor.name()
            )
        });
        let new_lower = residue.lower_connect().unwrap_or_else(|| {
            panic!("residue {} has no lower connection", residue.name())
        });
        let neighbor = anchor
            .upper_partner()
            .filter(|p| p.rsd == seqpos + 1);
        let join = neighbor.is_some() && residue.upper_connect().is_some();
        if build_ideal_geometry {
            orient_by_connection(anchor, anchor_conn, &mut residue, new_lower);
        }
        let new_upper = residue.upper_connect();
        let chain = anchor.chain();

        if let Some(n) = neighbor {
            self.unbond(n.rsd, n.connid);
        }
        let new_pos = seqpos + 1;
        self.open_position(new_pos, residue, chain);
        self.bond(
            PartnerRef::new(seqpos, anchor_conn),
            PartnerRef::new(new_pos, new_lower),
        );
        if let (true, Some(n), Some(upper)) = (join, neighbor, new_upper) {
            self.bond(
                PartnerRef::new(new_pos, upper),
                PartnerRef::new(n.rsd + 1, n.connid),
            );
        }
        self.fold_tree.insert_polymer_residue_after(new_pos, join);
        self.patch_atom_tree_insert(new_pos);
        let kind = self.polymer_insertion_kind(new_pos);
        self.finish_edit(kind, new_pos, 1);
    }

    /// Inserts `residue` at `seqpos`, polymer-bonded to the residue currently there (which moves
    /// to `seqpos + 1`). A lower neighbour bonded to that residue is re-bonded to the new one when
    /// the new residue has a lower connection.
    pub fn prepend_polymer_residue_before_seqpos(
        &mut self,
        mut residue: Residue,
        seqpos: usize,
        build_ideal_geometry: bool,
    ) {
        self.check_seqpos(seqpos);
        self.ensure_coordinates();
        let anchor = self.residue_at(seqpos);
        let anchor_conn = anchor.lower_connect().unwrap_or_else(|| {
            panic!(
                "residue {} ({}) has no lower connection",
                seqpos,
                anchor.name()
            )
        });
        let new_upper = residue.upper_connect().unwrap_or_else(|| {
            panic!("residue {} has no upper connection", residue.name())
        });
        let neighbor = anchor
            .lower_partner()
            .filter(|p| p.rsd + 1 == seqpos);
        let join = neighbor.is_some() && residue.lower_connect().is_some();
        if build_ideal_geometry {
            orient_by_connection(anchor, anchor_conn, &mut residue, new_upper);
        }
        let new_lower = residue.lower_connect();
        let chain = anchor.chain();

        if let Some(n) = neighbor {
            self.unbond(n.rsd, n.connid);
        }
        self.open_position(seqpos, residue, chain);
        self.bond(
            PartnerRef::new(seqpos + 1, anchor_conn),
            PartnerRef::new(seqpos, new_upper),
        );
        if let (true, Some(n), Some(lower)) = (join, neighbor, new_lower) {
            self.bond(PartnerRef::new(seqpos, lower), n);
        }
        self.fold_tree.insert_polymer_residue_before(seqpos, join);
        self.patch_atom_tree_insert(seqpos);
        let kind = if seqpos == 1 {
            LengthKind::Prepend
        } else {
            LengthKind::Insert
        };
        self.finish_edit(kind, seqpos, 1);
    }

    /// Appends `residue` chemically bonded (non-polymer edge) through `residue_conn` to connection
    /// `anchor_conn` of the residue at `anchor_pos`. Used for branches.
    pub fn append_residue_by_connection(
        &mut self,
        mut residue: Residue,
        anchor_pos: usize,
        anchor_conn: usize,
        residue_conn: usize,
        build_ideal_geometry: bool,
    ) {
        self.check_seqpos(anchor_pos);
        self.assert_connection(anchor_pos, anchor_conn);
        assert!(
            (1..=residue.n_connections()).contains(&residue_conn),
            "connection {} out of range for residue {}",
            residue_conn,
            residue.name()
        );
        self.ensure_coordinates();
        let anchor = self.residue_at(anchor_pos);
        if build_ideal_geometry {
            orient_by_connection(anchor, anchor_conn, &mut residue, residue_conn);
        }
        let upstream_atom = anchor
            .template()
            .atom_name(anchor.connection_atom(anchor_conn))
            .to_owned();
        let downstream_atom = residue
            .template()
            .atom_name(residue.connection_atom(residue_conn))
            .to_owned();
        let seqpos = self.size() + 1;
        let chain = self.residue_at(seqpos - 1).chain();

        self.unbond(anchor_pos, anchor_conn);
        self.open_position(seqpos, residue, chain);
        self.bond(
            PartnerRef::new(anchor_pos, anchor_conn),
            PartnerRef::new(seqpos, residue_conn),
        );
        self.fold_tree.append_residue(Some(Link::Chemical {
            from: anchor_pos,
            upstream_atom,
            downstream_atom,
        }));
        self.patch_atom_tree_insert(seqpos);
        self.finish_edit(LengthKind::Append, seqpos, 1);
    }
}

impl Conformation {
    /// Inserts `residue` at `seqpos` attached by a jump to `anchor_pos`, given in pre-insertion
    /// numbering. A polymer bond crossing the insertion point is broken.
    pub fn insert_residue_by_jump(
        &mut self,
        residue: Residue,
        seqpos: usize,
        anchor_pos: usize,
        anchor_atom: Option<&str>,
        root_atom: Option<&str>,
        new_chain: bool,
    ) {
        assert!(
            (1..=self.size() + 1).contains(&seqpos),
            "insertion point {} out of range for {} residues",
            seqpos,
            self.size()
        );
        if self.is_empty() || seqpos == self.size() + 1 {
            self.append_residue_by_jump(residue, anchor_pos, anchor_atom, root_atom, new_chain);
            return;
        }
        self.check_seqpos(anchor_pos);
        self.ensure_coordinates();
        if seqpos > 1 {
            let lower = self.residue_at(seqpos - 1);
            if let Some(upper) = lower.upper_partner().filter(|p| p.rsd == seqpos)
                && let Some(connid) = lower.upper_connect()
            {
                debug!(seqpos, partner = upper.rsd, "Breaking polymer bond at insertion point.");
                self.unbond(seqpos - 1, connid);
            }
        }
        let chain = if new_chain {
            self.next_chain_id()
        } else if seqpos > 1 {
            self.residue_at(seqpos - 1).chain()
        } else {
            self.residue_at(seqpos).chain()
        };
        let anchor = if anchor_pos >= seqpos {
            anchor_pos + 1
        } else {
            anchor_pos
        };
        self.open_position(seqpos, residue, chain);
        self.fold_tree.insert_residue_by_link(
            seqpos,
            Link::Jump {
                from: anchor,
                label: 0,
                upstream_atom: anchor_atom.map(str::to_owned),
                downstream_atom: root_atom.map(str::to_owned),
            },
        );
        self.patch_atom_tree_insert(seqpos);
        let kind = if seqpos == 1 {
            LengthKind::Prepend
        } else {
            LengthKind::Insert
        };
        self.finish_edit(kind, seqpos, 1);
    }

    /// Splices a copy of `donor` in at `seqpos`, attaching its root by a new jump to `anchor_pos`
    /// (pre-insertion numbering). Donor residues keep their internal bonds and get fresh chain
    /// ids.
    #[instrument(skip_all, name = "insert_conformation_by_jump")]
    pub fn insert_conformation_by_jump(
        &mut self,
        donor: &Conformation,
        seqpos: usize,
        anchor_pos: usize,
        anchor_atom: Option<&str>,
        root_atom: Option<&str>,
    ) {
        assert!(
            (1..=self.size() + 1).contains(&seqpos),
            "insertion point {} out of range for {} residues",
            seqpos,
            self.size()
        );
        let count = donor.size();
        if count == 0 {
            return;
        }
        if !self.is_empty() {
            self.check_seqpos(anchor_pos);
        }
        self.ensure_coordinates();
        let mut donor = donor.clone();
        donor.ensure_coordinates();

        if seqpos > 1 && seqpos <= self.size() {
            let lower = self.residue_at(seqpos - 1);
            if let Some(connid) = lower.upper_connect()
                && lower.upper_partner().is_some_and(|p| p.rsd == seqpos)
            {
                self.unbond(seqpos - 1, connid);
            }
        }

        let map = insertion_map(self.size(), seqpos, count);
        for r in self.residues.values_mut() {
            r.renumber(&map);
        }
        let chain_base = self.next_chain_id() - 1;
        let offset = seqpos - 1;
        for (i, &donor_key) in donor.order.iter().enumerate() {
            let mut residue = donor.residues[donor_key].clone();
            residue.shift(offset);
            residue.set_chain(chain_base + residue.chain());
            let natoms = residue.natoms();
            let key = self.residues.insert(residue);
            self.order.insert(offset + i, key);
            self.xyz_moved.insert(offset + i, vec![true; natoms]);
            self.dof_moved.insert(offset + i, vec![false; natoms]);
            self.secstruct.insert(offset + i, donor.secstruct[i]);
        }

        let anchor = if anchor_pos >= seqpos {
            anchor_pos + count
        } else {
            anchor_pos
        };
        let mut fold_tree = self.fold_tree.clone();
        fold_tree.insert_fold_tree_by_jump(
            &donor.fold_tree,
            seqpos,
            anchor,
            anchor_atom.map(str::to_owned),
            root_atom.map(str::to_owned),
        );
        self.fold_tree.replace(fold_tree);
        self.rebuild_atom_tree();
        self.finish_edit(LengthKind::Insert, seqpos, count as isize);
    }
}

impl Conformation {
    /// Fast removal of a residue that is neither the fold-tree root, a jump point nor a chemical
    /// edge anchor. Its partners' connections become incomplete.
    pub fn delete_polymer_residue(&mut self, seqpos: usize) {
        self.check_seqpos(seqpos);
        assert!(
            !self.fold_tree.is_anchor(seqpos),
            "residue {} anchors a jump, chemical edge or the tree root; use delete_residue_slow",
            seqpos
        );
        self.ensure_coordinates();
        self.close_positions(seqpos, seqpos);
        self.fold_tree.delete_polymer_residue(seqpos);
        self.patch_atom_tree_delete(seqpos);
        self.finish_edit(LengthKind::Delete, seqpos, -1);
    }

    /// Removes any residue; the fold tree re-roots or re-anchors around the gap and the atom tree
    /// is rebuilt.
    pub fn delete_residue_slow(&mut self, seqpos: usize) {
        self.delete_residue_range_slow(seqpos, seqpos);
    }

    #[instrument(skip_all, name = "delete_residue_range_slow")]
    pub fn delete_residue_range_slow(&mut self, start: usize, end: usize) {
        assert!(start <= end, "empty deletion range {}..={}", start, end);
        self.check_seqpos(start);
        self.check_seqpos(end);
        self.ensure_coordinates();
        self.close_positions(start, end);
        self.fold_tree.delete_range_slow(start, end);
        self.rebuild_atom_tree();
        self.finish_edit(LengthKind::Delete, start, -((end - start + 1) as isize));
    }
}

impl Conformation {
    fn connection_on_atom(&self, seqpos: usize, atom_name: &str) -> usize {
        let residue = self.residue_at(seqpos);
        let atomno = residue.atom_index(atom_name).unwrap_or_else(|| {
            panic!("residue {} ({}) has no atom {}", seqpos, residue.name(), atom_name)
        });
        let candidates = residue.template().connections_at_atom(atomno);
        assert!(
            !candidates.is_empty(),
            "atom {} of residue {} ({}) carries no connection",
            atom_name,
            seqpos,
            residue.name()
        );
        candidates
            .iter()
            .copied()
            .find(|&c| residue.connection_incomplete(c))
            .unwrap_or(candidates[0])
    }

    /// Records a chemical bond between two named atoms, each of which must carry a connection
    /// point. Any previous bond on the chosen connections is broken first.
    pub fn declare_chemical_bond(
        &mut self,
        seqpos1: usize,
        atom1: &str,
        seqpos2: usize,
        atom2: &str,
    ) {
        self.check_seqpos(seqpos1);
        self.check_seqpos(seqpos2);
        assert_ne!(seqpos1, seqpos2, "a residue cannot bond to itself");
        let conn1 = self.connection_on_atom(seqpos1, atom1);
        let conn2 = self.connection_on_atom(seqpos2, atom2);
        self.unbond(seqpos1, conn1);
        self.unbond(seqpos2, conn2);
        self.bond(
            PartnerRef::new(seqpos1, conn1),
            PartnerRef::new(seqpos2, conn2),
        );
        debug!(seqpos1, atom1, seqpos2, atom2, "Declared chemical bond.");
        self.update_pseudo_bonds();
        self.torsions_dirty = true;
    }

    /// Breaks the bond on connection `connid` of the residue at `seqpos`.
    ///
    /// # Return
    ///
    /// `false` if the connection was already incomplete.
    pub fn break_chemical_bond(&mut self, seqpos: usize, connid: usize) -> bool {
        self.check_seqpos(seqpos);
        self.assert_connection(seqpos, connid);
        if !self.unbond(seqpos, connid) {
            return false;
        }
        self.update_pseudo_bonds();
        self.torsions_dirty = true;
        true
    }

    /// Re-expresses the residue at `seqpos` with another chemistry (for example a terminus or
    /// disulfide variant). Coordinates carry over by atom name; atoms new to `template` are built
    /// from internal coordinates, falling back to `rng`-placed placeholders.
    pub fn replace_residue_chemistry<R: Rng + ?Sized>(
        &mut self,
        seqpos: usize,
        template: Arc<ResidueTemplate>,
        rng: &mut R,
    ) {
        self.check_seqpos(seqpos);
        self.ensure_coordinates();
        let old = self.residue_at(seqpos);
        let morphed = old.morph_into(template, rng);
        let dropped: Vec<PartnerRef> = old
            .connect_map()
            .iter()
            .flatten()
            .filter(|p| !morphed.connect_map().contains(&Some(**p)))
            .copied()
            .collect();
        let carried: Vec<(usize, PartnerRef)> = morphed
            .connect_map()
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.map(|p| (i + 1, p)))
            .collect();
        let natoms = morphed.natoms();

        for partner in dropped {
            self.residue_at_mut(partner.rsd)
                .mark_connection_incomplete(partner.connid);
        }
        *self.residue_at_mut(seqpos) = morphed;
        for (connid, partner) in carried {
            self.residue_at_mut(partner.rsd)
                .set_connection_partner(partner.connid, PartnerRef::new(seqpos, connid));
        }
        self.xyz_moved[seqpos - 1] = vec![true; natoms];
        self.dof_moved[seqpos - 1] = vec![false; natoms];

        let refs = ordered(&self.residues, &self.order);
        self.atom_tree.replace_residue(seqpos, &refs, &self.fold_tree);
        self.update_pseudo_bonds();
        self.torsions_dirty = true;
        self.hubs.emit_identity(IdentityKind::Residue { seqpos });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chemistry::registry::ChemistryRegistry;
    use crate::core::chemistry::template::VariantKind;
    use crate::core::kinematics::fold_tree::FoldTree;
    use crate::core::models::ids::{AtomId, TorsionId};
    use crate::core::utils::geometry::{dihedral_degrees, wrap_degrees};
    use crate::engine::signals::LengthEvent;
    use nalgebra::Point3;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::Mutex;

    fn registry() -> Arc<ChemistryRegistry> {
        Arc::new(ChemistryRegistry::embedded().unwrap())
    }

    fn residue(registry: &ChemistryRegistry, name: &str) -> Residue {
        Residue::from_template(registry.get(name).unwrap())
    }

    fn chain_of(registry: &Arc<ChemistryRegistry>, names: &[&str]) -> Conformation {
        let mut conf = Conformation::new(Arc::clone(registry));
        conf.append_residue_by_jump(residue(registry, names[0]), 1, None, None, false);
        for name in &names[1..] {
            conf.append_residue_by_bond(residue(registry, name), true);
        }
        conf
    }

    fn record_lengths(conf: &mut Conformation) -> Arc<Mutex<Vec<LengthEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        conf.signals()
            .length
            .subscribe(move |e: &LengthEvent| sink.lock().unwrap().push(*e));
        seen
    }

    fn names(conf: &Conformation) -> Vec<String> {
        conf.residues().map(|r| r.name().to_owned()).collect()
    }

    fn max_deviation(a: &[Point3<f64>], b: &[Point3<f64>]) -> f64 {
        a.iter()
            .zip(b)
            .map(|(p, q)| (p - q).norm())
            .fold(0.0, f64::max)
    }

    mod appends {
        use super::*;

        #[test]
        fn first_residue_becomes_root_of_empty_conformation() {
            let reg = registry();
            let mut conf = Conformation::new(Arc::clone(&reg));
            let events = record_lengths(&mut conf);
            conf.append_residue_by_jump(residue(&reg, "ALA"), 1, None, None, false);
            assert_eq!(conf.size(), 1);
            assert_eq!(conf.fold_tree().root(), 1);
            assert_eq!(conf.atom_tree().residue_count(), 1);
            assert!(conf.is_consistent());
            assert_eq!(
                *events.lock().unwrap(),
                vec![LengthEvent {
                    kind: LengthKind::Append,
                    seqpos: 1,
                    delta: 1
                }]
            );
        }

        #[test]
        fn append_by_bond_builds_ideal_peptide_geometry() {
            let reg = registry();
            let mut conf = chain_of(&reg, &["ALA", "ALA"]);
            let c = conf.xyz_by_name(1, "C").unwrap();
            let ca1 = conf.xyz_by_name(1, "CA").unwrap();
            let n2 = conf.xyz_by_name(2, "N").unwrap();
            let ca2 = conf.xyz_by_name(2, "CA").unwrap();
            assert!(((n2 - c).norm() - 1.329).abs() < 1e-6);
            assert!((wrap_degrees(dihedral_degrees(&ca1, &c, &n2, &ca2) - 180.0)).abs() < 1e-6);
            assert_eq!(
                conf.residue(1).upper_partner(),
                Some(PartnerRef::new(2, conf.residue(2).lower_connect().unwrap()))
            );
            conf.ensure_torsions();
            assert!((wrap_degrees(conf.torsion(TorsionId::backbone(1, 3)) - 180.0)).abs() < 1e-6);
            assert!(conf.is_consistent());
        }

        #[test]
        fn append_by_bond_keeps_existing_atoms_in_place() {
            let reg = registry();
            let mut conf = chain_of(&reg, &["ALA", "ALA"]);
            let before: Vec<_> = conf.residues().flat_map(|r| r.coordinates().to_vec()).collect();
            conf.append_residue_by_bond(residue(&reg, "GLY"), true);
            let after: Vec<_> = conf
                .residues()
                .take(2)
                .flat_map(|r| r.coordinates().to_vec())
                .collect();
            assert!(max_deviation(&before, &after) < 1e-9);
            assert_eq!(conf.chain_endings(), &[] as &[usize]);
        }

        #[test]
        fn jump_append_with_new_chain_adds_chain_ending() {
            let reg = registry();
            let mut conf = chain_of(&reg, &["ALA", "ALA"]);
            conf.append_residue_by_jump(residue(&reg, "GLY"), 1, None, None, true);
            assert_eq!(conf.chain_endings(), &[2]);
            assert_eq!(conf.num_chains(), 2);
            assert_eq!(conf.chain(3), 2);
            assert_eq!(conf.fold_tree().num_jumps(), 1);
            assert!(conf.is_consistent());
        }

        #[test]
        #[should_panic(expected = "empty conformation")]
        fn append_by_bond_to_empty_conformation_panics() {
            let reg = registry();
            let mut conf = Conformation::new(Arc::clone(&reg));
            conf.append_residue_by_bond(residue(&reg, "ALA"), true);
        }
    }

    mod insertions {
        use super::*;

        #[test]
        fn insertion_after_bonded_residue_rejoins_both_neighbours() {
            let reg = registry();
            let mut conf = chain_of(&reg, &["ALA", "ALA", "ALA"]);
            let events = record_lengths(&mut conf);
            conf.append_polymer_residue_after_seqpos(residue(&reg, "GLY"), 1, true);
            assert_eq!(names(&conf), ["ALA", "GLY", "ALA", "ALA"]);
            assert_eq!(conf.residue(2).lower_partner().map(|p| p.rsd), Some(1));
            assert_eq!(conf.residue(2).upper_partner().map(|p| p.rsd), Some(3));
            assert!(conf.fold_tree().is_polymer_linked(2, 3));
            assert!(conf.is_consistent());
            assert_eq!(
                *events.lock().unwrap(),
                vec![LengthEvent {
                    kind: LengthKind::Insert,
                    seqpos: 2,
                    delta: 1
                }]
            );
        }

        #[test]
        fn prepend_at_start_reports_prepend() {
            let reg = registry();
            let mut conf = chain_of(&reg, &["ALA", "ALA"]);
            let events = record_lengths(&mut conf);
            conf.prepend_polymer_residue_before_seqpos(residue(&reg, "GLY"), 1, true);
            assert_eq!(names(&conf), ["GLY", "ALA", "ALA"]);
            assert_eq!(conf.residue(1).upper_partner().map(|p| p.rsd), Some(2));
            assert_eq!(events.lock().unwrap()[0].kind, LengthKind::Prepend);
            let c = conf.xyz_by_name(1, "C").unwrap();
            let n = conf.xyz_by_name(2, "N").unwrap();
            assert!(((n - c).norm() - 1.329).abs() < 1e-6);
            assert!(conf.is_consistent());
        }

        #[test]
        fn jump_insertion_breaks_crossing_polymer_bond() {
            let reg = registry();
            let mut conf = chain_of(&reg, &["ALA", "ALA", "ALA"]);
            conf.insert_residue_by_jump(residue(&reg, "GLY"), 2, 1, None, None, true);
            assert_eq!(names(&conf), ["ALA", "GLY", "ALA", "ALA"]);
            assert_eq!(conf.residue(1).upper_partner(), None);
            assert_eq!(conf.residue(3).lower_partner(), None);
            assert!(conf.fold_tree().is_cutpoint(1));
            assert_eq!(conf.num_chains(), 3);
            assert!(conf.is_consistent());
        }

        #[test]
        fn residue_keys_survive_renumbering() {
            let reg = registry();
            let mut conf = chain_of(&reg, &["ALA", "ALA"]);
            let key = conf.residue_key(2);
            conf.prepend_polymer_residue_before_seqpos(residue(&reg, "GLY"), 1, true);
            assert_eq!(conf.seqpos_of(key), Some(3));
            conf.delete_residue_slow(3);
            assert_eq!(conf.seqpos_of(key), None);
        }
    }

    mod deletions {
        use super::*;

        #[test]
        fn polymer_delete_marks_neighbours_incomplete() {
            let reg = registry();
            let mut conf = chain_of(&reg, &["ALA", "GLY", "ALA"]);
            let events = record_lengths(&mut conf);
            conf.delete_polymer_residue(2);
            assert_eq!(names(&conf), ["ALA", "ALA"]);
            assert_eq!(conf.residue(1).upper_partner(), None);
            assert_eq!(conf.residue(2).lower_partner(), None);
            assert!(conf.is_consistent());
            assert_eq!(
                *events.lock().unwrap(),
                vec![LengthEvent {
                    kind: LengthKind::Delete,
                    seqpos: 2,
                    delta: -1
                }]
            );
        }

        #[test]
        fn polymer_delete_keeps_remaining_coordinates() {
            let reg = registry();
            let mut conf = chain_of(&reg, &["ALA", "GLY", "ALA"]);
            let third: Vec<_> = conf.residue(3).coordinates().to_vec();
            conf.delete_polymer_residue(2);
            assert!(max_deviation(&third, conf.residue(2).coordinates()) < 1e-9);
        }

        #[test]
        #[should_panic(expected = "delete_residue_slow")]
        fn polymer_delete_of_root_panics() {
            let reg = registry();
            let mut conf = chain_of(&reg, &["ALA", "ALA"]);
            conf.delete_polymer_residue(1);
        }

        #[test]
        fn slow_delete_of_root_re_roots_tree() {
            let reg = registry();
            let mut conf = chain_of(&reg, &["ALA", "ALA", "ALA"]);
            let last: Vec<_> = conf.residue(3).coordinates().to_vec();
            conf.delete_residue_slow(1);
            assert_eq!(conf.size(), 2);
            assert_eq!(conf.fold_tree().root(), 1);
            assert!(max_deviation(&last, conf.residue(2).coordinates()) < 1e-9);
            assert!(conf.is_consistent());
        }

        #[test]
        fn range_delete_emits_single_event() {
            let reg = registry();
            let mut conf = chain_of(&reg, &["ALA", "GLY", "GLY", "ALA"]);
            let events = record_lengths(&mut conf);
            conf.delete_residue_range_slow(2, 3);
            assert_eq!(names(&conf), ["ALA", "ALA"]);
            assert_eq!(
                *events.lock().unwrap(),
                vec![LengthEvent {
                    kind: LengthKind::Delete,
                    seqpos: 2,
                    delta: -2
                }]
            );
            assert!(conf.is_consistent());
        }

        #[test]
        fn deleting_last_residue_leaves_empty_conformation() {
            let reg = registry();
            let mut conf = chain_of(&reg, &["ALA"]);
            conf.delete_residue_slow(1);
            assert!(conf.is_empty());
            assert!(conf.fold_tree().is_empty());
            assert_eq!(conf.num_chains(), 0);
            assert!(conf.is_consistent());
        }
    }

    mod splice {
        use super::*;

        #[test]
        fn donor_is_spliced_with_fresh_chain_and_internal_bonds() {
            let reg = registry();
            let mut host = chain_of(&reg, &["ALA", "ALA", "ALA", "ALA"]);
            let donor = chain_of(&reg, &["GLY", "GLY"]);
            let events = record_lengths(&mut host);
            host.insert_conformation_by_jump(&donor, 3, 1, None, None);
            assert_eq!(names(&host), ["ALA", "ALA", "GLY", "GLY", "ALA", "ALA"]);
            assert_eq!(host.residue(3).upper_partner().map(|p| p.rsd), Some(4));
            assert_eq!(host.residue(2).upper_partner(), None);
            assert_eq!(host.chain_endings(), &[2, 4]);
            assert_eq!(host.fold_tree().parent(3), Some(1));
            assert!(host.fold_tree().link(5).unwrap().is_jump());
            assert!(host.is_consistent());
            assert_eq!(
                *events.lock().unwrap(),
                vec![LengthEvent {
                    kind: LengthKind::Insert,
                    seqpos: 3,
                    delta: 2
                }]
            );
        }

        #[test]
        fn splice_preserves_donor_coordinates() {
            let reg = registry();
            let mut host = chain_of(&reg, &["ALA", "ALA"]);
            let donor = chain_of(&reg, &["GLY", "GLY"]);
            let donor_xyz: Vec<_> = donor
                .residues()
                .flat_map(|r| r.coordinates().to_vec())
                .collect();
            host.insert_conformation_by_jump(&donor, 3, 2, None, None);
            let spliced: Vec<_> = host
                .residues()
                .skip(2)
                .flat_map(|r| r.coordinates().to_vec())
                .collect();
            assert!(max_deviation(&donor_xyz, &spliced) < 1e-9);
        }

        #[test]
        fn splice_into_empty_conformation_copies_donor() {
            let reg = registry();
            let mut host = Conformation::new(Arc::clone(&reg));
            let donor = chain_of(&reg, &["GLY", "ALA"]);
            host.insert_conformation_by_jump(&donor, 1, 1, None, None);
            assert_eq!(names(&host), ["GLY", "ALA"]);
            assert_eq!(host.fold_tree(), &FoldTree::simple(2));
            assert!(host.is_consistent());
        }
        #[test]
        fn two_residue_donor_splits_five_residue_host() {
            let reg = registry();
            let mut host = chain_of(&reg, &["ALA", "ALA", "ALA", "ALA", "ALA"]);
            let donor = chain_of(&reg, &["GLY", "GLY"]);
            host.insert_conformation_by_jump(&donor, 3, 1, None, None);
            assert_eq!(
                names(&host),
                ["ALA", "ALA", "GLY", "GLY", "ALA", "ALA", "ALA"]
            );
            assert_eq!(host.chain_endings(), &[2, 4]);
            assert_eq!(host.residue(5).upper_partner().map(|p| p.rsd), Some(6));
            assert_eq!(host.residue(6).upper_partner().map(|p| p.rsd), Some(7));
            assert!(host.is_consistent());
        }
    }

    mod chemistry {
        use super::*;

        #[test]
        fn declare_and_break_chemical_bond_is_symmetric() {
            let reg = registry();
            let mut conf = chain_of(&reg, &["ALA", "ALA"]);
            let cys = reg.get("CYS:disulfide").unwrap();
            conf.append_residue_by_jump(Residue::from_template(cys.clone()), 1, None, None, true);
            conf.append_residue_by_jump(Residue::from_template(cys), 1, None, None, true);
            conf.declare_chemical_bond(3, "SG", 4, "SG");
            let conn = conf.residue(3).template().branch_connections()[0];
            assert_eq!(conf.residue(3).connection_partner(conn).map(|p| p.rsd), Some(4));
            assert!(conf.is_consistent());
            assert!(conf.break_chemical_bond(3, conn));
            assert!(!conf.break_chemical_bond(3, conn));
            assert_eq!(conf.residue(4).connection_partner(conn), None);
            assert!(conf.is_consistent());
        }

        #[test]
        #[should_panic(expected = "carries no connection")]
        fn chemical_bond_on_atom_without_connection_panics() {
            let reg = registry();
            let mut conf = chain_of(&reg, &["ALA", "ALA"]);
            conf.declare_chemical_bond(1, "CB", 2, "CB");
        }

        #[test]
        fn terminus_replacement_keeps_partners_and_emits_identity() {
            let reg = registry();
            let mut conf = chain_of(&reg, &["ALA", "ALA"]);
            let identities = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&identities);
            conf.signals()
                .identity
                .subscribe(move |e| sink.lock().unwrap().push(*e));
            let ala = reg.get("ALA").unwrap();
            let lower = reg.with_variant(&ala, VariantKind::LowerTerminus).unwrap();
            let mut rng = StdRng::seed_from_u64(11);
            let ca = conf.xyz_by_name(1, "CA").unwrap();
            conf.replace_residue_chemistry(1, lower, &mut rng);
            assert!(
                conf.residue(1)
                    .template()
                    .has_variant(VariantKind::LowerTerminus)
            );
            assert_eq!(conf.residue(1).upper_partner().map(|p| p.rsd), Some(2));
            assert!((conf.xyz_by_name(1, "CA").unwrap() - ca).norm() < 1e-9);
            assert_eq!(identities.lock().unwrap().len(), 1);
            assert!(conf.is_consistent());
        }
    }

    mod edit_sequences {
        use super::*;
        use rand::Rng;

        const SEEDS: u64 = 8;
        const STEPS: usize = 25;
        const MAX_SIZE: usize = 12;

        fn all_xyz(conf: &Conformation) -> Vec<Point3<f64>> {
            conf.residues()
                .flat_map(|r| r.coordinates().to_vec())
                .collect()
        }

        fn tree_xyz(conf: &Conformation) -> Vec<Point3<f64>> {
            (1..=conf.size())
                .flat_map(|seqpos| {
                    (1..=conf.residue(seqpos).natoms())
                        .map(move |atomno| conf.atom_tree().xyz(AtomId::new(seqpos, atomno)))
                })
                .collect()
        }

        fn random_edit(
            conf: &mut Conformation,
            reg: &Arc<ChemistryRegistry>,
            donor: &Conformation,
            rng: &mut StdRng,
        ) -> &'static str {
            let size = conf.size();
            let op = if size >= MAX_SIZE {
                rng.gen_range(3..5)
            } else if size <= 2 {
                rng.gen_range(0..3)
            } else {
                rng.gen_range(0..6)
            };
            let name = if rng.gen_bool(0.5) { "ALA" } else { "GLY" };
            match op {
                0 => {
                    conf.append_residue_by_bond(residue(reg, name), true);
                    "append by bond"
                }
                1 => {
                    let anchor = rng.gen_range(1..=size);
                    conf.append_polymer_residue_after_seqpos(residue(reg, name), anchor, true);
                    "polymer insert"
                }
                2 => {
                    let seqpos = rng.gen_range(1..=size + 1);
                    let anchor = rng.gen_range(1..=size);
                    let rsd = residue(reg, name);
                    conf.insert_residue_by_jump(rsd, seqpos, anchor, None, None, false);
                    "jump insert"
                }
                3 => {
                    let free: Vec<usize> = (1..=size)
                        .filter(|&p| !conf.fold_tree().is_anchor(p))
                        .collect();
                    if free.is_empty() {
                        conf.delete_residue_slow(rng.gen_range(1..=size));
                        "slow delete"
                    } else {
                        conf.delete_polymer_residue(free[rng.gen_range(0..free.len())]);
                        "fast delete"
                    }
                }
                4 => {
                    let start = rng.gen_range(1..=size);
                    let end = (start + rng.gen_range(0..2)).min(size);
                    conf.delete_residue_range_slow(start, end);
                    "slow delete"
                }
                _ => {
                    let seqpos = rng.gen_range(1..=size + 1);
                    let anchor = rng.gen_range(1..=size);
                    conf.insert_conformation_by_jump(donor, seqpos, anchor, None, None);
                    "splice"
                }
            }
        }

        #[test]
        fn random_edits_keep_conformation_consistent() {
            let reg = registry();
            let donor = chain_of(&reg, &["GLY", "GLY"]);
            for seed in 0..SEEDS {
                let mut rng = StdRng::seed_from_u64(seed);
                let mut conf = chain_of(&reg, &["ALA", "ALA", "ALA", "ALA", "ALA"]);
                for step in 0..STEPS {
                    let op = random_edit(&mut conf, &reg, &donor, &mut rng);
                    assert!(conf.is_consistent(), "seed {seed}, step {step}: {op}");
                    if conf.is_empty() {
                        break;
                    }

                    conf.ensure_coordinates();
                    assert!(
                        max_deviation(&tree_xyz(&conf), &all_xyz(&conf)) < 1e-9,
                        "seed {seed}, step {step}: {op} left the cache out of sync"
                    );

                    let mut rebuilt = conf.clone();
                    rebuilt.rebuild_atom_tree();
                    let seqpos = rng.gen_range(1..=conf.size());
                    let id = TorsionId::backbone(seqpos, rng.gen_range(1..=2));
                    let value = rng.gen_range(-180.0..180.0);
                    let defined = conf.torsion_atoms(id).is_some();
                    let applied = conf.set_torsion(id, value);
                    assert_eq!(
                        applied,
                        rebuilt.set_torsion(id, value),
                        "seed {seed}, step {step}: {id}"
                    );
                    if !defined {
                        assert!(!applied);
                        assert!(!conf.coordinates_stale());
                    }
                    conf.ensure_coordinates();
                    rebuilt.ensure_coordinates();
                    assert!(
                        max_deviation(&all_xyz(&conf), &all_xyz(&rebuilt)) < 1e-6,
                        "seed {seed}, step {step}: {id} after {op}"
                    );
                    assert!(conf.is_consistent(), "seed {seed}, step {step}: {id}");
                }
            }
        }
    }

    #[test]
    fn every_mutation_marks_torsions_stale() {
        let reg = registry();
        let mut conf = chain_of(&reg, &["ALA", "ALA", "ALA"]);
        conf.ensure_torsions();
        conf.delete_polymer_residue(2);
        assert!(conf.torsions_stale());
        conf.ensure_torsions();
        conf.append_residue_by_bond(residue(&reg, "ALA"), true);
        assert!(conf.torsions_stale());
        assert!(!conf.coordinates_stale());
        assert!(conf.xyz_moved(AtomId::new(3, 1)));
    }
}
