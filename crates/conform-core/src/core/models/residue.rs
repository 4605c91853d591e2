use nalgebra::{Isometry3, Point3, Vector3};
use rand::Rng;
use std::sync::Arc;
use tracing::warn;

use crate::core::chemistry::template::{ConnectionKind, ResidueTemplate};
use crate::core::utils::geometry::place_atom;

/// The far side of a bonded connection point: partner residue and its connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartnerRef {
    pub rsd: usize,
    pub connid: usize,
}

impl PartnerRef {
    pub const fn new(rsd: usize, connid: usize) -> Self {
        Self { rsd, connid }
    }
}

/// Per-residue cache: chemistry handle, Cartesian coordinates, cached torsions and the
/// connection-partner table.
///
/// Residues are owned by a `Conformation`; positions (`seqpos`) and partner references are plain
/// 1-based indices that the owner rewrites on every topology edit.
#[derive(Debug, Clone, PartialEq)]
pub struct Residue {
    template: Arc<ResidueTemplate>,
    seqpos: usize,
    chain: usize,
    xyz: Vec<Point3<f64>>,
    pub(crate) mainchain_torsions: Vec<f64>,
    pub(crate) chi: Vec<f64>,
    pub(crate) nu: Vec<f64>,
    partners: Vec<Option<PartnerRef>>,
}

impl Residue {
    /// A fresh residue with the template's ideal coordinates and every connection incomplete.
    pub fn from_template(template: Arc<ResidueTemplate>) -> Self {
        let xyz = template.ideal_coordinates();
        let partners = vec![None; template.n_connections()];
        Self {
            mainchain_torsions: vec![0.0; template.mainchain().len()],
            chi: vec![0.0; template.chi_atoms().len()],
            nu: vec![0.0; template.nu_atoms().len()],
            template,
            seqpos: 0,
            chain: 1,
            xyz,
            partners,
        }
    }

    pub fn template(&self) -> &Arc<ResidueTemplate> {
        &self.template
    }

    pub fn name(&self) -> &str {
        self.template.name()
    }

    pub fn natoms(&self) -> usize {
        self.xyz.len()
    }

    pub fn seqpos(&self) -> usize {
        self.seqpos
    }

    pub(crate) fn set_seqpos(&mut self, seqpos: usize) {
        self.seqpos = seqpos;
    }

    pub fn chain(&self) -> usize {
        self.chain
    }

    pub(crate) fn set_chain(&mut self, chain: usize) {
        self.chain = chain;
    }

    pub fn atom_index(&self, name: &str) -> Option<usize> {
        self.template.atom_index(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.atom_index(name).is_some()
    }

    pub fn xyz(&self, atomno: usize) -> Point3<f64> {
        assert!(
            (1..=self.xyz.len()).contains(&atomno),
            "atom {} out of range for residue {} ({} atoms)",
            atomno,
            self.name(),
            self.xyz.len()
        );
        self.xyz[atomno - 1]
    }

    pub fn xyz_by_name(&self, name: &str) -> Option<Point3<f64>> {
        self.atom_index(name).map(|i| self.xyz[i - 1])
    }

    pub fn set_xyz(&mut self, atomno: usize, position: Point3<f64>) {
        assert!(
            (1..=self.xyz.len()).contains(&atomno),
            "atom {} out of range for residue {}",
            atomno,
            self.name()
        );
        self.xyz[atomno - 1] = position;
    }

    pub fn coordinates(&self) -> &[Point3<f64>] {
        &self.xyz
    }

    pub fn nbr_xyz(&self) -> Point3<f64> {
        self.xyz(self.template.nbr_atom())
    }

    /// Cached mainchain torsion `k` (1-based), in degrees.
    pub fn mainchain_torsion(&self, k: usize) -> f64 {
        self.mainchain_torsions[k - 1]
    }

    pub fn mainchain_torsions(&self) -> &[f64] {
        &self.mainchain_torsions
    }

    pub fn chi(&self, k: usize) -> f64 {
        self.chi[k - 1]
    }

    pub fn nu(&self, k: usize) -> f64 {
        self.nu[k - 1]
    }

    pub fn n_connections(&self) -> usize {
        self.partners.len()
    }

    pub fn connection_partner(&self, connid: usize) -> Option<PartnerRef> {
        self.partners[connid - 1]
    }

    pub fn connect_map(&self) -> &[Option<PartnerRef>] {
        &self.partners
    }

    pub(crate) fn set_connection_partner(&mut self, connid: usize, partner: PartnerRef) {
        self.partners[connid - 1] = Some(partner);
    }

    pub(crate) fn mark_connection_incomplete(&mut self, connid: usize) {
        self.partners[connid - 1] = None;
    }

    pub fn connection_incomplete(&self, connid: usize) -> bool {
        self.partners[connid - 1].is_none()
    }

    pub fn incomplete_connections(&self) -> Vec<usize> {
        (1..=self.partners.len())
            .filter(|&c| self.partners[c - 1].is_none())
            .collect()
    }

    pub fn has_incomplete_connection(&self) -> bool {
        self.partners.iter().any(Option::is_none)
    }

    pub fn lower_connect(&self) -> Option<usize> {
        self.template.lower_connect()
    }

    pub fn upper_connect(&self) -> Option<usize> {
        self.template.upper_connect()
    }

    /// Residue bonded through the polymer lower connection, if any.
    pub fn lower_partner(&self) -> Option<PartnerRef> {
        self.lower_connect().and_then(|c| self.connection_partner(c))
    }

    pub fn upper_partner(&self) -> Option<PartnerRef> {
        self.upper_connect().and_then(|c| self.connection_partner(c))
    }

    pub fn is_bonded_to(&self, other: usize) -> bool {
        self.partners.iter().flatten().any(|p| p.rsd == other)
    }

    /// True when `other` is bonded through this residue's lower or upper polymer connection.
    pub fn is_polymer_bonded(&self, other: usize) -> bool {
        self.lower_partner().is_some_and(|p| p.rsd == other)
            || self.upper_partner().is_some_and(|p| p.rsd == other)
    }

    pub fn connection_kind(&self, connid: usize) -> ConnectionKind {
        self.template.connection(connid).kind
    }

    pub fn connection_atom(&self, connid: usize) -> usize {
        self.template.connection(connid).atom
    }

    /// Ideal position of the partner atom across connection `connid`, from this residue's current
    /// coordinates and the connection's internal-coordinate template.
    pub fn predicted_partner_position(&self, connid: usize) -> Option<Point3<f64>> {
        let conn = self.template.connection(connid);
        place_atom(
            &self.xyz(conn.stub[1]),
            &self.xyz(conn.stub[0]),
            &self.xyz(conn.atom),
            conn.distance,
            conn.angle,
            conn.dihedral,
        )
    }

    pub fn apply_transform(&mut self, transform: &Isometry3<f64>) {
        for p in &mut self.xyz {
            *p = transform * *p;
        }
    }

    /// Rewrites `seqpos` and partner references through `old_to_new`, indexed by old position
    /// minus one. Partners that map to `None` (deleted) become incomplete.
    pub(crate) fn renumber(&mut self, old_to_new: &[Option<usize>]) {
        if let Some(Some(new)) = old_to_new.get(self.seqpos.wrapping_sub(1)) {
            self.seqpos = *new;
        }
        for partner in &mut self.partners {
            *partner = partner.and_then(|p| {
                old_to_new
                    .get(p.rsd - 1)
                    .copied()
                    .flatten()
                    .map(|rsd| PartnerRef { rsd, ..p })
            });
        }
    }

    /// Adds `offset` to `seqpos` and every partner reference.
    pub(crate) fn shift(&mut self, offset: usize) {
        self.seqpos += offset;
        for p in self.partners.iter_mut().flatten() {
            p.rsd += offset;
        }
    }

    /// Copy of this residue re-expressed with another chemistry of the same base residue.
    ///
    /// Coordinates are carried over by atom name. Atoms the new template adds are built from its
    /// internal coordinates; when the placement stub is missing or degenerate a randomized
    /// placeholder next to a bonded neighbour is used instead. Partners are carried over for
    /// connections with the same kind on the same atom.
    pub fn morph_into<R: Rng + ?Sized>(
        &self,
        template: Arc<ResidueTemplate>,
        rng: &mut R,
    ) -> Residue {
        let mut morphed = Residue::from_template(template.clone());
        morphed.seqpos = self.seqpos;
        morphed.chain = self.chain;
        morphed.mainchain_torsions = self.mainchain_torsions.clone();
        morphed
            .mainchain_torsions
            .resize(template.mainchain().len(), 0.0);
        morphed.chi.iter_mut().zip(&self.chi).for_each(|(n, o)| *n = *o);
        morphed.nu.iter_mut().zip(&self.nu).for_each(|(n, o)| *n = *o);

        let mut known = vec![false; template.natoms()];
        for atomno in 1..=template.natoms() {
            if let Some(p) = self.xyz_by_name(template.atom_name(atomno)) {
                morphed.xyz[atomno - 1] = p;
                known[atomno - 1] = true;
            }
        }

        for atomno in 1..=template.natoms() {
            if known[atomno - 1] {
                continue;
            }
            let built = template.icoor(atomno).and_then(|ic| {
                if ic.stub.iter().all(|&s| known[s - 1]) {
                    place_atom(
                        &morphed.xyz[ic.stub[2] - 1],
                        &morphed.xyz[ic.stub[1] - 1],
                        &morphed.xyz[ic.stub[0] - 1],
                        ic.distance,
                        ic.angle,
                        ic.dihedral,
                    )
                } else {
                    None
                }
            });
            morphed.xyz[atomno - 1] = match built {
                Some(p) => p,
                None => {
                    let anchor = template
                        .bonded_neighbors(atomno)
                        .iter()
                        .find(|&&n| known[n - 1])
                        .map(|&n| morphed.xyz[n - 1])
                        .unwrap_or_else(|| self.nbr_xyz());
                    warn!(
                        residue = template.name(),
                        atom = template.atom_name(atomno),
                        "Degenerate reconstruction; using randomized placeholder position"
                    );
                    anchor + random_unit_vector(rng)
                }
            };
            known[atomno - 1] = true;
        }

        for (new_conn, conn) in template.connections().iter().enumerate() {
            let atom_name = template.atom_name(conn.atom);
            let carried = self
                .template
                .connections()
                .iter()
                .position(|old| {
                    old.kind == conn.kind && self.template.atom_name(old.atom) == atom_name
                })
                .and_then(|old| self.partners[old]);
            morphed.partners[new_conn] = carried;
        }
        morphed
    }
}

fn random_unit_vector<R: Rng + ?Sized>(rng: &mut R) -> Vector3<f64> {
    loop {
        let v = Vector3::new(
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
        );
        let norm = v.norm();
        if norm > 1e-3 && norm <= 1.0 {
            return v / norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chemistry::registry::ChemistryRegistry;
    use crate::core::chemistry::template::VariantKind;
    use crate::core::utils::geometry::{bond_angle_degrees, dihedral_degrees};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn registry() -> ChemistryRegistry {
        ChemistryRegistry::embedded().unwrap()
    }

    fn residue(name: &str) -> Residue {
        Residue::from_template(registry().get(name).unwrap())
    }

    #[test]
    fn from_template_starts_with_incomplete_connections() {
        let ala = residue("ALA");
        assert_eq!(ala.natoms(), 10);
        assert_eq!(ala.n_connections(), 2);
        assert!(ala.has_incomplete_connection());
        assert_eq!(ala.incomplete_connections(), vec![1, 2]);
        assert_eq!(ala.mainchain_torsions().len(), 3);
    }

    #[test]
    fn predicted_partner_position_follows_connection_template() {
        let ala = residue("ALA");
        let upper = ala.upper_connect().unwrap();
        let n_next = ala.predicted_partner_position(upper).unwrap();
        let c = ala.xyz_by_name("C").unwrap();
        let ca = ala.xyz_by_name("CA").unwrap();
        let n = ala.xyz_by_name("N").unwrap();
        assert!(((n_next - c).norm() - 1.329).abs() < 1e-9);
        assert!((bond_angle_degrees(&ca, &c, &n_next) - 116.2).abs() < 1e-7);
        assert!((dihedral_degrees(&n, &ca, &c, &n_next) - 150.0).abs() < 1e-7);
    }

    #[test]
    fn apply_transform_moves_every_atom_rigidly() {
        let mut ala = residue("ALA");
        let before = ala.coordinates().to_vec();
        let iso = Isometry3::new(Vector3::new(1.0, -2.0, 3.0), Vector3::new(0.0, 0.0, 1.0));
        ala.apply_transform(&iso);
        for (old, new) in before.iter().zip(ala.coordinates()) {
            assert!((iso * old - new).norm() < 1e-12);
        }
    }

    mod renumbering {
        use super::*;

        #[test]
        fn renumber_rewrites_seqpos_and_partners() {
            let mut ala = residue("ALA");
            ala.set_seqpos(3);
            ala.set_connection_partner(1, PartnerRef::new(2, 2));
            ala.set_connection_partner(2, PartnerRef::new(4, 1));
            let map = vec![Some(1), Some(3), Some(4), Some(5)];
            ala.renumber(&map);
            assert_eq!(ala.seqpos(), 4);
            assert_eq!(ala.connection_partner(1), Some(PartnerRef::new(3, 2)));
            assert_eq!(ala.connection_partner(2), Some(PartnerRef::new(5, 1)));
        }

        #[test]
        fn renumber_drops_partners_mapped_to_deleted_residues() {
            let mut ala = residue("ALA");
            ala.set_seqpos(3);
            ala.set_connection_partner(1, PartnerRef::new(2, 2));
            let map = vec![Some(1), None, Some(2)];
            ala.renumber(&map);
            assert_eq!(ala.seqpos(), 2);
            assert!(ala.connection_incomplete(1));
        }
    }

    mod morphing {
        use super::*;

        #[test]
        fn morph_to_disulfide_drops_thiol_hydrogen_and_keeps_positions() {
            let reg = registry();
            let cys = Residue::from_template(reg.get("CYS").unwrap());
            let cyd_template = reg
                .with_variant(cys.template(), VariantKind::Disulfide)
                .unwrap();
            let mut rng = StdRng::seed_from_u64(7);
            let cyd = cys.morph_into(cyd_template, &mut rng);
            assert!(!cyd.has("HG"));
            assert_eq!(cyd.xyz_by_name("SG"), cys.xyz_by_name("SG"));
            assert_eq!(cyd.n_connections(), 3);
            assert!(cyd.connection_incomplete(3));
        }

        #[test]
        fn morph_back_rebuilds_missing_atoms_from_internal_coordinates() {
            let reg = registry();
            let cyd = Residue::from_template(reg.get("CYS:disulfide").unwrap());
            let mut rng = StdRng::seed_from_u64(7);
            let cys = cyd.morph_into(reg.get("CYS").unwrap(), &mut rng);
            let hg = cys.xyz_by_name("HG").unwrap();
            let sg = cys.xyz_by_name("SG").unwrap();
            assert!(((hg - sg).norm() - 1.33).abs() < 1e-9);
        }

        #[test]
        fn morph_keeps_polymer_partners() {
            let reg = registry();
            let mut cys = Residue::from_template(reg.get("CYS").unwrap());
            cys.set_connection_partner(1, PartnerRef::new(1, 2));
            cys.set_connection_partner(2, PartnerRef::new(3, 1));
            let mut rng = StdRng::seed_from_u64(1);
            let cyd = cys.morph_into(reg.get("CYS:disulfide").unwrap(), &mut rng);
            assert_eq!(cyd.lower_partner(), Some(PartnerRef::new(1, 2)));
            assert_eq!(cyd.upper_partner(), Some(PartnerRef::new(3, 1)));
        }

        #[test]
        fn degenerate_stub_falls_back_to_seeded_placeholder() {
            let reg = registry();
            let mut cyd = Residue::from_template(reg.get("CYS:disulfide").unwrap());
            let sg = cyd.atom_index("SG").unwrap();
            let cb = cyd.xyz_by_name("CB").unwrap();
            let ca = cyd.xyz_by_name("CA").unwrap();
            cyd.set_xyz(sg, cb + (cb - ca));
            let mut first = StdRng::seed_from_u64(42);
            let mut second = StdRng::seed_from_u64(42);
            let a = cyd.morph_into(reg.get("CYS").unwrap(), &mut first);
            let b = cyd.morph_into(reg.get("CYS").unwrap(), &mut second);
            let hg_a = a.xyz_by_name("HG").unwrap();
            assert_eq!(hg_a, b.xyz_by_name("HG").unwrap());
            let sg_pos = a.xyz_by_name("SG").unwrap();
            assert!(((hg_a - sg_pos).norm() - 1.0).abs() < 1e-9);
        }
    }
}
