use crate::core::chemistry::template::{BackboneFamily, ResidueTemplate};
use crate::core::kinematics::jump::JUMP_DOFS;
use crate::core::models::ids::{AtomId, TorsionId, TorsionType};
use crate::core::models::residue::{PartnerRef, Residue};

/// Resolves mainchain torsions of one backbone family to concrete atoms.
pub trait BackboneTorsions: Sync {
    fn torsion_count(&self, template: &ResidueTemplate) -> usize;

    /// The four atoms of mainchain torsion `index` (1-based) of the residue at `seqpos`.
    fn torsion_atoms(&self, residues: &[&Residue], seqpos: usize, index: usize)
    -> Option<[AtomId; 4]>;
}

/// Peptide-like backbones: torsion `k` spans extended mainchain positions `k-1..=k+2`, where
/// position 0 and positions past the end are borrowed from placeholders, partners or caps.
pub struct StandardBackbone;

/// Table-driven backbones: `(residue offset, atom name)` per torsion.
pub struct TableBackbone {
    table: &'static [[(isize, &'static str); 4]],
}

pub static BETA_PEPTIDE_BACKBONE: TableBackbone = TableBackbone {
    table: &[
        [(-1, "C"), (0, "N"), (0, "CA"), (0, "CM")],
        [(0, "N"), (0, "CA"), (0, "CM"), (0, "C")],
        [(0, "CA"), (0, "CM"), (0, "C"), (1, "N")],
        [(0, "CM"), (0, "C"), (1, "N"), (1, "CA")],
    ],
};

pub static OLIGOUREA_BACKBONE: TableBackbone = TableBackbone {
    table: &[
        [(-1, "C"), (0, "N"), (0, "CA"), (0, "CM")],
        [(0, "N"), (0, "CA"), (0, "CM"), (0, "NU")],
        [(0, "CA"), (0, "CM"), (0, "NU"), (0, "C")],
        [(0, "CM"), (0, "NU"), (0, "C"), (1, "N")],
        [(0, "NU"), (0, "C"), (1, "N"), (1, "CA")],
    ],
};

pub fn backbone_for(family: BackboneFamily) -> Option<&'static dyn BackboneTorsions> {
    match family {
        BackboneFamily::Standard => Some(&StandardBackbone),
        BackboneFamily::BetaPeptide => Some(&BETA_PEPTIDE_BACKBONE),
        BackboneFamily::Oligourea => Some(&OLIGOUREA_BACKBONE),
        BackboneFamily::None => None,
    }
}

/// Number of torsions of class `kind` defined on a residue.
pub fn torsion_count(residue: &Residue, kind: TorsionType) -> usize {
    let template = residue.template();
    match kind {
        TorsionType::Backbone => backbone_for(template.family())
            .map(|b| b.torsion_count(template))
            .unwrap_or(0),
        TorsionType::Chi => template.chi_atoms().len(),
        TorsionType::Nu => template.nu_atoms().len(),
        TorsionType::Branch => template.branch_connections().len(),
        TorsionType::Jump => JUMP_DOFS,
    }
}

/// The four atoms defining a symbolic torsion, or `None` if it is undefined in the current
/// topology. Jump torsions never have atoms.
pub fn torsion_atoms(residues: &[&Residue], id: TorsionId) -> Option<[AtomId; 4]> {
    let residue = residues.get(id.rsd.checked_sub(1)?)?;
    let template = residue.template();
    let index = id.index.checked_sub(1)?;
    let local = |atoms: &[usize; 4]| atoms.map(|a| AtomId::new(id.rsd, a));
    match id.kind {
        TorsionType::Backbone => {
            backbone_for(template.family())?.torsion_atoms(residues, id.rsd, id.index)
        }
        TorsionType::Chi => template.chi_atoms().get(index).map(local),
        TorsionType::Nu => template.nu_atoms().get(index).map(local),
        TorsionType::Branch => branch_atoms(residues, id.rsd, index),
        TorsionType::Jump => None,
    }
}

fn branch_atoms(residues: &[&Residue], seqpos: usize, index: usize) -> Option<[AtomId; 4]> {
    let residue = residues[seqpos - 1];
    let template = residue.template();
    let connid = *template.branch_connections().get(index)?;
    let own_atom = template.connection(connid).atom;
    let partner = residue.connection_partner(connid)?;
    let partner_template = residues.get(partner.rsd - 1)?.template();
    let partner_atom = partner_template.connection(partner.connid).atom;
    let own_neighbor = *template.heavy_neighbors(own_atom).first()?;
    let partner_neighbor = *partner_template.heavy_neighbors(partner_atom).first()?;
    Some([
        AtomId::new(seqpos, own_neighbor),
        AtomId::new(seqpos, own_atom),
        AtomId::new(partner.rsd, partner_atom),
        AtomId::new(partner.rsd, partner_neighbor),
    ])
}

impl BackboneTorsions for StandardBackbone {
    fn torsion_count(&self, template: &ResidueTemplate) -> usize {
        template.mainchain().len()
    }

    fn torsion_atoms(
        &self,
        residues: &[&Residue],
        seqpos: usize,
        index: usize,
    ) -> Option<[AtomId; 4]> {
        let residue = residues[seqpos - 1];
        let n = residue.template().mainchain().len();
        if index == 0 || index > n {
            return None;
        }
        let first = index as isize - 1;
        let mut atoms = [AtomId::new(0, 0); 4];
        for (slot, position) in atoms.iter_mut().zip(first..first + 4) {
            *slot = extended_mainchain_atom(residues, seqpos, position)?;
        }
        Some(atoms)
    }
}

/// Mainchain atom at `position` along the residue's mainchain extended across its polymer
/// connections. Positions `1..=n` are the residue's own; `0, -1` and `n+1, n+2` look past the
/// lower and upper ends.
fn extended_mainchain_atom(
    residues: &[&Residue],
    seqpos: usize,
    position: isize,
) -> Option<AtomId> {
    let residue = residues[seqpos - 1];
    let template = residue.template();
    let mainchain = template.mainchain();
    let n = mainchain.len() as isize;
    if (1..=n).contains(&position) {
        return Some(AtomId::new(seqpos, mainchain[position as usize - 1]));
    }
    if position <= 0 {
        let depth = (1 - position) as usize;
        beyond_end(
            residues,
            seqpos,
            depth,
            template.lower_placeholders(),
            residue.lower_partner(),
            template.lower_cap(),
            -1,
        )
    } else {
        let depth = (position - n) as usize;
        beyond_end(
            residues,
            seqpos,
            depth,
            template.upper_placeholders(),
            residue.upper_partner(),
            template.upper_cap(),
            1,
        )
    }
}

/// Walks `depth` atoms past one end of the mainchain: cut placeholders first, then the bonded
/// partner's mainchain away from the junction, then the terminal cap.
fn beyond_end(
    residues: &[&Residue],
    seqpos: usize,
    depth: usize,
    placeholders: &[usize],
    partner: Option<PartnerRef>,
    cap: Option<usize>,
    direction: isize,
) -> Option<AtomId> {
    if let Some(&atom) = placeholders.get(depth - 1) {
        return Some(AtomId::new(seqpos, atom));
    }
    if let Some(partner) = partner {
        let other = residues.get(partner.rsd - 1)?.template();
        let junction = other.connection(partner.connid).atom;
        let mainchain = other.mainchain();
        let at = mainchain.iter().position(|&a| a == junction)? as isize;
        let step = at + direction * (depth as isize - 1);
        return usize::try_from(step)
            .ok()
            .and_then(|i| mainchain.get(i))
            .map(|&a| AtomId::new(partner.rsd, a));
    }
    match (depth, cap) {
        (1, Some(atom)) => Some(AtomId::new(seqpos, atom)),
        _ => None,
    }
}

impl BackboneTorsions for TableBackbone {
    fn torsion_count(&self, _template: &ResidueTemplate) -> usize {
        self.table.len()
    }

    fn torsion_atoms(
        &self,
        residues: &[&Residue],
        seqpos: usize,
        index: usize,
    ) -> Option<[AtomId; 4]> {
        let entry = self.table.get(index.checked_sub(1)?)?;
        let residue = residues[seqpos - 1];
        let mut atoms = [AtomId::new(0, 0); 4];
        for (slot, &(offset, name)) in atoms.iter_mut().zip(entry.iter()) {
            let rsd = match offset {
                0 => seqpos,
                -1 => residue.lower_partner()?.rsd,
                1 => residue.upper_partner()?.rsd,
                _ => return None,
            };
            let atomno = residues.get(rsd - 1)?.atom_index(name)?;
            *slot = AtomId::new(rsd, atomno);
        }
        Some(atoms)
    }
}
