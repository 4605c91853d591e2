use itertools::{Itertools, iproduct};
use kiddo::{KdTree, SquaredEuclidean};
use rand::Rng;
use std::collections::HashSet;
use tracing::{debug, info, instrument};

use super::config::{BondDetectionConfig, DisulfideWindow};
use super::conformation::{Conformation, ordered};
use super::error::ConformationError;
use crate::core::chemistry::template::{Representation, VariantKind};
use crate::core::models::pseudo_bond::PseudoBond;
use crate::core::models::residue::{PartnerRef, Residue};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Outcome of a disulfide detection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisulfideReport {
    /// Pairs bonded by this pass, explicit pairs first, then by increasing deviation from ideal.
    pub formed: Vec<(usize, usize)>,
    /// Residues converted back to the free-thiol chemistry.
    pub reverted: Vec<usize>,
}

/// A scored pairing of two open connection points, `lower.rsd < upper.rsd`.
#[derive(Debug, Clone, Copy)]
struct BondCandidate {
    score: f64,
    lower: PartnerRef,
    upper: PartnerRef,
}

fn point(residue: &Residue, atomno: usize) -> [f64; 3] {
    let p = residue.xyz(atomno);
    [p.x, p.y, p.z]
}

/// Scores every eligible pairing between the open connections of `site` and those of nearby
/// residues with a higher position.
fn candidates_for(
    residues: &[&Residue],
    open: &[Vec<usize>],
    tree: &KdTree<f64, 3>,
    site: usize,
    radius: f64,
    tolerance: f64,
) -> Vec<BondCandidate> {
    let first = residues[site - 1];
    let mut candidates = Vec::new();
    let center = point(first, first.template().nbr_atom());
    for neighbor in tree.within::<SquaredEuclidean>(&center, radius * radius) {
        let other = neighbor.item as usize;
        if other <= site {
            continue;
        }
        let second = residues[other - 1];
        for (&c1, &c2) in iproduct!(&open[site - 1], &open[other - 1]) {
            let t1 = first.template();
            let t2 = second.template();
            let ct1 = t1.connection(c1);
            let ct2 = t2.connection(c2);
            let x1 = first.xyz(ct1.atom);
            let x2 = second.xyz(ct2.atom);
            let d = (x1 - x2).norm();
            let dev1 = (d - ct1.distance).abs();
            let dev2 = (d - ct2.distance).abs();
            if dev1 > tolerance || dev2 > tolerance {
                continue;
            }
            let mut score = dev1 + dev2;
            if t1.connections_at_atom(ct1.atom).len() > 1
                && let Some(expected) = first.predicted_partner_position(c1)
            {
                score += (expected - x2).norm();
            }
            if t2.connections_at_atom(ct2.atom).len() > 1
                && let Some(expected) = second.predicted_partner_position(c2)
            {
                score += (expected - x1).norm();
            }
            candidates.push(BondCandidate {
                score,
                lower: PartnerRef::new(site, c1),
                upper: PartnerRef::new(other, c2),
            });
        }
    }
    candidates
}

fn disulfide_window(
    config: &BondDetectionConfig,
    representation: Representation,
) -> DisulfideWindow {
    match representation {
        Representation::FullAtom => config.disulfide.full_atom,
        Representation::Centroid => config.disulfide.centroid,
    }
}

impl Conformation {
    /// Infers chemical bonds between incomplete connection points from their spatial arrangement.
    ///
    /// Candidates are committed greedily in order of increasing score, ties broken by the lower
    /// then upper `(residue, connection)`; points left unmatched stay incomplete.
    ///
    /// # Return
    ///
    /// The number of bonds formed.
    #[instrument(skip_all, name = "detect_bonds")]
    pub fn detect_bonds(&mut self, config: &BondDetectionConfig) -> usize {
        self.ensure_coordinates();
        let candidates = {
            let refs = ordered(&self.residues, &self.order);
            let open: Vec<Vec<usize>> = refs.iter().map(|r| r.incomplete_connections()).collect();
            let sites: Vec<usize> = (1..=refs.len()).filter(|&i| !open[i - 1].is_empty()).collect();
            if sites.len() < 2 {
                return 0;
            }
            let mut tree: KdTree<f64, 3> = KdTree::with_capacity(sites.len());
            for &site in &sites {
                let residue = refs[site - 1];
                tree.add(&point(residue, residue.template().nbr_atom()), site as u64);
            }
            let max_bond = sites
                .iter()
                .flat_map(|&s| open[s - 1].iter().map(move |&c| (s, c)))
                .map(|(s, c)| refs[s - 1].template().connection(c).distance)
                .fold(0.0, f64::max);
            let max_radius = sites
                .iter()
                .map(|&s| refs[s - 1].template().nbr_radius())
                .fold(0.0, f64::max);
            let radius = max_bond + 2.0 * max_radius + config.search_margin;

            #[cfg(not(feature = "parallel"))]
            let iterator = sites.iter();

            #[cfg(feature = "parallel")]
            let iterator = sites.par_iter();

            let mut candidates: Vec<BondCandidate> = iterator
                .map(|&site| {
                    candidates_for(&refs, &open, &tree, site, radius, config.distance_tolerance)
                })
                .flatten()
                .collect();
            candidates.sort_by(|a, b| {
                a.score
                    .total_cmp(&b.score)
                    .then_with(|| a.lower.cmp(&b.lower))
                    .then_with(|| a.upper.cmp(&b.upper))
            });
            candidates
        };

        let mut used: HashSet<PartnerRef> = HashSet::new();
        let mut formed = 0;
        for candidate in candidates {
            if used.contains(&candidate.lower) || used.contains(&candidate.upper) {
                continue;
            }
            used.insert(candidate.lower);
            used.insert(candidate.upper);
            self.residue_at_mut(candidate.lower.rsd)
                .set_connection_partner(candidate.lower.connid, candidate.upper);
            self.residue_at_mut(candidate.upper.rsd)
                .set_connection_partner(candidate.upper.connid, candidate.lower);
            debug!(
                lower = candidate.lower.rsd,
                upper = candidate.upper.rsd,
                score = candidate.score,
                "Formed inferred bond."
            );
            formed += 1;
        }

        for seqpos in 1..=self.size() {
            for connid in self.residue_at(seqpos).incomplete_connections() {
                debug!(seqpos, connid, "Connection point left unmatched.");
            }
        }
        if formed > 0 {
            self.update_pseudo_bonds();
            self.torsions_dirty = true;
        }
        info!(bonds = formed, "Bond detection finished.");
        formed
    }

    fn disulfide_partner(&self, seqpos: usize) -> Option<PartnerRef> {
        let residue = self.residue_at(seqpos);
        let thiol = residue.template().thiol_atom()?;
        residue
            .template()
            .connections_at_atom(thiol)
            .into_iter()
            .find_map(|c| residue.connection_partner(c))
    }

    fn validate_disulfide_pairs(&self, pairs: &[(usize, usize)]) -> Result<(), ConformationError> {
        let mut seen = HashSet::new();
        for &(first, second) in pairs {
            let invalid = |reason: &str| ConformationError::InvalidDisulfidePair {
                first,
                second,
                reason: reason.to_string(),
            };
            let range = 1..=self.size();
            if !range.contains(&first) || !range.contains(&second) {
                return Err(invalid("residue out of range"));
            }
            if first == second {
                return Err(invalid("a residue cannot pair with itself"));
            }
            if [first, second]
                .iter()
                .any(|&r| self.residue_at(r).template().thiol_atom().is_none())
            {
                return Err(invalid("residue has no thiol atom"));
            }
            if !seen.insert(first) || !seen.insert(second) {
                return Err(invalid("residue appears in more than one pair"));
            }
        }
        Ok(())
    }

    /// Swaps the residue at `seqpos` to the chemistry with (`add`) or without the disulfide
    /// variant, if it is not already there.
    fn set_disulfide_variant<R: Rng + ?Sized>(
        &mut self,
        seqpos: usize,
        add: bool,
        rng: &mut R,
    ) -> Result<(), ConformationError> {
        let template = self.residue_at(seqpos).template().clone();
        if template.has_variant(VariantKind::Disulfide) == add {
            return Ok(());
        }
        let swapped = if add {
            self.registry.with_variant(&template, VariantKind::Disulfide)
        } else {
            self.registry.without_variant(&template, VariantKind::Disulfide)
        };
        let swapped = swapped.ok_or_else(|| ConformationError::MissingVariant {
            residue: template.name().to_string(),
            variant: VariantKind::Disulfide,
        })?;
        self.replace_residue_chemistry(seqpos, swapped, rng);
        Ok(())
    }

    fn form_disulfide<R: Rng + ?Sized>(
        &mut self,
        first: usize,
        second: usize,
        rng: &mut R,
    ) -> Result<(), ConformationError> {
        self.set_disulfide_variant(first, true, rng)?;
        self.set_disulfide_variant(second, true, rng)?;
        let thiol_name = |conf: &Conformation, seqpos: usize| -> String {
            let template = conf.residue_at(seqpos).template();
            template
                .thiol_atom()
                .map(|a| template.atom_name(a).to_string())
                .unwrap_or_default()
        };
        let atom1 = thiol_name(self, first);
        let atom2 = thiol_name(self, second);
        self.declare_chemical_bond(first, &atom1, second, &atom2);
        Ok(())
    }

    /// Forms the requested disulfides, searches for more between free thiols, and reverts
    /// disulfide residues whose partner is missing or out of range.
    ///
    /// # Errors
    ///
    /// Returns [`ConformationError::InvalidDisulfidePair`] before any change if an explicit pair is
    /// out of range, not thiol-capable, a self-pair or reuses a residue, and
    /// [`ConformationError::MissingVariant`] if the registry lacks a needed variant.
    #[instrument(skip_all, name = "detect_disulfides")]
    pub fn detect_disulfides<R: Rng + ?Sized>(
        &mut self,
        explicit_pairs: &[(usize, usize)],
        config: &BondDetectionConfig,
        rng: &mut R,
    ) -> Result<DisulfideReport, ConformationError> {
        self.validate_disulfide_pairs(explicit_pairs)?;
        self.ensure_coordinates();
        let mut report = DisulfideReport::default();
        let mut used: HashSet<usize> = HashSet::new();

        for &(first, second) in explicit_pairs {
            self.form_disulfide(first, second, rng)?;
            used.extend([first, second]);
            report.formed.push((first.min(second), first.max(second)));
        }

        let matches = {
            let refs = ordered(&self.residues, &self.order);
            let free: Vec<usize> = (1..=refs.len())
                .filter(|&i| refs[i - 1].template().thiol_atom().is_some())
                .filter(|i| !used.contains(i))
                .filter(|&i| self.disulfide_partner(i).is_none())
                .collect();
            self.disulfide_matches(&refs, &free, config)
        };
        for (_, first, second) in matches {
            if used.contains(&first) || used.contains(&second) {
                continue;
            }
            self.form_disulfide(first, second, rng)?;
            used.extend([first, second]);
            report.formed.push((first, second));
        }

        for seqpos in 1..=self.size() {
            let template = self.residue_at(seqpos).template().clone();
            if !template.has_variant(VariantKind::Disulfide) || used.contains(&seqpos) {
                continue;
            }
            let window = disulfide_window(config, template.representation());
            let stale = match self.disulfide_partner(seqpos) {
                None => None,
                Some(partner) => {
                    let thiol = template.thiol_atom().unwrap_or(template.nbr_atom());
                    let here = self.residue_at(seqpos).xyz(thiol);
                    let there = self
                        .residue_at(partner.rsd)
                        .xyz(self.residue_at(partner.rsd).connection_atom(partner.connid));
                    if (here - there).norm() <= window.cutoff() {
                        continue;
                    }
                    Some(partner)
                }
            };
            if let Some(partner) = stale {
                self.break_chemical_bond(partner.rsd, partner.connid);
                self.set_disulfide_variant(partner.rsd, false, rng)?;
                report.reverted.push(partner.rsd);
            }
            self.set_disulfide_variant(seqpos, false, rng)?;
            report.reverted.push(seqpos);
        }
        report.reverted.sort_unstable();
        report.reverted.dedup();

        info!(
            formed = report.formed.len(),
            reverted = report.reverted.len(),
            "Disulfide detection finished."
        );
        Ok(report)
    }

    /// Distance-window matches between free thiols, sorted by `(|d - ideal|, i, j)`.
    fn disulfide_matches(
        &self,
        refs: &[&Residue],
        free: &[usize],
        config: &BondDetectionConfig,
    ) -> Vec<(f64, usize, usize)> {
        if free.len() < 2 {
            return Vec::new();
        }
        let thiol_point = |i: usize| {
            let residue = refs[i - 1];
            point(residue, residue.template().thiol_atom().unwrap_or(residue.template().nbr_atom()))
        };
        let mut tree: KdTree<f64, 3> = KdTree::with_capacity(free.len());
        for &i in free {
            tree.add(&thiol_point(i), i as u64);
        }
        let mut matches = Vec::new();
        for &i in free {
            let representation = refs[i - 1].template().representation();
            let window = disulfide_window(config, representation);
            let cutoff = window.cutoff();
            for neighbor in tree.within::<SquaredEuclidean>(&thiol_point(i), cutoff * cutoff) {
                let j = neighbor.item as usize;
                if j <= i || refs[j - 1].template().representation() != representation {
                    continue;
                }
                let d = neighbor.distance.sqrt();
                if window.accepts(d) {
                    matches.push(((d - window.ideal).abs(), i, j));
                }
            }
        }
        matches.sort_by(|a, b| a.0.total_cmp(&b.0).then((a.1, a.2).cmp(&(b.1, b.2))));
        matches
    }

    /// Re-derives pseudo-bonds: partners of one residue whose connection atoms are at most two
    /// bonds apart inside it are recorded as adjacent, keeping the shortest per residue pair.
    pub(super) fn update_pseudo_bonds(&mut self) {
        let refs = ordered(&self.residues, &self.order);
        self.pseudo_bonds = refs
            .iter()
            .flat_map(|residue| {
                let template = residue.template();
                (1..=residue.n_connections())
                    .tuple_combinations()
                    .filter_map(move |(ci, cj)| {
                        let pi = residue.connection_partner(ci)?;
                        let pj = residue.connection_partner(cj)?;
                        if pi.rsd == pj.rsd {
                            return None;
                        }
                        let path = template.path_distance(
                            template.connection(ci).atom,
                            template.connection(cj).atom,
                        )?;
                        (path <= 2).then(|| {
                            PseudoBond::new((pi.rsd, pi.connid), (pj.rsd, pj.connid), path + 2)
                        })
                    })
            })
            .sorted_by_key(|pb| {
                (
                    pb.lower_rsd,
                    pb.upper_rsd,
                    pb.path_length,
                    pb.lower_conn,
                    pb.upper_conn,
                )
            })
            .dedup_by(|a, b| (a.lower_rsd, a.upper_rsd) == (b.lower_rsd, b.upper_rsd))
            .collect();
    }
}
