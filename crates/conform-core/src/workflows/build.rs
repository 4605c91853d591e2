use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::core::chemistry::registry::ChemistryRegistry;
use crate::core::chemistry::template::{ResidueTemplate, VariantKind};
use crate::core::models::ids::TorsionId;
use crate::core::models::residue::Residue;
use crate::engine::conformation::Conformation;
use crate::engine::error::ConformationError;

/// Mainchain torsions imposed on every residue of a built peptide, in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackboneAngles {
    pub phi: f64,
    pub psi: f64,
    pub omega: f64,
}

impl BackboneAngles {
    pub const EXTENDED: Self = Self {
        phi: -150.0,
        psi: 150.0,
        omega: 180.0,
    };

    pub const ALPHA_HELIX: Self = Self {
        phi: -57.0,
        psi: -47.0,
        omega: 180.0,
    };
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildOptions {
    /// Cap the first residue with its lower-terminus variant.
    pub lower_terminus: bool,
    /// Cap the last residue with its upper-terminus variant.
    pub upper_terminus: bool,
    /// When unset the chain keeps the ideal geometry of its templates.
    pub backbone: Option<BackboneAngles>,
    pub secstruct: char,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            lower_terminus: true,
            upper_terminus: true,
            backbone: None,
            secstruct: 'L',
        }
    }
}

/// Builds a single polymer chain from residue type names, each residue bonded to the previous
/// one with ideal geometry.
///
/// The returned conformation is synchronized in both representations and has no pending move
/// data.
///
/// # Errors
///
/// Returns [`ConformationError::EmptySequence`] for an empty name list,
/// [`ConformationError::UnknownResidueType`] for names missing from `registry`, and
/// [`ConformationError::MissingVariant`] when a terminal residue has no terminus variant.
#[instrument(skip_all, name = "peptide_build_workflow")]
pub fn build_peptide(
    registry: Arc<ChemistryRegistry>,
    names: &[&str],
    options: &BuildOptions,
) -> Result<Conformation, ConformationError> {
    if names.is_empty() {
        return Err(ConformationError::EmptySequence);
    }
    info!(residues = names.len(), "Building peptide chain.");

    let last = names.len() - 1;
    let mut templates = Vec::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        let mut template = registry
            .get(name)
            .ok_or_else(|| ConformationError::UnknownResidueType((*name).to_string()))?;
        if i == 0 && options.lower_terminus {
            template = terminus_variant(&registry, &template, VariantKind::LowerTerminus)?;
        }
        if i == last && options.upper_terminus {
            template = terminus_variant(&registry, &template, VariantKind::UpperTerminus)?;
        }
        templates.push(template);
    }

    let mut conformation = Conformation::new(Arc::clone(&registry));
    for template in templates {
        let residue = Residue::from_template(template);
        if conformation.is_empty() {
            conformation.append_residue_by_jump(residue, 0, None, None, false);
        } else {
            conformation.append_residue_by_bond(residue, true);
        }
    }

    for seqpos in 1..=conformation.size() {
        conformation.set_secstruct(seqpos, options.secstruct);
    }
    if let Some(angles) = options.backbone {
        apply_backbone_angles(&mut conformation, angles);
    }

    conformation.ensure_coordinates();
    conformation.ensure_torsions();
    conformation.reset_move_data();
    info!(
        residues = conformation.size(),
        chains = conformation.num_chains(),
        "Peptide chain built."
    );
    Ok(conformation)
}

/// Builds a peptide from one-letter residue codes. Whitespace is ignored.
///
/// # Errors
///
/// Returns [`ConformationError::UnknownResidueType`] for codes that no template claims, plus
/// the errors of [`build_peptide`].
pub fn build_from_one_letter(
    registry: Arc<ChemistryRegistry>,
    sequence: &str,
    options: &BuildOptions,
) -> Result<Conformation, ConformationError> {
    let mut names = Vec::new();
    for code in sequence.chars().filter(|c| !c.is_whitespace()) {
        let template = registry
            .by_name1(code)
            .ok_or_else(|| ConformationError::UnknownResidueType(code.to_string()))?;
        names.push(template.base_name().to_string());
    }
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    build_peptide(registry, &names, options)
}

fn terminus_variant(
    registry: &ChemistryRegistry,
    template: &ResidueTemplate,
    variant: VariantKind,
) -> Result<Arc<ResidueTemplate>, ConformationError> {
    registry
        .with_variant(template, variant)
        .ok_or_else(|| ConformationError::MissingVariant {
            residue: template.name().to_string(),
            variant,
        })
}

fn apply_backbone_angles(conformation: &mut Conformation, angles: BackboneAngles) {
    let values = [angles.phi, angles.psi, angles.omega];
    for seqpos in 1..=conformation.size() {
        for (index, &value) in (1..).zip(values.iter()) {
            let id = TorsionId::backbone(seqpos, index);
            if conformation.torsion_atoms(id).is_none() {
                debug!(torsion = %id, "Skipping torsion undefined at the chain end.");
                continue;
            }
            conformation.set_torsion(id, value);
        }
    }
}
