use nalgebra::{Point3, Vector3};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

use super::template::{
    AtomTemplate, BackboneFamily, ConnectionKind, ConnectionTemplate, InternalCoordinate,
    Representation, ResidueTemplate, VariantKind,
};
use crate::core::utils::geometry::place_atom;

const EMBEDDED_DATABASE: &str = include_str!("../../../data/residues.toml");

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDatabase {
    #[serde(default)]
    residue: Vec<RawResidue>,
    #[serde(default)]
    patch: Vec<RawPatch>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAtom {
    name: String,
    element: String,
    #[serde(default)]
    stub: Vec<String>,
    #[serde(default)]
    d: f64,
    #[serde(default)]
    angle: f64,
    #[serde(default)]
    dihedral: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConnection {
    kind: ConnectionKind,
    atom: String,
    stub: [String; 2],
    d: f64,
    angle: f64,
    dihedral: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResidue {
    name: String,
    name1: Option<char>,
    #[serde(default)]
    family: BackboneFamily,
    #[serde(default)]
    representation: Representation,
    root_atom: Option<String>,
    nbr_atom: String,
    nbr_radius: f64,
    thiol_atom: Option<String>,
    atoms: Vec<RawAtom>,
    #[serde(default)]
    extra_bonds: Vec<[String; 2]>,
    #[serde(default)]
    mainchain: Vec<String>,
    #[serde(default)]
    chi: Vec<[String; 4]>,
    #[serde(default)]
    nu: Vec<[String; 4]>,
    #[serde(default)]
    connections: Vec<RawConnection>,
    #[serde(skip)]
    variants: Vec<VariantKind>,
    #[serde(skip)]
    lower_cap: Option<String>,
    #[serde(skip)]
    upper_cap: Option<String>,
    #[serde(skip)]
    lower_placeholders: Vec<String>,
    #[serde(skip)]
    upper_placeholders: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPatch {
    variant: VariantKind,
    #[serde(default)]
    families: Vec<BackboneFamily>,
    representation: Option<Representation>,
    #[serde(default)]
    requires_thiol: bool,
    #[serde(default)]
    requires_atoms: Vec<String>,
    #[serde(default)]
    requires_connections: Vec<ConnectionKind>,
    #[serde(default)]
    conflicts: Vec<VariantKind>,
    #[serde(default)]
    remove_atoms: Vec<String>,
    #[serde(default)]
    remove_connections: Vec<ConnectionKind>,
    #[serde(default)]
    add_atoms: Vec<RawAtom>,
    #[serde(default)]
    add_connections: Vec<RawConnection>,
    lower_cap: Option<String>,
    upper_cap: Option<String>,
    #[serde(default)]
    lower_placeholders: Vec<String>,
    #[serde(default)]
    upper_placeholders: Vec<String>,
}

impl RawPatch {
    fn applies_to(&self, residue: &RawResidue) -> bool {
        (self.families.is_empty() || self.families.contains(&residue.family))
            && self
                .representation
                .is_none_or(|r| r == residue.representation)
            && (!self.requires_thiol || residue.thiol_atom.is_some())
            && self
                .requires_atoms
                .iter()
                .all(|name| residue.atoms.iter().any(|a| &a.name == name))
            && self
                .requires_connections
                .iter()
                .all(|kind| residue.connections.iter().any(|c| c.kind == *kind))
    }

    fn apply(&self, residue: &mut RawResidue) {
        residue
            .atoms
            .retain(|a| !self.remove_atoms.contains(&a.name));
        residue
            .connections
            .retain(|c| !self.remove_connections.contains(&c.kind));
        residue.atoms.extend(self.add_atoms.iter().cloned());
        residue
            .connections
            .extend(self.add_connections.iter().cloned());
        if self.lower_cap.is_some() {
            residue.lower_cap = self.lower_cap.clone();
        }
        if self.upper_cap.is_some() {
            residue.upper_cap = self.upper_cap.clone();
        }
        residue
            .lower_placeholders
            .extend(self.lower_placeholders.iter().cloned());
        residue
            .upper_placeholders
            .extend(self.upper_placeholders.iter().cloned());
        residue.variants.push(self.variant);
        residue.variants.sort();
    }
}

/// Residue chemistry database: base templates plus every applicable variant combination.
#[derive(Debug, Clone, Default)]
pub struct ChemistryRegistry {
    templates: HashMap<String, Arc<ResidueTemplate>>,
    by_name1: HashMap<char, String>,
}

impl ChemistryRegistry {
    /// Registry built from the database compiled into the crate.
    pub fn embedded() -> Result<Self, ChemistryLoadError> {
        Self::from_toml_str(EMBEDDED_DATABASE, "<embedded>")
    }

    pub fn load(path: &Path) -> Result<Self, ChemistryLoadError> {
        let content = std::fs::read_to_string(path).map_err(|e| ChemistryLoadError::Io {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;
        Self::from_toml_str(&content, &path.to_string_lossy())
    }

    pub fn from_toml_str(content: &str, origin: &str) -> Result<Self, ChemistryLoadError> {
        let raw: RawDatabase = toml::from_str(content).map_err(|e| ChemistryLoadError::Toml {
            path: origin.to_string(),
            source: e,
        })?;

        let mut registry = Self::default();
        for base in &raw.residue {
            if registry.templates.contains_key(&base.name) {
                return Err(ChemistryLoadError::DuplicateTemplate(base.name.clone()));
            }
            if let Some(c) = base.name1 {
                registry.by_name1.insert(c, base.name.clone());
            }

            let applicable = applicable_patches(&raw.patch, base);
            for mask in 0u32..(1 << applicable.len()) {
                let chosen: Vec<&RawPatch> = applicable
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| mask & (1 << i) != 0)
                    .map(|(_, p)| *p)
                    .collect();
                if has_conflict(&chosen) {
                    continue;
                }
                let mut residue = base.clone();
                for patch in &chosen {
                    patch.apply(&mut residue);
                }
                let template = resolve_template(&residue)?;
                trace!(template = template.name(), "Registered residue template");
                registry
                    .templates
                    .insert(template.name.clone(), Arc::new(template));
            }
        }
        debug!(
            origin,
            templates = registry.templates.len(),
            "Loaded chemistry database"
        );
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ResidueTemplate>> {
        self.templates.get(name).cloned()
    }

    pub fn by_name1(&self, code: char) -> Option<Arc<ResidueTemplate>> {
        self.by_name1
            .get(&code.to_ascii_uppercase())
            .and_then(|name| self.get(name))
    }

    /// The template with the same base chemistry and variants plus `variant`.
    pub fn with_variant(
        &self,
        template: &ResidueTemplate,
        variant: VariantKind,
    ) -> Option<Arc<ResidueTemplate>> {
        let mut variants = template.variants.clone();
        if !variants.contains(&variant) {
            variants.push(variant);
        }
        self.get(&variant_name(&template.base_name, &variants))
    }

    pub fn without_variant(
        &self,
        template: &ResidueTemplate,
        variant: VariantKind,
    ) -> Option<Arc<ResidueTemplate>> {
        let variants: Vec<VariantKind> = template
            .variants
            .iter()
            .copied()
            .filter(|v| *v != variant)
            .collect();
        self.get(&variant_name(&template.base_name, &variants))
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }
}

fn applicable_patches<'a>(patches: &'a [RawPatch], base: &RawResidue) -> Vec<&'a RawPatch> {
    let mut chosen: Vec<&RawPatch> = Vec::new();
    for patch in patches {
        if chosen.iter().any(|p| p.variant == patch.variant) {
            continue;
        }
        if patch.applies_to(base) {
            chosen.push(patch);
        }
    }
    chosen.sort_by_key(|p| p.variant);
    chosen
}

fn has_conflict(patches: &[&RawPatch]) -> bool {
    patches.iter().any(|p| {
        p.conflicts
            .iter()
            .any(|c| patches.iter().any(|q| q.variant == *c))
    })
}

fn variant_name(base: &str, variants: &[VariantKind]) -> String {
    let mut sorted = variants.to_vec();
    sorted.sort();
    sorted.dedup();
    std::iter::once(base.to_string())
        .chain(sorted.iter().map(|v| v.as_str().to_string()))
        .collect::<Vec<_>>()
        .join(":")
}

fn resolve_template(raw: &RawResidue) -> Result<ResidueTemplate, ChemistryLoadError> {
    let name = variant_name(&raw.name, &raw.variants);
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, atom) in raw.atoms.iter().enumerate() {
        if index.insert(atom.name.as_str(), i + 1).is_some() {
            return Err(ChemistryLoadError::InvalidTemplate {
                residue: name,
                reason: format!("duplicate atom '{}'", atom.name),
            });
        }
    }
    let lookup = |atom: &str| -> Result<usize, ChemistryLoadError> {
        index
            .get(atom)
            .copied()
            .ok_or_else(|| ChemistryLoadError::UnknownAtom {
                residue: name.clone(),
                atom: atom.to_string(),
            })
    };

    let natoms = raw.atoms.len();
    let mut ideal: Vec<Point3<f64>> = Vec::with_capacity(natoms);
    let mut icoor: Vec<Option<InternalCoordinate>> = Vec::with_capacity(natoms);
    let mut bonds: Vec<Vec<usize>> = vec![Vec::new(); natoms];

    for (i, atom) in raw.atoms.iter().enumerate() {
        let stub = atom
            .stub
            .iter()
            .map(|s| lookup(s))
            .collect::<Result<Vec<usize>, _>>()?;
        if stub.iter().any(|&s| s > i) {
            return Err(ChemistryLoadError::InvalidTemplate {
                residue: name.clone(),
                reason: format!("atom '{}' is placed from an atom defined after it", atom.name),
            });
        }
        let position = match stub.as_slice() {
            [] if i == 0 => Point3::origin(),
            [] => {
                return Err(ChemistryLoadError::InvalidTemplate {
                    residue: name.clone(),
                    reason: format!("atom '{}' has no placement stub", atom.name),
                });
            }
            [parent] => ideal[parent - 1] + Vector3::x() * atom.d,
            [parent, angle_atom] => {
                let b = ideal[angle_atom - 1];
                let c = ideal[parent - 1];
                let axis = (c - b).normalize();
                let helper = if axis.y.abs() < 0.9 {
                    Vector3::y()
                } else {
                    Vector3::z()
                };
                place_atom(&(b + helper), &b, &c, atom.d, atom.angle, 0.0).ok_or_else(|| {
                    ChemistryLoadError::InvalidTemplate {
                        residue: name.clone(),
                        reason: format!("degenerate placement for atom '{}'", atom.name),
                    }
                })?
            }
            [parent, angle_atom, dihedral_atom, ..] => {
                place_atom(
                    &ideal[dihedral_atom - 1],
                    &ideal[angle_atom - 1],
                    &ideal[parent - 1],
                    atom.d,
                    atom.angle,
                    atom.dihedral,
                )
                .ok_or_else(|| ChemistryLoadError::InvalidTemplate {
                    residue: name.clone(),
                    reason: format!("degenerate placement for atom '{}'", atom.name),
                })?
            }
        };
        ideal.push(position);
        icoor.push(match stub.as_slice() {
            [parent, angle_atom, dihedral_atom, ..] => Some(InternalCoordinate {
                stub: [*parent, *angle_atom, *dihedral_atom],
                distance: atom.d,
                angle: atom.angle,
                dihedral: atom.dihedral,
            }),
            _ => None,
        });
        if let Some(&parent) = stub.first() {
            add_bond(&mut bonds, i + 1, parent);
        }
    }

    for [a, b] in &raw.extra_bonds {
        let (a, b) = (lookup(a)?, lookup(b)?);
        add_bond(&mut bonds, a, b);
    }

    let quad = |names: &[String; 4]| -> Result<[usize; 4], ChemistryLoadError> {
        Ok([
            lookup(&names[0])?,
            lookup(&names[1])?,
            lookup(&names[2])?,
            lookup(&names[3])?,
        ])
    };

    let connections = raw
        .connections
        .iter()
        .map(|c| {
            Ok(ConnectionTemplate {
                kind: c.kind,
                atom: lookup(&c.atom)?,
                stub: [lookup(&c.stub[0])?, lookup(&c.stub[1])?],
                distance: c.d,
                angle: c.angle,
                dihedral: c.dihedral,
            })
        })
        .collect::<Result<Vec<_>, ChemistryLoadError>>()?;

    let mainchain = raw
        .mainchain
        .iter()
        .map(|n| lookup(n))
        .collect::<Result<Vec<_>, _>>()?;
    let root_atom = match &raw.root_atom {
        Some(n) => lookup(n)?,
        None => mainchain.get(mainchain.len() / 2).copied().unwrap_or(1),
    };

    Ok(ResidueTemplate {
        name: name.clone(),
        base_name: raw.name.clone(),
        name1: raw.name1,
        family: raw.family,
        representation: raw.representation,
        variants: raw.variants.clone(),
        atoms: raw
            .atoms
            .iter()
            .zip(&ideal)
            .map(|(a, p)| AtomTemplate {
                name: a.name.clone(),
                element: a.element.clone(),
                ideal: *p,
            })
            .collect(),
        icoor,
        bonds,
        mainchain,
        chi: raw.chi.iter().map(quad).collect::<Result<_, _>>()?,
        nu: raw.nu.iter().map(quad).collect::<Result<_, _>>()?,
        connections,
        root_atom,
        nbr_atom: lookup(&raw.nbr_atom)?,
        nbr_radius: raw.nbr_radius,
        thiol_atom: raw.thiol_atom.as_deref().map(lookup).transpose()?,
        lower_cap: raw.lower_cap.as_deref().map(lookup).transpose()?,
        upper_cap: raw.upper_cap.as_deref().map(lookup).transpose()?,
        lower_placeholders: raw
            .lower_placeholders
            .iter()
            .map(|n| lookup(n))
            .collect::<Result<_, _>>()?,
        upper_placeholders: raw
            .upper_placeholders
            .iter()
            .map(|n| lookup(n))
            .collect::<Result<_, _>>()?,
    })
}

fn add_bond(bonds: &mut [Vec<usize>], a: usize, b: usize) {
    if !bonds[a - 1].contains(&b) {
        bonds[a - 1].push(b);
        bonds[a - 1].sort_unstable();
    }
    if !bonds[b - 1].contains(&a) {
        bonds[b - 1].push(a);
        bonds[b - 1].sort_unstable();
    }
}

#[derive(Debug, Error)]
pub enum ChemistryLoadError {
    #[error("File I/O error for '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("TOML parsing error for '{path}': {source}")]
    Toml {
        path: String,
        source: toml::de::Error,
    },
    #[error("Residue template '{0}' is defined more than once")]
    DuplicateTemplate(String),
    #[error("Residue template '{residue}' references unknown atom '{atom}'")]
    UnknownAtom { residue: String, atom: String },
    #[error("Residue template '{residue}' is invalid: {reason}")]
    InvalidTemplate { residue: String, reason: String },
}
