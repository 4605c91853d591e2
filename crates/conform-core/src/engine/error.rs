use thiserror::Error;

use crate::core::chemistry::registry::ChemistryLoadError;
use crate::core::chemistry::template::VariantKind;

#[derive(Debug, Error)]
pub enum ConformationError {
    #[error("Invalid disulfide pair ({first}, {second}): {reason}")]
    InvalidDisulfidePair {
        first: usize,
        second: usize,
        reason: String,
    },

    #[error("Unknown residue type: '{0}'")]
    UnknownResidueType(String),

    #[error("Cannot build a conformation from an empty sequence")]
    EmptySequence,

    #[error("Residue type '{residue}' has no '{variant}' variant")]
    MissingVariant {
        residue: String,
        variant: VariantKind,
    },

    #[error("Chemistry database error: {source}")]
    Chemistry {
        #[from]
        source: ChemistryLoadError,
    },
}
