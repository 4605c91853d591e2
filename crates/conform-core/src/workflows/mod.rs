//! # Workflows Module
//!
//! High-level entry points that assemble complete conformations.
//!
//! ## Overview
//!
//! Workflows tie the chemistry registry and the engine together. They resolve residue names or
//! one-letter codes to templates, apply terminus variants, grow a chain residue by residue with
//! ideal geometry, and hand back a fully synchronized
//! [`Conformation`](crate::engine::conformation::Conformation).
//!
//! ## Architecture
//!
//! - **Peptide Building** ([`build`]) - Ideal-geometry chains from names or sequences, with
//!   optional backbone torsions
//!
//! ## Key Capabilities
//!
//! - **Terminus handling** through registry variants
//! - **Backbone presets** for extended and helical chains
//! - **Boundary error reporting** for unknown residue types and missing variants

pub mod build;
