//! # Core Module
//!
//! Stateless building blocks of the conformation engine.
//!
//! ## Architecture
//!
//! - **Molecular Representation** ([`models`]) - Identifiers, residues and pseudo-bonds
//! - **Chemistry** ([`chemistry`]) - Residue templates and the registry that resolves variants
//! - **Kinematics** ([`kinematics`]) - Fold tree and atom tree with forward/inverse kinematics
//! - **Utilities** ([`utils`]) - Geometry helpers and element/atom-name classification

pub mod chemistry;
pub mod kinematics;
pub mod models;
pub mod utils;
