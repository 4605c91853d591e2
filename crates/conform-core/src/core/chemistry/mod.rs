//! # Chemistry Module
//!
//! Residue templates ("chemistry handles") and the registry that loads them.
//!
//! ## Overview
//!
//! A [`template::ResidueTemplate`] is an immutable, shared description of one residue chemistry:
//! atom names and elements, intra-residue bonds, ideal internal geometry, declared connection
//! points with their ideal partner geometry, and the atom-name lists that define side-chain and
//! ring torsions. Residue instances hold an `Arc` to their template.
//!
//! ## Key Components
//!
//! - [`template`] - Template types, backbone families and chemistry variants
//! - [`registry`] - TOML-backed database with patch-generated variants (termini, disulfides,
//!   cut-point placeholders)

pub mod registry;
pub mod template;
