//! # conformpp Core Library
//!
//! A conformation and kinematics engine for polymers. A structure is held both as an
//! internal-coordinate kinematic tree and as a flat per-residue Cartesian cache, and the library
//! keeps the two consistent under coordinate writes and topology surgery.
//!
//! ## Architectural Philosophy
//!
//! The library follows a strict three-layer architecture.
//!
//! - **[`core`]: The Foundation.** Stateless models: identifiers, residues, chemistry templates
//!   and their registry, the residue-level fold tree and the atom-level kinematic tree, and
//!   geometry helpers.
//!
//! - **[`engine`]: The Logic Core.** The stateful `Conformation` facade with its dirty-flag
//!   protocol, the topology mutation engine, bond and disulfide inference, torsion resolution and
//!   change notification hubs.
//!
//! - **[`workflows`]: The Public API.** High-level builders that assemble complete conformations
//!   from residue names or sequences.

pub mod core;
pub mod engine;
pub mod workflows;
