//! # Kinematics Module
//!
//! Residue-level and atom-level kinematic trees.
//!
//! ## Overview
//!
//! The [`fold_tree::FoldTree`] records how residues hang together: polymer bonds along the
//! sequence, rigid-body jumps between segments and chemical branch bonds. Cut points (positions
//! not polymer-linked to their successor) fall out of it.
//!
//! The [`atom_tree::AtomTree`] expands that topology to every atom. Each atom stores internal
//! coordinates relative to its parent (bond length, bond angle, torsion) or, for jump atoms, a
//! rigid-body transform. Internal and Cartesian coordinates are reconciled lazily.

pub mod atom_tree;
pub mod fold_tree;
pub mod jump;
