//! # Core Models Module
//!
//! Plain data types shared by the kinematics layer and the conformation engine.
//!
//! ## Key Components
//!
//! - [`ids`] - Atom, degree-of-freedom and symbolic torsion addresses, plus generational
//!   residue keys
//! - [`residue`] - The per-residue Cartesian/torsion cache with its connection-partner table
//! - [`pseudo_bond`] - Non-tree adjacencies used for bonded-path accounting

pub mod ids;
pub mod pseudo_bond;
pub mod residue;
