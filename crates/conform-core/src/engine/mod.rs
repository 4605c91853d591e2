//! # Engine Module
//!
//! The stateful layer of conformpp. It owns a polymer's structure and keeps its two
//! representations, the internal-coordinate atom tree and the per-residue Cartesian cache,
//! consistent while the structure is edited.
//!
//! ## Overview
//!
//! Everything revolves around [`conformation::Conformation`]. Writes to either representation
//! only mark the other one stale; the next read through an `ensure_*` call recomputes it. Topology
//! edits (append, insert, delete, splice, chemistry swaps) patch the residue list, the fold tree
//! and the atom tree together and notify subscribers afterwards.
//!
//! ## Architecture
//!
//! - **Conformation** ([`conformation`]) - Dual representation, lazy synchronization and reads
//! - **Topology Edits** (`mutation`) - Residue append/insert/delete and conformation splicing
//! - **Connectivity** ([`connectivity`]) - Spatial bond inference, disulfides and pseudo-bonds
//! - **Torsions** ([`torsions`]) - Symbolic torsion ids resolved to concrete atoms
//! - **Notifications** ([`signals`]) - Typed observer hubs with block and buffer modes
//! - **Configuration** ([`config`]) - Bond detection thresholds
//! - **Error Handling** ([`error`]) - Boundary error types
//!
//! ## Key Capabilities
//!
//! - **Lazy dual-representation sync** driven by two dirty flags
//! - **Incremental atom tree patches** for single-residue edits
//! - **KD-tree backed bond detection** with optional parallel candidate enumeration
//! - **Per-atom move tracking** for downstream incremental consumers

pub mod config;
pub mod conformation;
pub mod connectivity;
pub mod error;
mod mutation;
pub mod signals;
pub mod torsions;
