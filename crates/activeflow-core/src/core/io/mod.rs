//! Provides input/output functionality for geometry file formats.
//!
//! Geometries are stored as extended XYZ: one frame per configuration, with the
//! lattice, periodicity, per-atom columns and scalar labels encoded in the
//! comment line. A trait-based interface keeps reading and writing uniform.

pub mod traits;
pub mod xyz;
