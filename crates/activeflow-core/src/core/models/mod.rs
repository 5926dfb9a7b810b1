//! # Core Models Module
//!
//! Plain data structures for atomistic configurations.
//!
//! ## Key Components
//!
//! - [`element`] - Chemical symbols and atomic numbers
//! - [`cell`] - Lattice vectors, lower-triangular canonicalization and box reduction
//! - [`geometry`] - A single configuration with its labels, or a null placeholder
//!
//! ## Usage
//!
//! ```ignore
//! use activeflow::core::models::geometry::Geometry;
//! use nalgebra::{Matrix3, Vector3};
//!
//! let mut g = Geometry::from_data(&[1], &[Vector3::zeros()], Some(Matrix3::identity() * 5.0)).unwrap();
//! g.energy = Some(-13.6);
//! assert_eq!(g.per_atom_energy(), Some(-13.6));
//! ```

pub mod cell;
pub mod element;
pub mod geometry;
