//! # Core Module
//!
//! Stateless building blocks used by every other layer of activeflow.
//!
//! ## Architecture
//!
//! - **Atomistic Representation** ([`models`]) - Geometries, cells and chemical elements
//! - **File I/O** ([`io`]) - Extended XYZ reading and writing
//! - **Analytic Potentials** ([`potentials`]) - Hamiltonians that are cheap enough to evaluate in-process
//! - **Error Metrics** ([`metrics`]) - Per-structure errors between two labeled datasets
//!
//! Nothing in this module spawns tasks or touches the execution context; it operates
//! purely on values that have already been resolved.

pub mod io;
pub mod metrics;
pub mod models;
pub mod potentials;
