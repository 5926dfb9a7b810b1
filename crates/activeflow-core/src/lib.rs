//! # activeflow Core Library
//!
//! A workflow manager for active learning of interatomic potentials: generate
//! configurations by molecular dynamics, label them with an expensive reference
//! method, retrain a model, and repeat.
//!
//! ## Architectural Philosophy
//!
//! The library follows a three-layer architecture.
//!
//! - **[`core`]: The Foundation.** Stateless data models (`Geometry`), extended XYZ
//!   I/O, analytic potentials and error metrics.
//!
//! - **[`engine`]: The Logic Core.** Deferred values and the execution context that
//!   schedules them, external process launching, datasets, hamiltonians, walkers,
//!   reference evaluators, the sampling engine, models and checkpoints. Every
//!   operation returns immediately with a deferred handle; dependent work runs
//!   once its inputs resolve.
//!
//! - **[`workflows`]: The Public API.** Complete procedures built from the engine,
//!   most notably the sequential learning loop with checkpoint and restart.

pub mod core;
pub mod engine;
pub mod workflows;
