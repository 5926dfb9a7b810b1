//! # Engine Module
//!
//! The stateful orchestration layer of activeflow: every expensive operation is
//! expressed as a node in a graph of deferred values and executed concurrently
//! by an explicit execution context.
//!
//! ## Overview
//!
//! Calls into this module return immediately. A [`dataset::Dataset`] is a handle
//! to a file that will exist once its producing task finishes; a walker's state
//! is a [`deferred::Deferred`] geometry that resolves when sampling completes.
//! Dependent work starts as soon as its inputs resolve, so independent reference
//! calculations, sampler runs and training jobs overlap.
//!
//! ## Architecture
//!
//! - **Scheduling** ([`context`], [`deferred`], [`process`]) - The execution context, deferred
//!   values and external program launching with per-executor concurrency limits
//! - **Data** ([`dataset`]) - File-backed, immutable collections of geometries
//! - **Physics** ([`hamiltonian`], [`walker`], [`sampling`]) - Energy functions, sampling
//!   replicas and the propagation engine
//! - **Labeling and Learning** ([`reference`], [`model`]) - Reference evaluators and trainable models
//! - **Persistence** ([`checkpoint`]) - Per-iteration snapshots for restart
//! - **Configuration** ([`config`]) - Builders for context, sampling and learning parameters
//! - **Progress Monitoring** ([`progress`]) - Callback-based progress reporting
//! - **Error Handling** ([`error`]) - Graph-construction errors and task failures
//!
//! ## Failure Model
//!
//! Contract violations (invalid walkers, malformed inputs, missing executors) are
//! returned as [`error::EngineError`] when the graph is built. A failed reference
//! calculation is not an error: it produces a null geometry that flows through
//! the graph and is filtered out downstream. A [`error::TaskError`] inside a
//! deferred value signals a broken invariant and fails every dependent node.

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod dataset;
pub mod deferred;
pub mod error;
pub mod hamiltonian;
pub mod model;
pub mod process;
pub mod progress;
pub mod reference;
pub mod sampling;
#[cfg(test)]
pub(crate) mod testing;
pub mod walker;
