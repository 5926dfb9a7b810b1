//! # Workflows Module
//!
//! High-level procedures that drive the engine through a complete active-learning
//! campaign.
//!
//! ## Overview
//!
//! Workflows are the top-level entry points of activeflow. They own the iteration
//! structure of a campaign: seeding the training data, alternating sampling,
//! labeling and retraining, deciding which walkers to reset, and persisting enough
//! state after every iteration to continue an interrupted run.
//!
//! ## Architecture
//!
//! - **Sequential Learning** ([`learning`]) - The iterative loop of sampling with the
//!   current model, labeling new states with a reference and retraining, with
//!   checkpoint and restart.
//!
//! ## Key Capabilities
//!
//! - **Pretraining** from randomly perturbed walker starts when no data is supplied
//! - **Atomic reference energies** computed once and attached to the model
//! - **Error-driven walker resets** based on the pre-retrain model error
//! - **Restartable runs** that resume after the last complete checkpoint

pub mod learning;
