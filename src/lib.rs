//! Learning bouncing-ball dynamics with a variational autoencoder.
//!
//! The pipeline has three stages:
//!
//! 1. [`generate`] simulates ball trajectories and writes frames plus
//!    ground-truth state arrays.
//! 2. [`solver`] trains a [`model::VariationalAutoEncoder`] to predict the next
//!    frames of a [`dataset::BallDataset`] window, annealing the KL weight with
//!    [`schedule::BetaScheduler`].
//! 3. [`eval`] runs a trained model on a few samples and renders comparison
//!    sheets.

pub mod dataset;
pub mod error;
pub mod eval;
pub mod generate;
pub mod latent;
pub mod metrics;
pub mod model;
pub mod physics;
pub mod schedule;
pub mod solver;

pub use error::{Error, Result};
