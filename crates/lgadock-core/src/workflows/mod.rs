//! # Workflows Module
//!
//! High-level entry points that drive the engine end to end.
//!
//! - **Search** ([`search`]) - Runs one docking job on an acquired device: generation 0
//!   is initialized and scored, then each generation is bred, scored lane-parallel
//!   under a launch guard and published by a population swap until the evaluation or
//!   generation budget is spent. Scoring and variation are supplied by the caller
//!   through [`search::FitnessEvaluator`] and [`search::VariationOperator`].
//! - **Batch** ([`batch`]) - Spreads a queue of jobs over a [`DevicePool`](crate::engine::pool::DevicePool)
//!   with one coordinating thread per device, stopping at the first failure.

pub mod batch;
pub mod search;
