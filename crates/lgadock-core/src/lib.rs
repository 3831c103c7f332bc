//! # LGADock Core Library
//!
//! Device-resident state for a population-based docking search: constant tables and
//! grid maps per device, double-buffered populations, per-lane random streams,
//! evaluation accounting, multi-device scheduling and a saturating fixed-point codec.
//!
//! ## Architectural Philosophy
//!
//! The library follows a strict three-layer architecture.
//!
//! - **[`core`]: The Foundation.** Stateless definitions: the fixed-point codec and its
//!   numeric constants, kernel constant tables, docking parameters and opaque handles.
//!
//! - **[`engine`]: The Logic Core.** The stateful layer. Devices and the launch guard,
//!   per-device contexts, population storage, random streams, the evaluation ledger
//!   and the device pool.
//!
//! - **[`workflows`]: The Public API.** Ties `engine` and `core` together: running one
//!   docking job on a leased device and running a batch of jobs across a pool.
//!
//! Scoring functions and genetic operators are not part of the library; callers plug
//! them in through [`workflows::search::FitnessEvaluator`] and
//! [`workflows::search::VariationOperator`].

pub mod core;
pub mod engine;
pub mod workflows;
