//! # Engine Module
//!
//! Stateful, device-side machinery of the docking engine.
//!
//! ## Architecture
//!
//! - **Devices** ([`device`], [`launch`]) - The [`device::ComputeDevice`] seam, a
//!   host-backed implementation, and the [`launch::LaunchGuard`] that turns device
//!   status words into classified faults and completion proofs.
//! - **Per-device state** ([`context`], [`population`], [`random`], [`ledger`]) - Kernel
//!   constant tables and the grid buffer, the double-buffered population, one random
//!   stream per lane, and evaluation counters.
//! - **Scheduling** ([`pool`]) - The fixed device pool handing out exclusive leases.
//! - **Configuration** ([`config`]), **Progress Monitoring** ([`progress`]) and
//!   **Error Handling** ([`error`]).
//!
//! ## Ownership
//!
//! A device's state is reachable only through the lease of the run holding it, and
//! within a run the population's halves are borrowed either as the read-only active
//! generation or as the writing one. Role swaps require a completed launch.

pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod launch;
pub mod ledger;
pub mod pool;
pub mod population;
pub mod progress;
pub mod random;
