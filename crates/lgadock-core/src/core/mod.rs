//! # Core Module
//!
//! Stateless building blocks shared by the device engine: the saturating fixed-point
//! codec, the opaque kernel constant tables, the sizing parameters of a docking job,
//! and the identifiers used as buffer and device handles.
//!
//! Nothing in this module owns device state. The types here are immutable once
//! constructed and can be shared freely between coordinating threads.
//!
//! - **Numerics** ([`fixed_point`]) - Scaled-integer energy/force terms with saturation
//! - **Kernel inputs** ([`tables`]) - The six constant tables plus rotatable-bond tables
//! - **Job sizing** ([`params`]) - Population, grid and budget dimensions of a job
//! - **Handles** ([`ids`]) - Slot-map buffer keys and logical device ids

pub mod fixed_point;
pub mod ids;
pub mod params;
pub mod tables;
