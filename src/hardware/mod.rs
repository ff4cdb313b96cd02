//! Native driver layer.
//!
//! `native` defines the capability traits, `mock` an in-process simulation
//! used by tests and `--simulated` runs. The vendor bindings are only built
//! with the `spectroscan_hardware` feature.

pub mod mock;
pub mod native;

#[cfg(feature = "spectroscan_hardware")]
pub mod ftdi;
