//! Frame-cadence conversion
//!
//! Capture sources deliver frames whenever they feel like it; downstream
//! consumers want a steady cadence at the global target rate. Each source
//! gets a [`FrameRateConverter`] that snaps jittery arrivals onto the ideal
//! output grid, and the [`FrameRateRegistry`] owns the global target rate
//! and fills gaps for stalled sources from a periodic heartbeat.

pub mod converter;
pub mod registry;

pub use converter::FrameRateConverter;
pub use registry::{FrameRateRegistry, RegistryStats};
