//! Multicast layers.
//!
//! [`SharedStream`] shares one producer run between every subscriber present
//! while it runs. [`ReplayShared`] adds a bounded, time-windowed replay
//! buffer so late subscribers are served without a new run.

/// Refcounted fan-out.
pub mod proxy;
/// Refcounted fan-out with replay.
pub mod replay;

pub use proxy::SharedStream;
pub use replay::{ReplayBuffer, ReplayConfig, ReplayShared};
