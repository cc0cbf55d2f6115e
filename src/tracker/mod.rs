/// Per-entity state tracking and anomaly detection
pub mod state_tracker;

pub use state_tracker::{EntityState, LivenessCounts, StateTracker};
