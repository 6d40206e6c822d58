//! Domain model: identifiers and state labels.

pub mod ids;
pub mod state;

pub use ids::{Id, IdMarker, ObserverId, ProcessorId, TaskId};
pub use state::{RunState, State};
