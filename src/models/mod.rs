mod entity;
mod queue_record;
mod sample;

pub use entity::TrackedEntity;
pub use queue_record::{AckState, QueueRecord};
pub use sample::LocationSample;
