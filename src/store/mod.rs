pub mod entity_tracker;

pub use entity_tracker::*;
