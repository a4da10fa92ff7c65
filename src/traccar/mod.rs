pub mod messages;
pub mod trips;

pub use messages::{Device, Event, Position, StreamMessage};
pub use trips::{Trip, TripService, TripServiceConfig};
