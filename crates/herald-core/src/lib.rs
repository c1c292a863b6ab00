pub mod ack;
pub mod errors;
pub mod ids;
pub mod item;
pub mod producer;

pub use ack::{AckStatus, Acknowledgment, ResultMessage};
pub use errors::ProducerError;
pub use ids::{ConnectionId, ItemId};
pub use item::QueueItem;
