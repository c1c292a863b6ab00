pub mod error;
pub mod fs;
pub mod queue;

pub use error::StoreError;
pub use queue::QueueStore;
