/// Errors raised while building an item for the queue.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProducerError {
    #[error("invalid ISO-8601 time: {0:?}")]
    InvalidTime(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}
