use thiserror::Error;

use crate::completion::breaker::BreakerError;
use crate::completion::queue::QueueError;
use crate::event::event_bus::EventError;
use crate::provider::ProviderError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Event error: {0}")]
    Event(#[from] EventError),
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("Breaker error: {0}")]
    Breaker(#[from] BreakerError),
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type InternalResult<T> = Result<T, Error>;

impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}
