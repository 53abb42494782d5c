use thiserror::Error;

#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("failed to load configuration: {0}")]
    Config(#[source] crate::core::errors::ApiError),

    #[error("failed to initialize persistence store: {0}")]
    Persistence(#[source] crate::core::errors::ApiError),
}
