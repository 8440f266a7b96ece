/// Crate-wide result alias.
pub type RasterflowResult<T> = Result<T, RasterflowError>;

/// Errors raised by misuse of the scheduler, the registries or the optimizer.
///
/// Task execution failure is not an error: it travels as the boolean returned by
/// [`TaskKind::run`](crate::TaskKind::run) and ends up in the batch outcome.
#[derive(thiserror::Error, Debug)]
pub enum RasterflowError {
    /// Invalid options or arguments.
    #[error("validation error: {0}")]
    Validation(String),

    /// Duplicate or missing registry entries (backends, optimizers).
    #[error("registry error: {0}")]
    Registry(String),

    /// The optimizer pipeline did not reach a fixpoint.
    #[error("optimizer error: {0}")]
    Optimizer(String),

    /// Worker pool failures (spawn failure, submission after shutdown).
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// Wrapped foreign error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RasterflowError {
    /// Build a [`RasterflowError::Validation`].
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Build a [`RasterflowError::Registry`].
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    /// Build a [`RasterflowError::Optimizer`].
    pub fn optimizer(msg: impl Into<String>) -> Self {
        Self::Optimizer(msg.into())
    }

    /// Build a [`RasterflowError::Scheduler`].
    pub fn scheduler(msg: impl Into<String>) -> Self {
        Self::Scheduler(msg.into())
    }
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/error.rs"]
mod tests;
