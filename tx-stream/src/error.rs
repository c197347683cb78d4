use thiserror::Error;

/// Terminal conditions of the poll loop. Anything else is logged and skipped.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("consumer group client closed")]
    ClientClosed,
    #[error("consumption was canceled")]
    Canceled,
}

/// Failure to persist marked offsets. Never fatal: the next owner of the
/// partition resumes from the last successful commit.
#[derive(Error, Debug)]
pub enum CommitError {
    #[error("offset commit rejected: {0}")]
    Rejected(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("offset commit task failed: {0}")]
    TaskFailed(String),
}

impl CommitError {
    pub fn rejected<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CommitError::Rejected(Box::new(error))
    }
}

/// Invalid configuration detected at startup
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} cannot be empty")]
    Empty(&'static str),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}
