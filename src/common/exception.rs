use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PurgatoryError {
    #[error("tryCompleteElseWatch requires at least one watch key")]
    NoWatchKeys,
    #[error("purgatory {0} has been shut down")]
    ShutDown(String),
}
