use thiserror::Error;

/// Protocol errors: reported to the originating connection, no state change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command")]
    Unknown,

    #[error("missing args")]
    MissingArgs,

    #[error("unbalanced quotes in arguments")]
    UnbalancedQuotes,

    #[error("invalid job id: {0}")]
    InvalidJobId(String),

    #[error("Invalid JSON")]
    InvalidJson,
}
