use thiserror::Error;

/// Boxed error used at the collaborator seams (fetchers, multipart stores).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the transfer engine.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Bad unit size or worker count. Fatal, no transfer starts.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Network or protocol failure moving one unit.
    #[error("transport error on unit {unit}: {source}")]
    Transport {
        unit: usize,
        #[source]
        source: BoxError,
    },
    /// Remote session call (initiate, list, complete, abort) failed.
    #[error("session error: {source}")]
    Session {
        #[source]
        source: BoxError,
    },
    /// The remote returned an unexpected or unsortable part listing.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Temp or target file could not be created, written or read.
    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),
    /// Dispatch was stopped before all units were accounted for.
    #[error("transfer stopped before completion")]
    Stopped,
}

impl TransferError {
    pub fn transport(unit: usize, source: impl Into<BoxError>) -> Self {
        Self::Transport {
            unit,
            source: source.into(),
        }
    }

    pub fn session(source: impl Into<BoxError>) -> Self {
        Self::Session {
            source: source.into(),
        }
    }

    /// Renders the full cause chain as one message, outermost first.
    pub fn chain_message(&self) -> String {
        chain_message(self)
    }
}

/// Concatenates an error and all of its nested sources into one message.
pub fn chain_message(err: &(dyn std::error::Error + 'static)) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}
