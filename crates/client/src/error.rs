use crate::config::ConfigError;

use std::time::Duration;

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The message group was closed while a call was being set up in it.
    #[error("message group '{0}' closed")]
    GroupClosed(String),

    /// An argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A router had no live routee to take a message.
    #[error("no live routee in router '{0}'")]
    NoRoutee(String),

    /// The reply listener went away while a call was waiting on it.
    #[error("reply listener on '{0}' closed")]
    ReplyListenerClosed(String),

    /// The service has been stopped.
    #[error("service '{0}' stopped")]
    ServiceStopped(String),

    /// No correlated reply arrived before the retries were exhausted.
    #[error("no reply from '{destination}' within {timeout:?} after {retries} retries")]
    Timeout {
        /// The effective destination of the call.
        destination: String,

        /// The per-attempt timeout.
        timeout: Duration,

        /// Retries performed before giving up.
        retries: u32,
    },

    /// An envelope could not be encoded or decoded.
    #[error("translation error: {0}")]
    Translation(#[source] BoxError),

    /// The transport failed.
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),
}

impl Error {
    pub(crate) fn transport(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Transport(Box::new(error))
    }

    pub(crate) fn translation(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Translation(Box::new(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::error::Error as _;

    use switchyard_messaging::HeaderTranslatorError;
    use switchyard_messaging_memory::Error as MemoryError;

    #[test]
    fn test_wrapped_errors_keep_their_source() {
        let error = Error::transport(MemoryError::QueueNotFound("Q1".to_string()));
        let source = error.source().unwrap();
        assert!(source.downcast_ref::<MemoryError>().is_some());
        assert!(error.to_string().contains("Q1"));

        let error = Error::translation(HeaderTranslatorError::InvalidUtf8);
        assert!(error.source().unwrap().is::<HeaderTranslatorError>());
    }
}
