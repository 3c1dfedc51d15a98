use thiserror::Error;

/// Errors that can occur when talking to the consensus log.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Channel creation failed or the log returned no channel id.
    #[error("Channel create failed: {0}")]
    ChannelCreate(String),

    /// Append to a channel failed (transport or size limit).
    #[error("Append failed: {0}")]
    Append(String),

    /// Reading entries from a channel failed.
    #[error("Read failed: {0}")]
    Read(String),

    /// The requested channel is unknown to the log.
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),
}
