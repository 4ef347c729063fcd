//! Error types for Setu

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Setu error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed or failed validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Peer closed the control socket (EOF before a complete frame)
    #[error("Connection closed")]
    ConnectionClosed,

    /// Declared frame length exceeds the protocol maximum
    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge {
        /// Length announced by the prefix
        len: usize,
        /// Largest accepted payload
        max: usize,
    },

    /// Sidecar process could not be spawned or killed
    #[error("Process error: {0}")]
    Process(String),

    /// Unit capability failure (state serialization, command application)
    #[error("Unit error: {0}")]
    Unit(String),

    /// Payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when the error means the peer went away rather than something
    /// being wrong with this side.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::ConnectionClosed => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_disconnect_classification() {
        assert!(Error::ConnectionClosed.is_disconnect());
        assert!(Error::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_disconnect());
        assert!(Error::Io(io::Error::from(io::ErrorKind::ConnectionReset)).is_disconnect());
        assert!(!Error::Io(io::Error::from(io::ErrorKind::PermissionDenied)).is_disconnect());
        assert!(!Error::FrameTooLarge { len: 10, max: 5 }.is_disconnect());
    }
}
