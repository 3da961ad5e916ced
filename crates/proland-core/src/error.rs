//! Error types for the tile pipeline.

use thiserror::Error;

/// Pipeline-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Every slot of a tile pool is held by a tile in use.
    ///
    /// Recoverable: callers drop their least important request and retry
    /// on a later frame.
    #[error("Tile pool exhausted: all {capacity} slots are in use")]
    Exhausted { capacity: usize },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected header, pixel format or payload layout
    #[error("Format error: {0}")]
    Format(String),

    /// Invalid data error
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Out of bounds access
    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    /// A create-tile task, or one of the tasks it depends on, failed.
    #[error("Tile creation failed: {0}")]
    TaskFailed(String),

    /// GPU collaborator error
    #[error("GPU error: {0}")]
    Gpu(String),
}

impl Error {
    /// Returns true if the caller may retry the request on a later frame.
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_exhaustion_is_recoverable() {
        assert!(Error::Exhausted { capacity: 4 }.is_recoverable());
        assert!(!Error::Format("bad header".into()).is_recoverable());
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated");
        assert!(!Error::from(io).is_recoverable());
    }

    #[test]
    fn exhausted_message_names_capacity() {
        let message = Error::Exhausted { capacity: 2 }.to_string();
        assert!(message.contains('2'));
    }
}
