use thiserror::Error;

/// Errors that can occur in this crate.
///
/// The in-memory backend has no I/O to fail; its only error is a lookup miss,
/// raised when deactivating a binding that does not exist.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The requested row does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
}
