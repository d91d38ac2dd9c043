use thiserror::Error;

/// Errors surfaced by [`crate::MessageBus`] and its collaborators.
///
/// Mirrors the error kinds named in the public interface: construction-time
/// validation, operation-after-disposal, and the lock/capacity failures that
/// can occur on any publish or receive pass.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("bus name must be a non-empty identifier")]
    InvalidName,

    #[error("max_file_size must be at least 1 byte")]
    InvalidCapacity,

    #[error("max_reader_count must be at least 1")]
    InvalidReaderCount,

    #[error("operation attempted after the bus was disposed")]
    Disposed,

    #[error("a single publish call requires a non-empty message")]
    EmptyMessage,

    #[error("payload of {len} bytes exceeds max_file_size of {max} bytes")]
    PayloadTooLarge { len: usize, max: u32 },

    #[error("timed out waiting to acquire {0}")]
    Timeout(String),

    #[error("operation canceled")]
    Canceled,

    #[error("system-global named primitive '{name}' unavailable: {reason}")]
    SystemPrimitiveUnavailable { name: String, reason: String },
}
