//! Error types for the front-end ring engine.
//!
//! Resource exhaustion is absent here: running out of cache
//! objects, grants or ring slots is back-pressure and surfaces as `None`,
//! a `Stopped` ring or a busy post, never as an error value.

use thiserror::Error;

use crate::protocol::GrantRef;

/// Grant table errors.
#[derive(Debug, Error)]
pub enum GrantError {
    #[error("No free grant references")]
    Exhausted,

    #[error("Grant reference {0} is not active")]
    NotActive(GrantRef),

    #[error("Grant reference {0} is still mapped by the backend")]
    InUse(GrantRef),
}

/// Malformed or truncated packet headers.
///
/// Never fatal to a ring: the packet is forwarded without offload or
/// completed with an error status.
#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("{layer} header truncated: need {needed} bytes, have {available}")]
    Truncated {
        layer: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("{layer} header has invalid length {length}")]
    InvalidLength { layer: &'static str, length: usize },

    #[error("Unexpected IP version {0}")]
    InvalidVersion(u8),

    #[error("Payload read failed: {0}")]
    Memory(#[from] vm_memory::GuestMemoryError),
}

/// Control-plane store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Store write failed for {0}")]
    WriteFailed(String),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid MAC address: {0}")]
    InvalidMacAddress(String),

    #[error("Queue count must be between 1 and {max}, got {requested}")]
    InvalidQueueCount { requested: usize, max: usize },
}

/// Ring-level errors reported to the lifecycle owner.
#[derive(Debug, Error)]
pub enum RingError {
    /// Backend or local bookkeeping corruption; the ring is failed.
    #[error("{ring}: protocol violation: {reason}")]
    ProtocolViolation { ring: String, reason: String },

    #[error("{ring}: operation not valid in state {state}")]
    InvalidState { ring: String, state: &'static str },

    #[error("Guest memory error: {0}")]
    Memory(#[from] vm_memory::GuestMemoryError),

    #[error("Grant error: {0}")]
    Grant(#[from] GrantError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Out of guest frames for {0}")]
    OutOfFrames(String),

    #[error("Queue index {0} out of range")]
    NoSuchQueue(usize),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Worker thread error: {0}")]
    Thread(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RingError>;
