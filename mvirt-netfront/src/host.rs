//! Services the front-end borrows from its host environment
//!
//! The ring engines never talk to the hypervisor directly. Grant table,
//! event channel and control-plane store are reached through these traits so
//! the same engine runs against a real host or the simulated backend domain
//! in `test_util`.

use std::fmt;

use crate::error::{GrantError, StoreError};
use crate::protocol::GrantRef;
use crate::receiver::RxPacket;
use crate::transmitter::TxCompletion;

/// Domain identifier of a backend
pub type DomainId = u16;

/// Grant table access.
pub trait GrantTable: Send + Sync {
    /// Allow `domain` to map guest frame `pfn`.
    fn permit_foreign_access(
        &self,
        domain: DomainId,
        pfn: u64,
        read_only: bool,
    ) -> Result<GrantRef, GrantError>;

    /// Withdraw access granted by `permit_foreign_access`.
    fn revoke_foreign_access(&self, gref: GrantRef) -> Result<(), GrantError>;
}

/// One bound event channel.
pub trait EventChannel: Send + Sync {
    /// Local port number
    fn port(&self) -> u32;

    /// Notify the remote end
    fn send(&self);

    /// Raise the local end as if the remote had notified
    fn trigger(&self);

    /// Unmask the local port; returns true if an event was pending
    fn unmask(&self) -> bool;
}

/// Backend state as published in the control-plane store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Unknown,
    Initialising,
    InitWait,
    Initialised,
    Connected,
    Closing,
    Closed,
}

impl BackendState {
    pub fn from_value(value: u32) -> Self {
        match value {
            1 => BackendState::Initialising,
            2 => BackendState::InitWait,
            3 => BackendState::Initialised,
            4 => BackendState::Connected,
            5 => BackendState::Closing,
            6 => BackendState::Closed,
            _ => BackendState::Unknown,
        }
    }

    pub fn value(self) -> u32 {
        match self {
            BackendState::Unknown => 0,
            BackendState::Initialising => 1,
            BackendState::InitWait => 2,
            BackendState::Initialised => 3,
            BackendState::Connected => 4,
            BackendState::Closing => 5,
            BackendState::Closed => 6,
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Control-plane key/value store.
///
/// Front-end keys are relative to the front-end's own directory; backend keys
/// are read with `read_backend`.
pub trait Store: Send + Sync {
    fn read(&self, key: &str) -> Result<String, StoreError>;

    fn write(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;

    fn read_backend(&self, key: &str) -> Result<String, StoreError>;

    fn backend_state(&self) -> BackendState;
}

/// Consumer of the front-end's output.
///
/// Called without any ring lock held, so implementations may call back into
/// the front-end (`return_packet`, `queue_packet`).
pub trait Upstream: Send + Sync {
    /// Completed receive packets for `queue`
    fn deliver(&self, queue: usize, packets: Vec<RxPacket>);

    /// Terminal status of transmitted packets for `queue`
    fn complete(&self, queue: usize, completions: Vec<TxCompletion>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_state_values() {
        for value in 0..=6 {
            assert_eq!(BackendState::from_value(value).value(), value);
        }
        assert_eq!(BackendState::from_value(42), BackendState::Unknown);
        assert_eq!(BackendState::Connected.to_string(), "Connected");
    }
}
