pub mod cache;
pub mod checksum;
pub mod config;
pub mod control;
pub mod dpc;
pub mod error;
pub mod frontend;
pub mod grant;
pub mod headers;
pub mod host;
pub mod memory;
pub mod offload;
pub mod payload;
pub mod protocol;
pub mod queue;
pub mod receiver;
pub mod ring;
pub mod stats;
pub mod test_util;
pub mod transmitter;
pub mod watchdog;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::NetfrontConfig;
pub use error::{Result, RingError};
pub use frontend::{HostServices, Netfront, QueueStatistics};
pub use receiver::RxPacket;
pub use transmitter::{TxCompletion, TxPacket, TxStatus};

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
