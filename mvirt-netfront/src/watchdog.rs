//! Transmit stall watchdog
//!
//! A low-frequency thread per queue. Each tick it looks at the transmit
//! ring: requests outstanding while the backend's response index has not
//! moved since the previous tick means a lost event, so the ring is kicked.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};
use tracing::debug;

use crate::protocol::RingIdx;

/// Stall detection state carried between ticks
#[derive(Debug, Default)]
pub struct StallDetector {
    last_rsp_prod: Option<RingIdx>,
}

impl StallDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one observation; true if the ring looks stalled.
    pub fn check(&mut self, outstanding: u32, rsp_prod: RingIdx) -> bool {
        let previous = self.last_rsp_prod.replace(rsp_prod);
        outstanding != 0 && previous == Some(rsp_prod)
    }

    pub fn reset(&mut self) {
        self.last_rsp_prod = None;
    }
}

/// Handle to a running watchdog thread
pub struct Watchdog {
    thread: Option<JoinHandle<()>>,
    wake: Sender<()>,
}

impl Watchdog {
    /// Call `tick` every `interval` until stopped.
    pub fn spawn(
        name: &str,
        interval: Duration,
        mut tick: impl FnMut() + Send + 'static,
    ) -> io::Result<Self> {
        let (wake, receiver) = crossbeam_channel::bounded::<()>(1);
        let thread_name = name.to_string();

        let thread = thread::Builder::new()
            .name(format!("{name}-watchdog"))
            .spawn(move || {
                loop {
                    match receiver.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => tick(),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!(watchdog = %thread_name, "Watchdog stopped");
            })?;

        debug!(watchdog = name, interval_ms = interval.as_millis() as u64, "Watchdog started");
        Ok(Self {
            thread: Some(thread),
            wake,
        })
    }

    /// Signal the watchdog to stop
    pub fn stop(&self) {
        let _ = self.wake.try_send(());
    }

    /// Stop and wait for the thread
    pub fn join(mut self) -> Result<(), String> {
        self.stop();
        match self.thread.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| "Watchdog thread panicked".to_string()),
            None => Ok(()),
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_stall_detection() {
        let mut detector = StallDetector::new();
        // First observation has nothing to compare against
        assert!(!detector.check(4, 10));
        // No progress with work outstanding
        assert!(detector.check(4, 10));
        // Progress
        assert!(!detector.check(2, 12));
        // Idle ring never stalls
        assert!(!detector.check(0, 12));
        assert!(!detector.check(0, 12));

        detector.reset();
        assert!(!detector.check(4, 12));
    }

    #[test]
    fn test_watchdog_ticks_and_stops() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = ticks.clone();
        let watchdog = Watchdog::spawn("test", Duration::from_millis(5), move || {
            ticks_clone.fetch_add(1, Ordering::SeqCst);
        })
        .expect("spawn");

        for _ in 0..200 {
            if ticks.load(Ordering::SeqCst) >= 2 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        watchdog.join().expect("join");
        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }
}
