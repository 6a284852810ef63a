//! Test harness for front-end integration tests
//!
//! Wires a `Netfront` to the in-process simulated backend domain and drives
//! frames around the loop: transmit ring to backend to receive ring.

#![allow(dead_code)]

pub mod frontend;

pub use frontend::TestFrontend;
