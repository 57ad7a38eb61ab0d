//! Integration test harness.
//!
//! Spins up multiple in-process nodes sharing one overlay, each with a real
//! TCP listener on loopback, so tests exercise the full RPC, market, data
//! channel, and audit paths end to end.

#![deny(unsafe_code)]

pub mod harness;

pub use harness::TestNetwork;
