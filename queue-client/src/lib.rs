//! Sample clients and the throughput harness for the message queues

#![deny(clippy::all, clippy::pedantic, clippy::nursery, dead_code, missing_docs)]

pub mod cli;
pub mod harness;

pub use harness::{HarnessCounters, HarnessError, HarnessOptions, HarnessReport};
