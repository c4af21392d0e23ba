//! Unit tests for the exit-handling core.
//!
//! Everything runs against [`sim`]: a sparse simulated physical memory with
//! hand-built host, guest and second-level page tables, plus a `HostIf`
//! implementation whose processor id is chosen per test thread.

mod sim;

#[cfg(feature = "svm")]
mod svm;
