//! Shared helpers for Borzoi crates.
//!
//! Small, dependency-light building blocks used across the workspace: fast hash-based collections, cheap wall-clock
//! timestamps, and task spawning that preserves `tracing` spans.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod collections;
pub mod task;
pub mod time;
