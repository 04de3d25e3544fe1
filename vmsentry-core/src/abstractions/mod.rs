//! Trait abstractions over ambient resources
//!
//! Components depend on these interfaces rather than on tokio directly so the
//! lifecycle machine can be driven deterministically in tests.

pub mod time;

pub use time::*;
