//! Shared tracing setup for the websitebench binaries.

mod subscriber;

pub use subscriber::{Level, init, init_with_level};
