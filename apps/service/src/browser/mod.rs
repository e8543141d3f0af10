//! Shared headless browser: automation seam, Chromium backend, lifecycle and probe.

pub mod chromium;
pub mod driver;
pub mod lifecycle;
pub mod probe;
pub mod timing;

#[cfg(test)]
pub(crate) mod testing;

pub use chromium::ChromiumDriver;
pub use lifecycle::{BrowserLifecycleManager, LifecycleConfig};
pub use probe::{BrowserProbe, BrowserProbeSettings};
