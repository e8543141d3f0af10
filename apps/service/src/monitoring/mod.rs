/// Monitoring engine - admission, probing and scheduling of site checks
pub mod admission;
pub mod aggregate;
pub mod checker;
pub mod executor;
pub mod scheduler;
pub mod types;

pub use admission::{AdmissionController, AdmissionState};
pub use checker::{HttpProbe, HttpProbeSettings, HyperTimer};
pub use executor::ProbeExecutor;
pub use scheduler::{SchedulerTimings, SiteScheduler};
