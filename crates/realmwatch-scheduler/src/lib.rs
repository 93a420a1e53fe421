//! realmwatch-scheduler: periodic realm status monitoring.
//!
//! Owns the [`RealmRegistry`] of monitored realms and the [`Scheduler`]
//! that polls them. The scheduler:
//!
//! - Keeps one `ScheduleEntry` per registered realm (next due time, in-flight
//!   flag, last error, consecutive failures)
//! - Launches at most one fetch cycle per realm at a time
//! - Bounds concurrent fetches across realms with a semaphore
//! - Reschedules on the realm's interval after success, with exponential
//!   backoff after failure
//! - Exposes the control surface used by the REST API (on-demand fetch,
//!   latest/history queries, start/stop, registry administration)
//!
//! # Architecture
//!
//! ```text
//! Scheduler::run (control loop, one per process)
//!   ├── tick: select enabled, due, idle realms → claim (in_flight = true)
//!   └── per claimed realm: supervisor task
//!       └── cycle task: permit → StatusFetcher → HealthScorer → StatusRepository
//!           (panics and errors stay inside this realm's entry)
//! ```

pub mod error;
pub mod registry;
pub mod scheduler;

pub use error::{ConfigError, CycleError, SchedulerError, SchedulerResult, StoreCallError};
pub use registry::RealmRegistry;
pub use scheduler::{EntryStatus, LastError, RealmStatusView, Scheduler, SchedulerStatus};
