//! Job Registry - thread-safe tracking of spawned measurement processes
//!
//! The registry is the only owner of each child process handle. Callers
//! start, list and stop jobs through it; a [`Reaper`] thread removes jobs
//! whose process has exited. Nothing here depends on an async runtime, so
//! the registry can be shared between blocking connection threads and an
//! event loop alike.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use job_registry::{JobRegistry, Launcher, Reaper, DEFAULT_REAP_INTERVAL};
//!
//! let registry = Arc::new(JobRegistry::new());
//! Reaper::spawn(registry.clone(), DEFAULT_REAP_INTERVAL)
//!     .unwrap()
//!     .detach();
//!
//! let launcher = Launcher::new("python3", vec!["scripts/znle_pyvisa.py".into()]);
//! let id = registry
//!     .spawn(&launcher, &["--start".into(), "900e6".into()])
//!     .unwrap();
//!
//! for job in registry.list() {
//!     println!("PID:{} CMD:{}", job.id, job.command_line);
//! }
//!
//! registry.terminate(id).unwrap();
//! ```

mod error;
pub mod job;
mod reaper;
mod registry;

pub use error::RegistryError;
pub use job::{Job, JobId, JobSummary, Launcher};
pub use reaper::{DEFAULT_REAP_INTERVAL, Reaper};
pub use registry::{DEFAULT_STOP_GRACE, JobRegistry, ReapedJob};
