use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Instant;
use tracing::{error, info, warn};

use crate::error::RegistryError;

/// Identifier of a job: the OS process id of its child
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct JobId(pub u32);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(JobId)
    }
}

/// How measurement processes are started
#[derive(Clone, Debug)]
pub struct Launcher {
    pub program: String,
    /// Arguments placed before the per-job arguments (e.g. the script path)
    pub base_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl Default for Launcher {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            base_args: vec!["scripts/znle_pyvisa.py".to_string()],
            working_dir: None,
            env: Vec::new(),
        }
    }
}

impl Launcher {
    pub fn new(program: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
            ..Default::default()
        }
    }

    /// Full argument vector for a job, program first
    pub fn command_line(&self, args: &[String]) -> Vec<String> {
        let mut argv = Vec::with_capacity(1 + self.base_args.len() + args.len());
        argv.push(self.program.clone());
        argv.extend(self.base_args.iter().cloned());
        argv.extend(args.iter().cloned());
        argv
    }

    /// Start the child process. Does not wait for it.
    pub(crate) fn spawn(&self, args: &[String]) -> Result<(Child, Vec<String>), RegistryError> {
        if self.program.trim().is_empty() {
            return Err(RegistryError::EmptyCommand);
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args).args(args).stdin(Stdio::null());

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let command_line = self.command_line(args);
        let child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn '{}': {}", command_line.join(" "), e);
            RegistryError::SpawnFailed(e)
        })?;

        info!(pid = child.id(), "Started job: {}", command_line.join(" "));
        Ok((child, command_line))
    }
}

/// A spawned measurement process, owned by the registry
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub command_line: Vec<String>,
    pub started_at: DateTime<Utc>,
    handle: Child,
    stop_requested: Option<Instant>,
}

/// Read-only view of a job, detached from the registry lock
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobSummary {
    pub id: JobId,
    pub command_line: String,
    pub started_at: DateTime<Utc>,
    pub stopping: bool,
}

impl Job {
    pub fn new(id: JobId, command_line: Vec<String>, handle: Child) -> Self {
        Self {
            id,
            command_line,
            started_at: Utc::now(),
            handle,
            stop_requested: None,
        }
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            command_line: self.command_line.join(" "),
            started_at: self.started_at,
            stopping: self.stop_requested.is_some(),
        }
    }

    /// Non-blocking exit check
    pub fn poll_exit(&mut self) -> Option<ExitStatus> {
        match self.handle.try_wait() {
            Ok(status) => status,
            Err(e) => {
                warn!(pid = %self.id, "Failed to poll job: {}", e);
                None
            }
        }
    }

    /// Time since a stop was requested, if one was
    pub fn stop_elapsed(&self) -> Option<std::time::Duration> {
        self.stop_requested.map(|at| at.elapsed())
    }

    /// Ask the process to exit (SIGTERM on unix)
    pub fn request_stop(&mut self) -> Result<(), RegistryError> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            kill(Pid::from_raw(self.id.0 as i32), Signal::SIGTERM).map_err(|e| {
                RegistryError::SignalFailed {
                    id: self.id,
                    message: e.to_string(),
                }
            })?;
        }
        #[cfg(not(unix))]
        {
            self.handle
                .kill()
                .map_err(|e| RegistryError::SignalFailed {
                    id: self.id,
                    message: e.to_string(),
                })?;
        }

        if self.stop_requested.is_none() {
            self.stop_requested = Some(Instant::now());
        }
        Ok(())
    }

    /// SIGKILL; the exit is still observed by the reaper
    pub fn force_kill(&mut self) {
        if let Err(e) = self.handle.kill() {
            warn!(pid = %self.id, "Failed to kill job: {}", e);
        }
    }
}
