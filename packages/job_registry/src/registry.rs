use std::collections::HashMap;
use std::process::{Child, ExitStatus};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::RegistryError;
use crate::job::{Job, JobId, JobSummary, Launcher};

/// Default time a job gets between SIGTERM and SIGKILL
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// A job the reaper removed, with how it ended
#[derive(Clone, Debug)]
pub struct ReapedJob {
    pub id: JobId,
    pub command_line: String,
    pub status: ExitStatus,
}

/// Registry of running jobs.
///
/// Every operation takes the same lock, so concurrent callers observe a
/// linearizable history. The lock is never held across a blocking wait.
pub struct JobRegistry {
    jobs: Mutex<HashMap<JobId, Job>>,
    max_jobs: Option<usize>,
    stop_grace: Duration,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    /// Create an unbounded registry
    pub fn new() -> Self {
        Self::with_limits(None, DEFAULT_STOP_GRACE)
    }

    pub fn with_limits(max_jobs: Option<usize>, stop_grace: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            max_jobs,
            stop_grace,
        }
    }

    // Critical sections never leave the map half-updated, so a poisoned
    // lock is still safe to use.
    fn jobs(&self) -> MutexGuard<'_, HashMap<JobId, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a job for an already running process
    pub fn register(
        &self,
        id: JobId,
        command_line: Vec<String>,
        handle: Child,
    ) -> Result<(), RegistryError> {
        let mut jobs = self.jobs();
        if jobs.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        jobs.insert(id, Job::new(id, command_line, handle));
        debug!(pid = %id, "Registered job ({} total)", jobs.len());
        Ok(())
    }

    /// Spawn a process with the launcher and register it.
    ///
    /// The limit check, spawn and insert share one critical section so the
    /// limit holds under concurrent callers.
    pub fn spawn(&self, launcher: &Launcher, args: &[String]) -> Result<JobId, RegistryError> {
        let mut jobs = self.jobs();

        if let Some(max) = self.max_jobs {
            if jobs.len() >= max {
                warn!("Refusing to start job: {} of {} running", jobs.len(), max);
                return Err(RegistryError::LimitReached(jobs.len()));
            }
        }

        let (mut child, command_line) = launcher.spawn(args)?;
        let id = JobId(child.id());

        if jobs.contains_key(&id) {
            error!(pid = %id, "Spawned process reuses a registered id, killing it");
            let _ = child.kill();
            let _ = child.wait();
            return Err(RegistryError::DuplicateId(id));
        }

        jobs.insert(id, Job::new(id, command_line, child));
        Ok(id)
    }

    /// Remove and return a job. Removing an absent id is a no-op.
    ///
    /// An exited process is reaped here. A job that is still running is
    /// returned as is; the caller then owns its exit and must wait on it.
    pub fn remove(&self, id: JobId) -> Option<Job> {
        let mut job = self.jobs().remove(&id)?;
        if job.poll_exit().is_none() {
            warn!(pid = %id, "Removed job is still running; caller must reap it");
        }
        Some(job)
    }

    /// Snapshot of all jobs, oldest first
    pub fn list(&self) -> Vec<JobSummary> {
        let mut summaries: Vec<JobSummary> = self.jobs().values().map(Job::summary).collect();
        summaries.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        summaries
    }

    /// Request termination. The reaper removes the job once it has exited.
    pub fn terminate(&self, id: JobId) -> Result<(), RegistryError> {
        let mut jobs = self.jobs();
        let job = jobs.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        job.request_stop()?;
        info!(pid = %id, "Termination requested");
        Ok(())
    }

    /// Request termination of every job (used at shutdown)
    pub fn terminate_all(&self) -> usize {
        let mut jobs = self.jobs();
        let mut signalled = 0;
        for job in jobs.values_mut() {
            match job.request_stop() {
                Ok(()) => signalled += 1,
                Err(e) => warn!("{}", e),
            }
        }
        signalled
    }

    /// Check if a job exists
    pub fn contains(&self, id: JobId) -> bool {
        self.jobs().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs().is_empty()
    }

    /// One reaper cycle: remove exited jobs and escalate overdue stops.
    /// Never waits on a child.
    pub fn reap(&self) -> Vec<ReapedJob> {
        let mut jobs = self.jobs();
        let ids: Vec<JobId> = jobs.keys().copied().collect();
        let mut reaped = Vec::new();

        for id in ids {
            let Some(job) = jobs.get_mut(&id) else {
                continue;
            };

            if let Some(status) = job.poll_exit() {
                if let Some(job) = jobs.remove(&id) {
                    reaped.push(ReapedJob {
                        id,
                        command_line: job.command_line.join(" "),
                        status,
                    });
                }
                continue;
            }

            if job.stop_elapsed().is_some_and(|elapsed| elapsed >= self.stop_grace) {
                warn!(pid = %id, "Job ignored SIGTERM for {:?}, killing", self.stop_grace);
                job.force_kill();
            }
        }

        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn sh(script: &str) -> Launcher {
        Launcher::new("sh", vec!["-c".to_string(), script.to_string(), "job".to_string()])
    }

    fn reap_until_gone(registry: &JobRegistry, id: JobId, within: Duration) -> Vec<ReapedJob> {
        let deadline = Instant::now() + within;
        let mut reaped = Vec::new();
        while registry.contains(id) && Instant::now() < deadline {
            reaped.extend(registry.reap());
            std::thread::sleep(Duration::from_millis(20));
        }
        reaped
    }

    #[test]
    fn spawn_registers_job() {
        let registry = JobRegistry::new();
        let id = registry.spawn(&sh("sleep 5"), &["--points".into(), "5".into()]).unwrap();

        let jobs = registry.list();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, id);
        assert!(jobs[0].command_line.ends_with("--points 5"));
        assert!(jobs[0].command_line.starts_with("sh -c"));

        registry.terminate(id).unwrap();
        reap_until_gone(&registry, id, Duration::from_secs(5));
        assert!(registry.is_empty());
    }

    #[test]
    fn spawn_failure_creates_no_job() {
        let registry = JobRegistry::new();
        let launcher = Launcher::new("/nonexistent/measure-binary", vec![]);
        let err = registry.spawn(&launcher, &["--points".into(), "5".into()]).unwrap_err();
        assert!(matches!(err, RegistryError::SpawnFailed(_)));
        assert!(err.to_string().starts_with("failed to start: "));
        assert!(registry.is_empty());
    }

    #[test]
    fn empty_program_is_rejected() {
        let registry = JobRegistry::new();
        let launcher = Launcher::new("  ", vec![]);
        let err = registry.spawn(&launcher, &[]).unwrap_err();
        assert!(matches!(err, RegistryError::EmptyCommand));
    }

    #[test]
    fn register_rejects_duplicate_id() {
        let registry = JobRegistry::new();
        let first = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        let id = JobId(first.id());
        registry.register(id, vec!["sleep".into(), "5".into()], first).unwrap();

        let other = std::process::Command::new("true").spawn().unwrap();
        let err = registry.register(id, vec!["true".into()], other).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId(dup) if dup == id));
        assert_eq!(registry.len(), 1);

        registry.terminate(id).unwrap();
        reap_until_gone(&registry, id, Duration::from_secs(5));
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = JobRegistry::new();
        let id = registry.spawn(&sh("exit 0"), &["x".into()]).unwrap();

        let mut job = registry.remove(id).expect("job should be present");
        assert_eq!(job.id, id);
        assert!(registry.remove(id).is_none());
        assert!(registry.remove(JobId(u32::MAX)).is_none());

        // Removed jobs are no longer reaped by the registry.
        job.force_kill();
        let _ = job.poll_exit();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn remove_reaps_an_exited_process() {
        let registry = JobRegistry::new();
        let id = registry.spawn(&sh("exit 0"), &[]).unwrap();
        std::thread::sleep(Duration::from_millis(300));

        drop(registry.remove(id));
        // A zombie would keep its /proc entry
        assert!(!std::path::Path::new(&format!("/proc/{}", id)).exists());
    }

    #[test]
    fn reap_removes_exited_jobs_only() {
        let registry = JobRegistry::new();
        let quick = registry.spawn(&sh("exit 3"), &["a".into()]).unwrap();
        let slow = registry.spawn(&sh("sleep 10"), &["b".into()]).unwrap();

        let reaped = reap_until_gone(&registry, quick, Duration::from_secs(5));
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id, quick);
        assert_eq!(reaped[0].status.code(), Some(3));
        assert!(registry.contains(slow));

        registry.terminate(slow).unwrap();
        reap_until_gone(&registry, slow, Duration::from_secs(5));
        assert!(!registry.contains(slow));
    }

    #[test]
    fn terminate_unknown_job_is_not_found() {
        let registry = JobRegistry::new();
        let err = registry.terminate(JobId(u32::MAX)).unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[test]
    fn terminate_leaves_removal_to_reaper() {
        let registry = JobRegistry::new();
        let id = registry.spawn(&sh("sleep 10"), &["x".into()]).unwrap();

        registry.terminate(id).unwrap();
        assert!(registry.contains(id));
        assert!(registry.list()[0].stopping);

        let reaped = reap_until_gone(&registry, id, Duration::from_secs(5));
        assert_eq!(reaped.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn stubborn_job_is_killed_after_grace() {
        let registry = JobRegistry::with_limits(None, Duration::from_millis(200));
        let id = registry
            .spawn(&sh("trap '' TERM; sleep 10"), &["x".into()])
            .unwrap();
        // Give the shell time to install the trap.
        std::thread::sleep(Duration::from_millis(200));

        registry.terminate(id).unwrap();
        let reaped = reap_until_gone(&registry, id, Duration::from_secs(5));
        assert_eq!(reaped.len(), 1);
        assert!(!registry.contains(id));
    }

    #[test]
    fn job_limit_is_enforced() {
        let registry = JobRegistry::with_limits(Some(1), DEFAULT_STOP_GRACE);
        let id = registry.spawn(&sh("sleep 10"), &["x".into()]).unwrap();

        let err = registry.spawn(&sh("sleep 10"), &["y".into()]).unwrap_err();
        assert!(matches!(err, RegistryError::LimitReached(1)));
        assert_eq!(err.to_string(), "job limit reached (1 running)");
        assert_eq!(registry.len(), 1);

        registry.terminate(id).unwrap();
        reap_until_gone(&registry, id, Duration::from_secs(5));
    }

    #[test]
    fn list_is_a_detached_snapshot() {
        let registry = JobRegistry::new();
        let id = registry.spawn(&sh("sleep 10"), &["x".into()]).unwrap();

        let snapshot = registry.list();
        registry.terminate(id).unwrap();
        reap_until_gone(&registry, id, Duration::from_secs(5));

        assert_eq!(snapshot.len(), 1);
        assert!(registry.list().is_empty());
    }

    #[test]
    fn concurrent_spawns_and_lists_are_consistent() {
        let registry = Arc::new(JobRegistry::new());
        let mut threads = Vec::new();

        for i in 0..8 {
            let registry = registry.clone();
            threads.push(std::thread::spawn(move || {
                let id = registry.spawn(&sh("sleep 10"), &[format!("{i}")]).unwrap();
                assert!(registry.list().iter().any(|j| j.id == id));
                id
            }));
        }

        let ids: Vec<JobId> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(registry.len(), 8);

        assert_eq!(registry.terminate_all(), 8);
        for id in ids {
            reap_until_gone(&registry, id, Duration::from_secs(5));
        }
        assert!(registry.is_empty());
    }
}
