use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

use crate::registry::JobRegistry;

/// Default period between reaper cycles
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Background thread that removes exited jobs from a registry
pub struct Reaper {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Reaper {
    /// Start reaping `registry` every `interval`
    pub fn spawn(registry: Arc<JobRegistry>, interval: Duration) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let thread = std::thread::Builder::new()
            .name("job-reaper".to_string())
            .spawn(move || {
                debug!("Reaper started ({:?} interval)", interval);
                while !stop_flag.load(Ordering::Relaxed) {
                    for job in registry.reap() {
                        info!(
                            pid = %job.id,
                            status = %job.status,
                            "Job finished: {}",
                            job.command_line
                        );
                    }
                    std::thread::sleep(interval);
                }
                debug!("Reaper stopped");
            })?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Stop the thread after its current cycle
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Let the reaper run for the rest of the process lifetime
    pub fn detach(mut self) {
        self.thread.take();
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        // Detached reapers keep running
        if self.thread.is_some() {
            self.stop.store(true, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Launcher;
    use std::time::Instant;

    #[test]
    fn reaper_removes_finished_job() {
        let registry = Arc::new(JobRegistry::new());
        let launcher = Launcher::new("sh", vec!["-c".into(), "exit 0".into(), "job".into()]);
        let id = registry.spawn(&launcher, &["--points".into(), "5".into()]).unwrap();

        let reaper = Reaper::spawn(registry.clone(), Duration::from_millis(50)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.contains(id) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(!registry.contains(id));

        reaper.shutdown();
    }

    #[test]
    fn hung_job_does_not_stall_reaper() {
        let registry = Arc::new(JobRegistry::new());
        let hung = Launcher::new("sh", vec!["-c".into(), "sleep 30".into(), "job".into()]);
        let quick = Launcher::new("sh", vec!["-c".into(), "sleep 0.1".into(), "job".into()]);
        let hung_id = registry.spawn(&hung, &["a".into()]).unwrap();

        let reaper = Reaper::spawn(registry.clone(), Duration::from_millis(50)).unwrap();
        let quick_id = registry.spawn(&quick, &["b".into()]).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.contains(quick_id) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(!registry.contains(quick_id));
        assert!(registry.contains(hung_id));

        registry.terminate(hung_id).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.contains(hung_id) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(!registry.contains(hung_id));

        reaper.shutdown();
    }
}
