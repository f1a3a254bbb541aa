//! Registry of running sandbox processes.
//!
//! Cancellation normally reaches jobs through their [`super::CancelToken`].
//! The registry is the fallback for a hard abort: the CLI can signal every
//! registered process group directly, even while the scheduler is unwinding.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningJob {
    /// Process group id (equal to the leader's pid)
    pub pgid: u32,
    pub plugin_id: String,
}

static RUNNING: Lazy<Mutex<HashMap<String, RunningJob>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub fn register(job_id: &str, pgid: u32, plugin_id: impl Into<String>) {
    let mut guard = RUNNING.lock().unwrap_or_else(|e| e.into_inner());
    guard.insert(
        job_id.to_string(),
        RunningJob {
            pgid,
            plugin_id: plugin_id.into(),
        },
    );
}

pub fn unregister(job_id: &str) {
    let mut guard = RUNNING.lock().unwrap_or_else(|e| e.into_inner());
    guard.remove(job_id);
}

pub fn get(job_id: &str) -> Option<RunningJob> {
    let guard = RUNNING.lock().unwrap_or_else(|e| e.into_inner());
    guard.get(job_id).cloned()
}

pub fn running() -> Vec<(String, RunningJob)> {
    let guard = RUNNING.lock().unwrap_or_else(|e| e.into_inner());
    let mut jobs: Vec<_> = guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    jobs.sort_by(|a, b| a.0.cmp(&b.0));
    jobs
}

/// Send SIGTERM to a process group
pub fn terminate_group(pgid: u32) -> bool {
    #[cfg(unix)]
    {
        signal_group(pgid, libc::SIGTERM)
    }

    #[cfg(not(unix))]
    {
        let _ = pgid;
        false
    }
}

/// Send SIGKILL to a process group
pub fn kill_group(pgid: u32) -> bool {
    #[cfg(unix)]
    {
        signal_group(pgid, libc::SIGKILL)
    }

    #[cfg(not(unix))]
    {
        let _ = pgid;
        false
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) -> bool {
    let Ok(pgid) = i32::try_from(pgid) else {
        return false;
    };
    if pgid <= 1 {
        return false;
    }
    // Negative pid addresses the whole process group
    let rc = unsafe { libc::kill(-pgid, signal) };
    rc == 0
}

/// Force-kill every registered job. Returns how many groups were signalled.
pub fn kill_all() -> usize {
    running()
        .into_iter()
        .filter(|(job_id, job)| {
            let killed = kill_group(job.pgid);
            if killed {
                tracing::warn!("Force-killed {} ({})", job_id, job.plugin_id);
            }
            killed
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister() {
        register("test-registry-job", 999_999, "recon");
        assert_eq!(get("test-registry-job").unwrap().plugin_id, "recon");
        assert!(running().iter().any(|(id, _)| id == "test-registry-job"));
        unregister("test-registry-job");
        assert!(get("test-registry-job").is_none());
    }

    #[test]
    fn refuses_to_signal_init_or_invalid_groups() {
        assert!(!kill_group(0));
        assert!(!kill_group(1));
        assert!(!terminate_group(u32::MAX));
    }
}
