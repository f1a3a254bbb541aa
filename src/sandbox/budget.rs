//! Memory headroom shared between concurrently running jobs

use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Usage {
    reserved_mb: u64,
    jobs: usize,
}

/// Tracks memory promised to running jobs against a fixed budget
#[derive(Debug, Clone)]
pub struct MemoryBudget {
    total_mb: u64,
    usage: Arc<Mutex<Usage>>,
}

impl MemoryBudget {
    pub fn new(total_mb: u64) -> Self {
        Self {
            total_mb,
            usage: Arc::new(Mutex::new(Usage::default())),
        }
    }

    pub fn total_mb(&self) -> u64 {
        self.total_mb
    }

    /// Memory not reserved by any running job
    pub fn headroom_mb(&self) -> u64 {
        let usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
        self.total_mb.saturating_sub(usage.reserved_mb)
    }

    pub fn running_jobs(&self) -> usize {
        self.usage.lock().unwrap_or_else(|e| e.into_inner()).jobs
    }

    /// Reserve memory for a job. A job larger than the headroom is only
    /// admitted when nothing else is running, so oversized jobs still run
    /// (alone) instead of starving.
    pub fn try_reserve(&self, memory_mb: u64) -> Option<MemoryReservation> {
        let mut usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
        let headroom = self.total_mb.saturating_sub(usage.reserved_mb);
        if memory_mb > headroom && usage.jobs > 0 {
            return None;
        }
        usage.reserved_mb += memory_mb;
        usage.jobs += 1;
        Some(MemoryReservation {
            memory_mb,
            usage: self.usage.clone(),
        })
    }
}

/// Memory held by one running job; released on drop
#[derive(Debug)]
pub struct MemoryReservation {
    memory_mb: u64,
    usage: Arc<Mutex<Usage>>,
}

impl MemoryReservation {
    pub fn memory_mb(&self) -> u64 {
        self.memory_mb
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        let mut usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
        usage.reserved_mb = usage.reserved_mb.saturating_sub(self.memory_mb);
        usage.jobs = usage.jobs.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_respect_headroom() {
        let budget = MemoryBudget::new(1024);
        let a = budget.try_reserve(512).unwrap();
        let b = budget.try_reserve(512).unwrap();
        assert_eq!(budget.headroom_mb(), 0);
        assert!(budget.try_reserve(256).is_none());

        drop(a);
        assert_eq!(budget.headroom_mb(), 512);
        assert!(budget.try_reserve(256).is_some());
        drop(b);
        assert_eq!(budget.running_jobs(), 0);
    }

    #[test]
    fn oversized_job_runs_alone() {
        let budget = MemoryBudget::new(1024);
        let big = budget.try_reserve(4096).unwrap();
        assert!(budget.try_reserve(1).is_none());
        drop(big);
        assert_eq!(budget.headroom_mb(), 1024);
    }
}
