//! Live-job map, handle allocation, and unique-id coalescing index.

use std::collections::HashMap;

use super::job::{Job, JobState};

/// Status snapshot answered to GET_STATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStatus {
    pub known: bool,
    pub running: bool,
    pub numerator: u64,
    pub denominator: u64,
}

impl JobStatus {
    pub fn unknown() -> Self {
        Self {
            known: false,
            running: false,
            numerator: 0,
            denominator: 0,
        }
    }
}

/// Maps `handle -> job` plus the `(function, uniqueId) -> handle` index used
/// to coalesce duplicate submissions.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: HashMap<String, Job>,
    unique: HashMap<(String, String), String>,
    next_handle: u64,
}

impl JobRegistry {
    /// Allocate the next `H:<hostname>:<counter>` handle.
    pub fn allocate_handle(&mut self, hostname: &str) -> String {
        self.next_handle += 1;
        format!("H:{}:{}", hostname, self.next_handle)
    }

    /// Bump the counter past a replayed handle so fresh handles stay unique.
    pub fn reserve_handle(&mut self, handle: &str) {
        if let Some(counter) = handle.rsplit(':').next().and_then(|s| s.parse::<u64>().ok()) {
            self.next_handle = self.next_handle.max(counter);
        }
    }

    pub fn insert(&mut self, job: Job) {
        self.unique.insert(
            (job.function.clone(), job.unique_id.clone()),
            job.handle.clone(),
        );
        self.jobs.insert(job.handle.clone(), job);
    }

    pub fn get(&self, handle: &str) -> Option<&Job> {
        self.jobs.get(handle)
    }

    pub fn get_mut(&mut self, handle: &str) -> Option<&mut Job> {
        self.jobs.get_mut(handle)
    }

    /// Remove a job and its unique-id index entry.
    pub fn remove(&mut self, handle: &str) -> Option<Job> {
        let job = self.jobs.remove(handle)?;
        let key = (job.function.clone(), job.unique_id.clone());
        if self.unique.get(&key).map(String::as_str) == Some(handle) {
            self.unique.remove(&key);
        }
        Some(job)
    }

    /// A still-Queued job with the same `(function, uniqueId)`, if any.
    /// Running jobs no longer coalesce; a resubmission creates a new job.
    pub fn find_coalescible(&self, function: &str, unique_id: &str) -> Option<&Job> {
        let handle = self
            .unique
            .get(&(function.to_string(), unique_id.to_string()))?;
        self.jobs
            .get(handle)
            .filter(|job| job.state == JobState::Queued)
    }

    pub fn status(&self, handle: &str) -> JobStatus {
        match self.jobs.get(handle) {
            Some(job) => JobStatus {
                known: true,
                running: job.state == JobState::Running,
                numerator: job.numerator,
                denominator: job.denominator,
            },
            None => JobStatus::unknown(),
        }
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn running_for_function(&self, function: &str) -> usize {
        self.jobs
            .values()
            .filter(|j| j.function == function && j.state == JobState::Running)
            .count()
    }

    pub fn running_total(&self) -> usize {
        self.jobs
            .values()
            .filter(|j| j.state == JobState::Running)
            .count()
    }

    /// Running jobs bound to one worker session, used on disconnect.
    pub fn running_on_session(&self, session: u64) -> Vec<String> {
        self.jobs
            .values()
            .filter(|j| j.worker_session == Some(session) && j.state == JobState::Running)
            .map(|j| j.handle.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_unique_and_monotonic() {
        let mut registry = JobRegistry::default();
        let h1 = registry.allocate_handle("host");
        let h2 = registry.allocate_handle("host");
        assert_ne!(h1, h2);
        assert_eq!(h1, "H:host:1");
        assert_eq!(h2, "H:host:2");
    }

    #[test]
    fn reserve_handle_skips_replayed_counters() {
        let mut registry = JobRegistry::default();
        registry.reserve_handle("H:host:41");
        assert_eq!(registry.allocate_handle("host"), "H:host:42");
    }

    #[test]
    fn coalescing_matches_only_queued_jobs() {
        let mut registry = JobRegistry::default();
        let mut job = Job::new("h1".into(), "fn".into(), "uid".into(), b"data".to_vec());
        registry.insert(job.clone());

        assert_eq!(
            registry.find_coalescible("fn", "uid").map(|j| &j.handle[..]),
            Some("h1")
        );

        job.state = JobState::Running;
        registry.insert(job);
        assert!(registry.find_coalescible("fn", "uid").is_none());
    }

    #[test]
    fn unknown_handle_status() {
        let registry = JobRegistry::default();
        let status = registry.status("nope");
        assert!(!status.known);
        assert!(!status.running);
    }

    #[test]
    fn remove_clears_unique_index() {
        let mut registry = JobRegistry::default();
        registry.insert(Job::new("h1".into(), "fn".into(), "uid".into(), Vec::new()));
        registry.remove("h1");
        assert!(registry.find_coalescible("fn", "uid").is_none());
        assert!(registry.is_empty());
    }
}
