use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// In-process exclusivity for harvest loops, one lease per job id
#[derive(Debug, Clone, Default)]
pub struct JobLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl JobLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease for `id`, or `None` if another loop holds it
    pub fn try_acquire(&self, id: &str) -> Option<JobLease> {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        if !held.insert(id.to_string()) {
            return None;
        }
        Some(JobLease {
            id: id.to_string(),
            held: self.held.clone(),
        })
    }

    pub fn is_held(&self, id: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(id)
    }
}

/// Released on drop, including when the loop task panics
#[derive(Debug)]
pub struct JobLease {
    id: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl JobLease {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.id);
    }
}
