use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use tracing::{debug, info};

use crate::{JobId, MediaCategory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The job became current for its category and should start now.
    Started,
    /// The job waits behind the current one; `position` is 1-based.
    Queued { position: usize },
    AlreadyRegistered,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryStatus {
    pub category: MediaCategory,
    pub current: Option<JobId>,
    pub queued: Vec<JobId>,
}

/// Serializes generation jobs per media category: at most one current job
/// per category, the others wait in FIFO order.
///
/// The scheduler only tracks identities. Starting a promoted job is up to the
/// caller, which learns about it from the return value of [`JobScheduler::complete`].
#[derive(Debug, Default)]
pub struct JobScheduler {
    current: HashMap<MediaCategory, JobId>,
    queues: HashMap<MediaCategory, VecDeque<JobId>>,
}

impl JobScheduler {
    pub fn new() -> Self { Self::default() }

    pub fn register(&mut self, id: JobId, category: MediaCategory) -> Admission {
        let queue = self.queues.entry(category).or_default();
        if self.current.get(&category) == Some(&id) || queue.contains(&id) {
            return Admission::AlreadyRegistered;
        }
        if queue.is_empty() && !self.current.contains_key(&category) {
            self.current.insert(category, id);
            info!(job = %id, ?category, "starting job");
            return Admission::Started;
        }
        queue.push_back(id);
        debug!(job = %id, ?category, waiting = queue.len(), "job queued");
        Admission::Queued { position: queue.len() }
    }

    /// Frees the slot held by `id` and returns the job promoted in its place.
    /// Completions from jobs that are not current are ignored.
    pub fn complete(&mut self, id: JobId, category: MediaCategory) -> Option<JobId> {
        if self.current.get(&category) != Some(&id) {
            debug!(job = %id, ?category, "ignoring completion of a job that is not current");
            return None;
        }
        self.current.remove(&category);
        let next = self.queues.get_mut(&category)?.pop_front()?;
        self.current.insert(category, next);
        info!(job = %next, ?category, "starting job");
        Some(next)
    }

    /// Forgets `id`. Withdrawing the current job frees its slot like a completion.
    pub fn withdraw(&mut self, id: JobId, category: MediaCategory) -> Option<JobId> {
        if self.current.get(&category) == Some(&id) {
            return self.complete(id, category);
        }
        if let Some(queue) = self.queues.get_mut(&category) {
            queue.retain(|queued| *queued != id);
        }
        None
    }

    pub fn current(&self, category: MediaCategory) -> Option<JobId> { self.current.get(&category).copied() }

    pub fn queued(&self, category: MediaCategory) -> Vec<JobId> {
        self.queues.get(&category).map(|q| q.iter().copied().collect()).unwrap_or_default()
    }

    pub fn is_idle(&self) -> bool { self.current.is_empty() }

    pub fn status(&self) -> Vec<CategoryStatus> {
        MediaCategory::ALL
            .into_iter()
            .map(|category| CategoryStatus { category, current: self.current(category), queued: self.queued(category) })
            .collect()
    }
}
