use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::eid::Eid;

pub type JobId = Eid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

/// What a job works on. At most one active job per target.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum JobTarget {
    Taxonomy(String),
    Model(u64),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub status: JobStatus,
    /// 0-100
    pub progress: u8,
    pub total: usize,
    pub done: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taxonomy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn queued(target: &JobTarget) -> Self {
        let now = Utc::now();
        let (taxonomy, model_id) = match target {
            JobTarget::Taxonomy(name) => (Some(name.clone()), None),
            JobTarget::Model(id) => (None, Some(*id)),
        };
        Self {
            status: JobStatus::Queued,
            progress: 0,
            total: 0,
            done: 0,
            taxonomy,
            model_id,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn targets(&self, target: &JobTarget) -> bool {
        match target {
            JobTarget::Taxonomy(name) => self.taxonomy.as_deref() == Some(name.as_str()),
            JobTarget::Model(id) => self.model_id == Some(*id),
        }
    }
}

/// Partial update; `None` fields are left alone.
#[derive(Clone, Debug, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub total: Option<usize>,
    pub done: Option<usize>,
    pub error: Option<String>,
}

impl JobUpdate {
    pub fn running(total: usize) -> Self {
        Self {
            status: Some(JobStatus::Running),
            progress: Some(0),
            total: Some(total),
            done: Some(0),
            ..Default::default()
        }
    }

    /// `progress = floor(done * 100 / total)`, capped at 100.
    pub fn progress(done: usize, total: usize) -> Self {
        let progress = if total == 0 {
            100
        } else {
            (done.saturating_mul(100) / total).min(100) as u8
        };
        Self {
            progress: Some(progress),
            done: Some(done),
            ..Default::default()
        }
    }

    pub fn completed() -> Self {
        Self {
            status: Some(JobStatus::Completed),
            progress: Some(100),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Admission {
    /// A new job was registered in `queued` state
    Started(JobId),
    /// A job for the same target is still queued or running
    AlreadyActive(JobId, JobRecord),
}

/// Keyed job table. Records are never evicted.
#[derive(Default)]
pub struct JobTracker {
    jobs: Mutex<HashMap<JobId, JobRecord>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, id: JobId, record: JobRecord) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, record);
    }

    /// Returns the updated record, or `None` for an unknown id.
    pub fn update(&self, id: &JobId, update: JobUpdate) -> Option<JobRecord> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let record = jobs.get_mut(id)?;

        if let Some(status) = update.status {
            record.status = status;
        }
        if let Some(progress) = update.progress {
            record.progress = progress.min(100);
        }
        if let Some(total) = update.total {
            record.total = total;
        }
        if let Some(done) = update.done {
            record.done = done;
        }
        if update.error.is_some() {
            record.error = update.error;
        }
        record.updated_at = Utc::now();

        Some(record.clone())
    }

    pub fn get(&self, id: &JobId) -> Option<JobRecord> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn all(&self) -> BTreeMap<JobId, JobRecord> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }

    pub fn find_active_for_key(&self, target: &JobTarget) -> Option<(JobId, JobRecord)> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        Self::find_active(&jobs, target)
    }

    /// Check for an active job on `target` and register a new one in a single
    /// critical section.
    pub fn admit(&self, target: JobTarget) -> Admission {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((id, record)) = Self::find_active(&jobs, &target) {
            return Admission::AlreadyActive(id, record);
        }

        let id = JobId::new();
        jobs.insert(id.clone(), JobRecord::queued(&target));
        Admission::Started(id)
    }

    fn find_active(
        jobs: &HashMap<JobId, JobRecord>,
        target: &JobTarget,
    ) -> Option<(JobId, JobRecord)> {
        jobs.iter()
            .find(|(_, record)| record.status.is_active() && record.targets(target))
            .map(|(id, record)| (id.clone(), record.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_floor_and_cap() {
        assert_eq!(JobUpdate::progress(200, 450).progress, Some(44));
        assert_eq!(JobUpdate::progress(450, 450).progress, Some(100));
        assert_eq!(JobUpdate::progress(600, 450).progress, Some(100));
    }

    #[test]
    fn test_admit_then_complete_allows_next() {
        let tracker = JobTracker::new();
        let target = JobTarget::Taxonomy("brsr".into());

        let Admission::Started(first) = tracker.admit(target.clone()) else {
            panic!("first admission should start");
        };
        assert_eq!(tracker.get(&first).unwrap().status, JobStatus::Queued);

        match tracker.admit(target.clone()) {
            Admission::AlreadyActive(id, record) => {
                assert_eq!(id, first);
                assert_eq!(record.status, JobStatus::Queued);
            }
            other => panic!("unexpected {other:?}"),
        }

        tracker.update(&first, JobUpdate::completed());
        assert!(matches!(tracker.admit(target), Admission::Started(_)));
        assert_eq!(tracker.all().len(), 2);
    }

    #[test]
    fn test_targets_are_independent() {
        let tracker = JobTracker::new();
        assert!(matches!(
            tracker.admit(JobTarget::Taxonomy("brsr".into())),
            Admission::Started(_)
        ));
        assert!(matches!(
            tracker.admit(JobTarget::Taxonomy("esrs".into())),
            Admission::Started(_)
        ));
        assert!(matches!(tracker.admit(JobTarget::Model(3)), Admission::Started(_)));
        assert!(tracker
            .find_active_for_key(&JobTarget::Model(3))
            .is_some());
        assert!(tracker
            .find_active_for_key(&JobTarget::Model(4))
            .is_none());
    }

    #[test]
    fn test_update_unknown_job() {
        let tracker = JobTracker::new();
        assert!(tracker.update(&JobId::new(), JobUpdate::completed()).is_none());
    }

    #[test]
    fn test_failed_keeps_error() {
        let tracker = JobTracker::new();
        let id = JobId::new();
        tracker.set(id.clone(), JobRecord::queued(&JobTarget::Taxonomy("x".into())));
        tracker.update(&id, JobUpdate::failed("taxonomy 'x' has no entries"));

        let record = tracker.get(&id).unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("taxonomy 'x' has no entries"));
    }
}
