use crate::job::{FailureKind, JobId, JobStatus, StepStatus};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::mpsc;

/// Push notification for UI-style consumers. Correctness never depends on a
/// subscriber: the manifest is always written first.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    JobCreated {
        job_id: JobId,
        steps: usize,
    },
    JobStatusChanged {
        job_id: JobId,
        status: JobStatus,
    },
    StepStarted {
        job_id: JobId,
        step_index: usize,
    },
    StepFinished {
        job_id: JobId,
        step_index: usize,
        status: StepStatus,
        outputs: usize,
    },
    StepSkipped {
        job_id: JobId,
        step_index: usize,
        reason: FailureKind,
    },
}

#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<JobEvent>>>,
}

impl EventBus {
    pub fn subscribe(&self) -> mpsc::Receiver<JobEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Delivers to live subscribers; dropped receivers are pruned.
    pub fn emit(&self, event: JobEvent) {
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
