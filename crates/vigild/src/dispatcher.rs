//! Single-flight dispatch of capture events.
//!
//! At most one identification job runs at a time. A capture that arrives
//! while a job is in flight is dropped, never queued.

use crate::identify::{CaptureJob, JobOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use vigil_core::types::CaptureEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Started,
    /// Another job was in flight.
    Dropped,
}

pub struct IdentificationDispatcher<J> {
    slot: Arc<Semaphore>,
    job: Arc<J>,
    runtime: Handle,
    job_timeout: Duration,
}

impl<J: CaptureJob> IdentificationDispatcher<J> {
    /// Jobs are spawned on `runtime`, so [`submit`](Self::submit) may be
    /// called from threads outside it.
    pub fn new(job: Arc<J>, runtime: Handle, job_timeout: Duration) -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
            job,
            runtime,
            job_timeout,
        }
    }

    /// Start a job for `event` unless one is already running. Never blocks.
    ///
    /// The slot is held by the spawned task and released when it finishes,
    /// panics, or is abandoned after `job_timeout`.
    pub fn submit(&self, event: CaptureEvent) -> SubmitOutcome {
        let Ok(permit) = self.slot.clone().try_acquire_owned() else {
            tracing::debug!(path = %event.image_path.display(), "identification in flight; capture dropped");
            return SubmitOutcome::Dropped;
        };

        let job = self.job.clone();
        let timeout = self.job_timeout;
        self.runtime.spawn(async move {
            let _permit = permit;
            let path = event.image_path.display().to_string();
            match tokio::time::timeout(timeout, job.run(event)).await {
                Ok(outcome) => {
                    tracing::debug!(path = %path, known = outcome_is_known(&outcome), "identification finished");
                }
                Err(_) => {
                    tracing::warn!(path = %path, timeout_secs = timeout.as_secs_f32(), "identification timed out; job abandoned");
                }
            }
        });

        SubmitOutcome::Started
    }

    #[cfg(test)]
    pub fn is_busy(&self) -> bool {
        self.slot.available_permits() == 0
    }
}

fn outcome_is_known(outcome: &JobOutcome) -> bool {
    outcome.result().is_known()
}
