//! Scripted in-memory backend for engine tests
//!
//! Records every submit/poll/cancel call and plays back a scripted
//! sequence of poll states per fingerprint. The last scripted state
//! repeats once the sequence is exhausted.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::traits::{JobHandle, PollState, PreparedJob, QueueBackend};
use crate::error::{Error, Result};
use crate::status::ExitSummary;

#[derive(Default)]
struct MockState {
    next_id: u64,
    submitted: Vec<String>,
    cancelled: Vec<String>,
    poll_calls: usize,
    scripts: HashMap<String, VecDeque<PollState>>,
    fail_submission: bool,
    cancel_ack: bool,
    capacity: Option<usize>,
}

pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                cancel_ack: true,
                ..MockState::default()
            }),
        }
    }

    /// Script the poll states a fingerprint will move through
    pub fn script(&self, fingerprint: &str, states: Vec<PollState>) {
        self.state
            .lock()
            .scripts
            .insert(fingerprint.to_string(), states.into());
    }

    /// Shorthand: queued, running, then finished with the given exit code
    pub fn script_lifecycle(&self, fingerprint: &str, exit_code: i32) {
        self.script(
            fingerprint,
            vec![
                PollState::Queued,
                PollState::Running,
                PollState::Finished(ExitSummary {
                    exit_code: Some(exit_code),
                    output_tail: String::new(),
                }),
            ],
        );
    }

    pub fn set_fail_submission(&self, fail: bool) {
        self.state.lock().fail_submission = fail;
    }

    pub fn set_cancel_ack(&self, ack: bool) {
        self.state.lock().cancel_ack = ack;
    }

    pub fn set_capacity(&self, capacity: Option<usize>) {
        self.state.lock().capacity = capacity;
    }

    pub fn submitted(&self) -> Vec<String> {
        self.state.lock().submitted.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().cancelled.clone()
    }

    pub fn poll_calls(&self) -> usize {
        self.state.lock().poll_calls
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn submit(&self, job: &PreparedJob) -> Result<JobHandle> {
        let mut state = self.state.lock();
        if state.fail_submission {
            return Err(Error::submission("mock", "scripted submission failure"));
        }
        state.next_id += 1;
        state.submitted.push(job.fingerprint.clone());
        Ok(JobHandle {
            fingerprint: job.fingerprint.clone(),
            id: format!("mock-{}", state.next_id),
            run_dir: PathBuf::from("/nonexistent/mock"),
        })
    }

    async fn poll(&self, handles: &[JobHandle]) -> Result<HashMap<String, PollState>> {
        let mut state = self.state.lock();
        state.poll_calls += 1;
        let mut states = HashMap::new();
        for handle in handles {
            let next = match state.scripts.get_mut(&handle.fingerprint) {
                Some(seq) if seq.len() > 1 => seq.pop_front().unwrap(),
                Some(seq) => seq.front().cloned().unwrap_or(PollState::Lost),
                None => PollState::Lost,
            };
            states.insert(handle.fingerprint.clone(), next);
        }
        Ok(states)
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<bool> {
        let mut state = self.state.lock();
        state.cancelled.push(handle.fingerprint.clone());
        Ok(state.cancel_ack)
    }

    fn capacity_hint(&self) -> Option<usize> {
        self.state.lock().capacity
    }
}
