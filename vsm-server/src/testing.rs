//! Recording fakes for the collaborator traits, shared by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;

use vsm_core::{Almanac, DeviceState, Downlink, FrameTag, Result, SolveRequest, SolveResponse, VsmError};

use crate::downlink::Downlinker;
use crate::publisher::Publisher;
use crate::solver::Solver;

#[derive(Debug, Clone)]
pub struct Sent {
    pub device_id: String,
    pub downlink: Downlink,
    pub at: Instant,
}

/// Records every accepted downlink; optionally rejects from the n-th send on.
#[derive(Default)]
pub struct RecordingDownlinker {
    sent: Mutex<Vec<Sent>>,
    attempts: AtomicUsize,
    fail_after: Option<usize>,
}

impl RecordingDownlinker {
    pub fn failing_after(accepted: usize) -> Self {
        RecordingDownlinker {
            fail_after: Some(accepted),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self::failing_after(0)
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn tags(&self) -> Vec<Option<FrameTag>> {
        self.sent().iter().map(|s| s.downlink.tag()).collect()
    }
}

#[async_trait]
impl Downlinker for RecordingDownlinker {
    async fn send(&self, device_id: &str, downlink: &Downlink) -> Result<()> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_after.is_some_and(|limit| n >= limit) {
            return Err(VsmError::Downlink("rejected by fake".into()));
        }
        self.sent.lock().unwrap().push(Sent {
            device_id: device_id.to_string(),
            downlink: downlink.clone(),
            at: Instant::now(),
        });
        Ok(())
    }
}

/// Returns canned answers and counts calls.
#[derive(Default)]
pub struct FakeSolver {
    pub response: Option<SolveResponse>,
    pub almanac: Option<Arc<Almanac>>,
    solves: Mutex<Vec<SolveRequest>>,
    almanac_loads: AtomicUsize,
}

impl FakeSolver {
    pub fn answering(response: SolveResponse) -> Self {
        FakeSolver {
            response: Some(response),
            ..Default::default()
        }
    }

    pub fn with_almanac(image: Vec<u8>) -> Self {
        FakeSolver {
            almanac: Some(Arc::new(Almanac::with_compression(image).0)),
            ..Default::default()
        }
    }

    pub fn solves(&self) -> Vec<SolveRequest> {
        self.solves.lock().unwrap().clone()
    }

    pub fn almanac_loads(&self) -> usize {
        self.almanac_loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Solver for FakeSolver {
    async fn solve(&self, request: &SolveRequest) -> Option<SolveResponse> {
        self.solves.lock().unwrap().push(request.clone());
        self.response.clone().map(|r| r.stamp(Utc::now()))
    }

    async fn load_almanac(&self) -> Option<Arc<Almanac>> {
        self.almanac_loads.fetch_add(1, Ordering::SeqCst);
        self.almanac.clone()
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(String, DeviceState)>>,
}

impl RecordingPublisher {
    pub fn published(&self) -> Vec<(String, DeviceState)> {
        self.published.lock().unwrap().clone()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, device_id: &str, state: &DeviceState) {
        self.published
            .lock()
            .unwrap()
            .push((device_id.to_string(), state.clone()));
    }
}
