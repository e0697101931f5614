//! Supervised almanac downloads.
//!
//! One background task per device: load the almanac, plan frames, deliver
//! them. The uplink that triggered it does not wait. Each finished, failed
//! or cancelled task reports a [`DownloadOutcome`] on the completion channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use vsm_core::chunk::plan_almanac;
use vsm_core::{Result, VsmError};

use crate::downlink::{deliver_almanac, Downlinker};
use crate::solver::Solver;

#[derive(Debug)]
pub struct DownloadOutcome {
    pub task_id: Uuid,
    pub device_id: String,
    /// Frames sent, or why the download stopped.
    pub result: Result<usize>,
}

struct Running {
    task_id: Uuid,
    handle: JoinHandle<()>,
}

pub struct AlmanacDownloads {
    solver: Arc<dyn Solver>,
    downlinker: Arc<dyn Downlinker>,
    pacing: Duration,
    tasks: Mutex<HashMap<String, Running>>,
    outcomes: mpsc::UnboundedSender<DownloadOutcome>,
}

impl AlmanacDownloads {
    pub fn new(
        solver: Arc<dyn Solver>,
        downlinker: Arc<dyn Downlinker>,
        pacing: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<DownloadOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let downloads = AlmanacDownloads {
            solver,
            downlinker,
            pacing,
            tasks: Mutex::new(HashMap::new()),
            outcomes: tx,
        };
        (downloads, rx)
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, Running>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a download for `device_id` unless one is already running.
    ///
    /// Returns the new task id, or `None` when skipped.
    pub fn launch(&self, device_id: &str, max_size: usize) -> Option<Uuid> {
        let mut tasks = self.tasks();
        tasks.retain(|_, running| !running.handle.is_finished());
        if let Some(running) = tasks.get(device_id) {
            warn!(device = device_id, task = %running.task_id, "almanac download already in flight, skipping");
            return None;
        }

        let task_id = Uuid::new_v4();
        let solver = self.solver.clone();
        let downlinker = self.downlinker.clone();
        let outcomes = self.outcomes.clone();
        let pacing = self.pacing;
        let device = device_id.to_string();

        let handle = tokio::spawn(async move {
            let result = download(solver.as_ref(), downlinker.as_ref(), &device, max_size, pacing).await;
            match &result {
                Ok(frames) => info!(device = %device, task = %task_id, frames, "almanac download complete"),
                Err(e) => warn!(device = %device, task = %task_id, error = %e, "almanac download stopped"),
            }
            let _ = outcomes.send(DownloadOutcome {
                task_id,
                device_id: device,
                result,
            });
        });

        info!(device = device_id, task = %task_id, max_size, "almanac download launched");
        tasks.insert(device_id.to_string(), Running { task_id, handle });
        Some(task_id)
    }

    /// Abort an in-flight download. Frames already sent stay sent.
    pub fn cancel(&self, device_id: &str) -> bool {
        let Some(running) = self.tasks().remove(device_id) else {
            return false;
        };
        if running.handle.is_finished() {
            return false;
        }
        running.handle.abort();
        info!(device = device_id, task = %running.task_id, "almanac download cancelled");
        let _ = self.outcomes.send(DownloadOutcome {
            task_id: running.task_id,
            device_id: device_id.to_string(),
            result: Err(VsmError::ProtocolAbort("cancelled".into())),
        });
        true
    }

    /// Number of downloads still running.
    pub fn in_flight(&self) -> usize {
        self.tasks()
            .values()
            .filter(|r| !r.handle.is_finished())
            .count()
    }

    /// Wait for every launched download to finish.
    pub async fn join_all(&self) {
        let handles: Vec<_> = self.tasks().drain().map(|(_, r)| r.handle).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(error = %e, "almanac download task panicked");
                }
            }
        }
    }
}

async fn download(
    solver: &dyn Solver,
    downlinker: &dyn Downlinker,
    device_id: &str,
    max_size: usize,
    pacing: Duration,
) -> Result<usize> {
    let almanac = solver
        .load_almanac()
        .await
        .ok_or_else(|| VsmError::Upstream("almanac unavailable".into()))?;
    let frames = plan_almanac(&almanac, max_size)?;

    info!(
        device = device_id,
        compressed = almanac.is_compressed(),
        image_bytes = almanac.payload().len(),
        frames = frames.len(),
        "almanac download starting"
    );
    deliver_almanac(downlinker, device_id, &frames, pacing).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeSolver, RecordingDownlinker};
    use vsm_core::FrameTag;

    const PACING: Duration = Duration::from_secs(1);

    fn dense(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 200) as u8 + 1).collect()
    }

    fn setup(
        solver: FakeSolver,
        downlinker: RecordingDownlinker,
    ) -> (
        AlmanacDownloads,
        mpsc::UnboundedReceiver<DownloadOutcome>,
        Arc<FakeSolver>,
        Arc<RecordingDownlinker>,
    ) {
        let solver = Arc::new(solver);
        let downlinker = Arc::new(downlinker);
        let (downloads, rx) = AlmanacDownloads::new(solver.clone(), downlinker.clone(), PACING);
        (downloads, rx, solver, downlinker)
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_delivers_frames() {
        let (downloads, mut rx, _solver, downlinker) =
            setup(FakeSolver::with_almanac(dense(100)), RecordingDownlinker::default());

        let task = downloads.launch("dev1", 40).unwrap();
        let outcome = rx.recv().await.unwrap();

        assert_eq!(outcome.task_id, task);
        assert_eq!(outcome.device_id, "dev1");
        // 100 bytes at 34 per frame
        assert_eq!(outcome.result.unwrap(), 3);
        assert_eq!(
            downlinker.tags(),
            vec![
                Some(FrameTag::AlmanacBegin),
                Some(FrameTag::AlmanacSegment),
                Some(FrameTag::AlmanacEndFull)
            ]
        );
        assert!(downlinker.sent().iter().all(|s| s.downlink.confirmed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_compressed_image_end_tag() {
        let mut image = vec![0u8; 1000];
        image[0] = 1;
        let (downloads, mut rx, _solver, downlinker) =
            setup(FakeSolver::with_almanac(image), RecordingDownlinker::default());

        downloads.launch("dev1", 51);
        rx.recv().await.unwrap().result.unwrap();

        assert_eq!(downlinker.tags().last().unwrap(), &Some(FrameTag::AlmanacEndCompressed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_launch_skipped_while_running() {
        let (downloads, mut rx, solver, _downlinker) =
            setup(FakeSolver::with_almanac(dense(500)), RecordingDownlinker::default());

        assert!(downloads.launch("dev1", 40).is_some());
        assert!(downloads.launch("dev1", 40).is_none());
        assert!(downloads.launch("dev2", 40).is_some());
        assert_eq!(downloads.in_flight(), 2);

        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        assert_eq!(solver.almanac_loads(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relaunch_after_completion() {
        let (downloads, mut rx, _solver, _downlinker) =
            setup(FakeSolver::with_almanac(dense(40)), RecordingDownlinker::default());

        downloads.launch("dev1", 40);
        rx.recv().await.unwrap();
        downloads.join_all().await;
        assert!(downloads.launch("dev1", 40).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_too_small_sends_nothing() {
        let (downloads, mut rx, _solver, downlinker) =
            setup(FakeSolver::with_almanac(dense(100)), RecordingDownlinker::default());

        downloads.launch("dev1", 35);
        let outcome = rx.recv().await.unwrap();
        assert!(matches!(outcome.result, Err(VsmError::ProtocolAbort(_))));
        assert_eq!(downlinker.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_almanac() {
        let (downloads, mut rx, _solver, downlinker) =
            setup(FakeSolver::default(), RecordingDownlinker::default());

        downloads.launch("dev1", 51);
        let outcome = rx.recv().await.unwrap();
        assert!(matches!(outcome.result, Err(VsmError::Upstream(_))));
        assert_eq!(downlinker.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_aborts_remaining() {
        let (downloads, mut rx, _solver, downlinker) =
            setup(FakeSolver::with_almanac(dense(200)), RecordingDownlinker::failing_after(2));

        downloads.launch("dev1", 40);
        let outcome = rx.recv().await.unwrap();
        assert!(matches!(outcome.result, Err(VsmError::ProtocolAbort(_))));
        assert_eq!(downlinker.sent().len(), 2);
        assert_eq!(downlinker.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_in_flight() {
        let (downloads, mut rx, _solver, downlinker) =
            setup(FakeSolver::with_almanac(dense(2000)), RecordingDownlinker::default());

        downloads.launch("dev1", 40);
        // Let the first frames go out
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(downloads.cancel("dev1"));
        assert!(!downloads.cancel("dev1"));

        let outcome = rx.recv().await.unwrap();
        assert!(matches!(outcome.result, Err(VsmError::ProtocolAbort(_))));
        let sent = downlinker.sent().len();
        assert!(sent > 0 && sent < 59);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(downlinker.sent().len(), sent);
    }
}
