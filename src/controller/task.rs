//! Cooperative task cancellation
//!
//! A running task owns a [`StopToken`] and polls it once per frame. The
//! controller keeps the matching [`StopHandle`] in its registry. A stop
//! request carries the stop function that caused it and, for explicit stops,
//! the listener that must receive the final Ack.

use crate::function::{SharedListener, WorkerFunction};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Why a task is being asked to end
#[derive(Default)]
pub struct StopRequest {
    /// Stop command to acknowledge; `None` acks the start as stopped
    pub function: Option<WorkerFunction>,
    /// Replaces the task's listener for the final Ack
    pub listener: Option<SharedListener>,
}

impl StopRequest {
    pub fn new(function: WorkerFunction, listener: Option<SharedListener>) -> Self {
        Self {
            function: Some(function),
            listener,
        }
    }
}

/// Callbacks a task runs on its own thread
pub(crate) struct TaskHooks {
    /// After the start Ack
    pub on_started: Box<dyn FnOnce() + Send>,
    /// Before the closing Ack
    pub on_finished: Box<dyn FnOnce() + Send>,
}

/// Create the two ends of one task's stop channel
pub fn stop_pair() -> (StopHandle, StopToken) {
    let (tx, rx) = bounded::<StopRequest>(1);
    let finished = Arc::new(AtomicBool::new(false));
    let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
    (
        StopHandle {
            id,
            tx,
            finished: finished.clone(),
        },
        StopToken { id, rx, finished },
    )
}

/// Controller side of a running task
pub struct StopHandle {
    id: u64,
    tx: Sender<StopRequest>,
    finished: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn task_id(&self) -> u64 {
        self.id
    }

    /// Ask the task to stop; false if it already ended or was already asked
    pub fn request_stop(&self, request: StopRequest) -> bool {
        if self.is_finished() {
            return false;
        }
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::debug!("Task {} already stopping", self.id);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Block until the task's token is dropped or `timeout` passes
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        true
    }
}

/// Task side; dropping it marks the task finished
pub struct StopToken {
    id: u64,
    rx: Receiver<StopRequest>,
    finished: Arc<AtomicBool>,
}

impl StopToken {
    pub fn task_id(&self) -> u64 {
        self.id
    }

    /// Non-blocking check. A dropped handle counts as a plain stop.
    pub fn poll(&self) -> Option<StopRequest> {
        match self.rx.try_recv() {
            Ok(request) => Some(request),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(StopRequest::default()),
        }
    }

    /// Wait up to `timeout` for a stop request
    pub fn wait(&self, timeout: Duration) -> Option<StopRequest> {
        match self.rx.recv_timeout(timeout) {
            Ok(request) => Some(request),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(StopRequest::default()),
        }
    }
}

impl Drop for StopToken {
    fn drop(&mut self) {
        self.finished.store(true, Ordering::Release);
    }
}
