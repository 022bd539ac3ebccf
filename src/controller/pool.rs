//! Bounded worker pool with an unbounded queue
//!
//! Threads are spawned on demand up to `max_threads` and exit after
//! `keep_alive` without work. A job never waits behind a busy thread while
//! the pool is below its bound, which matters because playback and record
//! jobs run for as long as the task lives.

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct PoolState {
    threads: usize,
    busy: usize,
    queued: usize,
}

struct Shared {
    name: String,
    keep_alive: Duration,
    rx: Receiver<Job>,
    state: Mutex<PoolState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct TaskPool {
    shared: Arc<Shared>,
    tx: Mutex<Option<Sender<Job>>>,
    max_threads: usize,
}

impl TaskPool {
    pub fn new(name: impl Into<String>, max_threads: usize, keep_alive: Duration) -> Self {
        let (tx, rx) = unbounded::<Job>();
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                keep_alive,
                rx,
                state: Mutex::new(PoolState::default()),
            }),
            tx: Mutex::new(Some(tx)),
            max_threads: max_threads.max(1),
        }
    }

    /// Queue a job; fails only after shutdown
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(tx) = tx.as_ref() else {
                bail!("{} pool is shut down", self.shared.name);
            };
            tx.send(Box::new(job))
                .map_err(|_| anyhow!("{} pool queue closed", self.shared.name))?;
        }

        let mut state = self.shared.state();
        state.queued += 1;
        let idle = state.threads - state.busy;
        if idle < state.queued && state.threads < self.max_threads {
            state.threads += 1;
            let shared = self.shared.clone();
            let index = state.threads;
            // NOT tokio::spawn - std::thread to avoid Send issues
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", shared.name, index))
                .spawn(move || worker_loop(shared));
            if let Err(e) = spawned {
                state.threads -= 1;
                log::error!("{} pool failed to spawn a worker: {}", self.shared.name, e);
            }
        }
        Ok(())
    }

    /// Live worker threads
    pub fn threads(&self) -> usize {
        self.shared.state().threads
    }

    pub fn is_shutdown(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Stop accepting jobs; workers drain the queue and exit
    pub fn shutdown(&self) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if tx.is_some() {
            log::debug!("{} pool shut down", self.shared.name);
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        match shared.rx.recv_timeout(shared.keep_alive) {
            Ok(job) => {
                {
                    let mut state = shared.state();
                    state.queued = state.queued.saturating_sub(1);
                    state.busy += 1;
                }
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    log::error!("{} pool job panicked", shared.name);
                }
                shared.state().busy -= 1;
            }
            Err(RecvTimeoutError::Timeout) => {
                let mut state = shared.state();
                if shared.rx.is_empty() {
                    state.threads -= 1;
                    log::trace!("{} pool worker idle, exiting", shared.name);
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                shared.state().threads -= 1;
                return;
            }
        }
    }
}
