//! Asynchronous double-buffered worker (C6): a single background execution
//! context per process that pipelines disk writes/reads behind the
//! client's buffer refill.
//!
//! Grounded on `spec.md` §4.6/§5 for the contract — `post` blocks until the
//! worker is idle, then returns the **previous** request's outcome (the
//! "one-in-flight lag"), so the first post on a fresh worker always yields
//! [`WorkerOutcome::None`] (treated as a zero byte count by callers). The
//! mutex+condvar pairing around a single pending-request slot is kept
//! literal to the original's `pthread_mutex_t`/`pthread_cond_t` rendezvous
//! on `Wmtx`/`Wcnd` (`SPEC_FULL.md` §5), not rebuilt on `crossbeam-channel`
//! the way `oxidized-fuse/src/executor.rs` queues its thread pool's work —
//! a queue would still need a separate out-of-band slot for "the previous
//! result", so the condvar rendezvous is both more literal and no simpler
//! to replace here.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::diskio;
use crate::error::{MiddlewareError, Result};

/// A request posted to the worker. `fd` is the raw, already-open
/// descriptor; the worker never opens or closes it.
#[derive(Debug)]
pub enum WorkerRequest {
    Write { fd: i32, data: Vec<u8>, pos: u64 },
    Read { fd: i32, len: usize, pos: u64 },
}

/// Outcome of a previously posted request. `None` is the sentinel returned
/// by the very first `post` call and by `drain` when nothing is in flight.
#[derive(Debug, Default)]
pub enum WorkerOutcome {
    #[default]
    None,
    Write {
        bytes: u64,
    },
    Read {
        bytes: u64,
        data: Vec<u8>,
    },
    Error(String),
}

impl WorkerOutcome {
    /// Byte count carried by this outcome; `None` and `Error` both read as
    /// zero, matching the contract that the first post always returns 0.
    pub fn bytes(&self) -> u64 {
        match self {
            WorkerOutcome::Write { bytes } | WorkerOutcome::Read { bytes, .. } => *bytes,
            WorkerOutcome::None | WorkerOutcome::Error(_) => 0,
        }
    }
}

struct Shared {
    pending: Option<WorkerRequest>,
    outcome: WorkerOutcome,
    idle: bool,
    finished: bool,
}

/// A single background execution context, bound to at most one managed
/// descriptor at a time (`spec.md` §4.6: "opening a second managed
/// descriptor while the worker is bound to a first is forbidden in this
/// scope").
pub struct Worker {
    state: Arc<(Mutex<Shared>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn() -> Self {
        let state = Arc::new((
            Mutex::new(Shared {
                pending: None,
                outcome: WorkerOutcome::None,
                idle: true,
                finished: false,
            }),
            Condvar::new(),
        ));
        let worker_state = state.clone();
        let handle = std::thread::Builder::new()
            .name("iomiddle-worker".into())
            .spawn(move || Self::run(&worker_state))
            .expect("failed to spawn iomiddle worker thread");
        Worker {
            state,
            handle: Some(handle),
        }
    }

    fn run(state: &(Mutex<Shared>, Condvar)) {
        let (lock, cond) = state;
        loop {
            let request = {
                let mut guard = lock.lock().unwrap();
                while guard.pending.is_none() && !guard.finished {
                    guard = cond.wait(guard).unwrap();
                }
                guard.pending.take()
            };
            let Some(request) = request else {
                // Woke up for `finished` with nothing queued.
                break;
            };
            let outcome = Self::execute(request);
            let mut guard = lock.lock().unwrap();
            guard.outcome = outcome;
            guard.idle = true;
            cond.notify_all();
        }
    }

    fn execute(request: WorkerRequest) -> WorkerOutcome {
        match request {
            WorkerRequest::Write { fd, data, pos } => match diskio::pwrite_all(fd, &data, pos) {
                Ok(bytes) => WorkerOutcome::Write { bytes },
                Err(e) => WorkerOutcome::Error(e.to_string()),
            },
            WorkerRequest::Read { fd, len, pos } => {
                let mut buf = vec![0u8; len];
                match diskio::pread_all(fd, &mut buf, pos) {
                    Ok(bytes) => WorkerOutcome::Read { bytes, data: buf },
                    Err(e) => WorkerOutcome::Error(e.to_string()),
                }
            }
        }
    }

    /// Blocks until the worker is idle, hands it `request`, and returns the
    /// outcome of the *previous* request (the one-in-flight lag). Returns
    /// `Ok(WorkerOutcome::None)` on the very first call.
    pub fn post(&self, request: WorkerRequest) -> Result<WorkerOutcome> {
        let (lock, cond) = &*self.state;
        let mut guard = lock.lock().unwrap();
        while !guard.idle {
            guard = cond.wait(guard).unwrap();
        }
        let previous = std::mem::take(&mut guard.outcome);
        guard.idle = false;
        guard.pending = Some(request);
        cond.notify_all();
        drop(guard);
        Self::unwrap_outcome(previous)
    }

    /// Blocks until the worker is idle and returns its last outcome without
    /// posting new work. Used by collective close to drain the final
    /// in-flight write before the descriptor is released.
    pub fn drain(&self) -> Result<WorkerOutcome> {
        let (lock, cond) = &*self.state;
        let mut guard = lock.lock().unwrap();
        while !guard.idle {
            guard = cond.wait(guard).unwrap();
        }
        let previous = std::mem::take(&mut guard.outcome);
        Self::unwrap_outcome(previous)
    }

    fn unwrap_outcome(outcome: WorkerOutcome) -> Result<WorkerOutcome> {
        match outcome {
            WorkerOutcome::Error(msg) => Err(MiddlewareError::Worker(msg)),
            other => Ok(other),
        }
    }

    /// Signals the worker's run loop to exit and joins it, logging (but not
    /// blocking indefinitely on) a shutdown that exceeds `timeout`. Per
    /// `spec.md` §5 there is no cancellation — this only bounds how long a
    /// caller waits before giving up and moving on, not the worker's actual
    /// lifetime.
    pub fn finish(mut self, timeout: Duration) {
        let (lock, cond) = &*self.state;
        {
            let mut guard = lock.lock().unwrap();
            guard.finished = true;
            cond.notify_all();
        }
        let Some(handle) = self.handle.take() else {
            return;
        };
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let watchdog = std::thread::spawn(move || {
            let _ = handle.join();
            let _ = done_tx.send(());
        });
        if done_rx.recv_timeout(timeout).is_err() {
            tracing::warn!(?timeout, "iomiddle worker shutdown exceeded join timeout, still waiting");
            let _ = done_rx.recv();
        }
        let _ = watchdog.join();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let (lock, cond) = &*self.state;
            let mut guard = lock.lock().unwrap();
            guard.finished = true;
            cond.notify_all();
            drop(guard);
            let _ = handle.join();
        }
    }
}
