//! Async execution lanes and per-object completion timelines.
//!
//! Async guest calls are queued on a device's lane and run on its worker
//! thread, outside the decoder lock. When a job finishes, the timeline of the
//! object it was issued against advances to the job's sequence number; host
//! sync calls block on that timeline.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

#[derive(Debug, Default)]
struct TimelineState {
    completed: u32,
    shutdown: bool,
}

/// Completed-sequence counter for one queue or command buffer.
#[derive(Debug, Default)]
pub struct SyncTimeline {
    state: Mutex<TimelineState>,
    cond: Condvar,
}

impl SyncTimeline {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn completed(&self) -> u32 {
        self.state.lock().completed
    }

    /// Mark everything up to `sequence_number` complete.
    pub fn advance(&self, sequence_number: u32) {
        let mut state = self.state.lock();
        if sequence_number > state.completed {
            state.completed = sequence_number;
        }
        self.cond.notify_all();
    }

    /// Release every waiter; further waits return immediately.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cond.notify_all();
    }

    /// Block until `sequence_number` completes. Returns false if the timeline
    /// was shut down first.
    pub fn wait(&self, sequence_number: u32, warn_every: Duration) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.completed >= sequence_number {
                return true;
            }
            if state.shutdown {
                return false;
            }
            if self.cond.wait_for(&mut state, warn_every).timed_out()
                && state.completed < sequence_number
                && !state.shutdown
            {
                warn!(
                    waiting_for = sequence_number,
                    completed = state.completed,
                    "host sync still waiting"
                );
            }
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

enum LaneMessage {
    Run {
        job: Job,
        timeline: Arc<SyncTimeline>,
        sequence_number: u32,
    },
    Drain(Sender<()>),
}

/// A worker thread executing async jobs in submission order.
pub struct Lane {
    name: String,
    sender: Option<Sender<LaneMessage>>,
    worker: Option<JoinHandle<()>>,
}

impl Lane {
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Self> {
        let name = name.into();
        let (sender, receiver) = crossbeam_channel::unbounded();
        let worker = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_lane(receiver))?;
        debug!(lane = %name, "lane started");
        Ok(Self {
            name,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Queue `job`; `timeline` advances to `sequence_number` once it ran.
    pub fn submit<F>(&self, timeline: Arc<SyncTimeline>, sequence_number: u32, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let message = LaneMessage::Run {
            job: Box::new(job),
            timeline,
            sequence_number,
        };
        let rejected = match &self.sender {
            Some(sender) => sender.send(message).err().map(|e| e.into_inner()),
            None => Some(message),
        };
        // The worker is gone; run it here so the timeline still advances.
        if let Some(LaneMessage::Run {
            job,
            timeline,
            sequence_number,
        }) = rejected
        {
            warn!(lane = %self.name, "lane closed, running job inline");
            job();
            timeline.advance(sequence_number);
        }
    }

    /// Block until every job queued so far has run.
    pub fn drain(&self) {
        if let Some(done) = self.drain_marker() {
            let _ = done.recv();
        }
    }

    /// Queue a marker behind every job queued so far and return the channel
    /// it reports on, so the caller can wait without holding anything.
    pub fn drain_marker(&self) -> Option<Receiver<()>> {
        let sender = self.sender.as_ref()?;
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        sender.send(LaneMessage::Drain(done_tx)).ok()?;
        Some(done_rx)
    }

    pub fn shutdown(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(lane = %self.name, "lane worker panicked");
            }
            debug!(lane = %self.name, "lane stopped");
        }
    }
}

impl Drop for Lane {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_lane(receiver: Receiver<LaneMessage>) {
    for message in receiver.iter() {
        match message {
            LaneMessage::Run {
                job,
                timeline,
                sequence_number,
            } => {
                job();
                timeline.advance(sequence_number);
            }
            LaneMessage::Drain(done) => {
                let _ = done.send(());
            }
        }
    }
}
