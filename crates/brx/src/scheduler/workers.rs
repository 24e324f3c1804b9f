//! 🧵 The worker pool: a bounded crew that runs one phase (or one frame group) and clocks out.
//!
//! 🎬 *[the supervisor drops a stack of jobs on the channel. four workers take them one at a
//! time. nobody leaves until the stack is gone. then everybody leaves at once.]*
//!
//! Jobs go through an `async_channel`; each worker pulls until the channel is closed and empty.
//! Joining every worker's `JoinHandle` is the barrier between phases. A synchronizer that
//! returns `Err` or panics becomes a failed outcome; its siblings keep going.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::common::SyncWindow;
use crate::report::{Phase, SynchronizerOutcome};
use crate::synchronizers::Synchronizer;

// A background worker, that does work. duh.
pub(crate) trait Worker {
    fn start(self) -> JoinHandle<Vec<SynchronizerOutcome>>;
}

struct Job {
    phase: Phase,
    synchronizer: Arc<dyn Synchronizer>,
}

struct SynchronizerWorker {
    id: usize,
    jobs: async_channel::Receiver<Job>,
    window: SyncWindow,
}

impl Worker for SynchronizerWorker {
    fn start(self) -> JoinHandle<Vec<SynchronizerOutcome>> {
        tokio::spawn(async move {
            let mut outcomes = Vec::new();
            while let Ok(job) = self.jobs.recv().await {
                outcomes.push(run_job(self.id, job, self.window).await);
            }
            debug!(worker = self.id, jobs = outcomes.len(), "🧵 worker clocked out");
            outcomes
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn run_job(worker: usize, job: Job, window: SyncWindow) -> SynchronizerOutcome {
    let name = job.synchronizer.name().to_string();
    let phase = job.phase;
    debug!(worker, synchronizer = %name, %phase, "🔧 job picked up");
    let started = Instant::now();
    let result = AssertUnwindSafe(job.synchronizer.synchronize(window))
        .catch_unwind()
        .await;
    let elapsed = started.elapsed();
    match result {
        Ok(Ok(())) => {
            info!(synchronizer = %name, %phase, elapsed_ms = elapsed.as_millis() as u64, "✅ synchronizer finished");
            SynchronizerOutcome::succeeded(name, phase, elapsed)
        }
        Ok(Err(err)) => {
            error!(synchronizer = %name, %phase, "💀 synchronizer failed: {err:#}");
            SynchronizerOutcome::failed(name, phase, elapsed, format!("{err:#}"))
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(synchronizer = %name, %phase, "💀 synchronizer panicked: {message}");
            SynchronizerOutcome::failed(name, phase, elapsed, format!("panicked: {message}"))
        }
    }
}

/// 🚧 Run every synchronizer of one phase on at most `pool_size` workers and wait for all of them.
pub(crate) async fn run_phase(
    pool_size: usize,
    phase: Phase,
    synchronizers: &[Arc<dyn Synchronizer>],
    window: SyncWindow,
) -> Vec<SynchronizerOutcome> {
    if synchronizers.is_empty() {
        return Vec::new();
    }
    let pool_size = pool_size.clamp(1, synchronizers.len());
    let (sender, receiver) = async_channel::bounded(pool_size);
    let workers: Vec<JoinHandle<Vec<SynchronizerOutcome>>> = (0..pool_size)
        .map(|id| {
            SynchronizerWorker {
                id,
                jobs: receiver.clone(),
                window,
            }
            .start()
        })
        .collect();
    drop(receiver);

    let mut outcomes = Vec::with_capacity(synchronizers.len());
    for synchronizer in synchronizers {
        let job = Job {
            phase,
            synchronizer: Arc::clone(synchronizer),
        };
        if let Err(closed) = sender.send(job).await {
            let job = closed.into_inner();
            outcomes.push(SynchronizerOutcome::failed(
                job.synchronizer.name(),
                phase,
                Default::default(),
                "no worker left to run it",
            ));
        }
    }
    sender.close();

    for worker in workers {
        match worker.await {
            Ok(done) => outcomes.extend(done),
            Err(err) => error!(%phase, "💀 a worker died outside its safety net: {err}"),
        }
    }
    outcomes.sort_by(|a, b| a.name.cmp(&b.name));
    outcomes
}
