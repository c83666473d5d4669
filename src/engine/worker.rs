//! Worker threads.
//!
//! One worker exists per configured parallelism degree, created once and
//! reused for the engine's lifetime; no per-unit thread spawning. A worker
//! starts by building its private isolated-state bundle from the registry
//! templates, signals readiness, then loops on a two-case select: take a
//! unit from the work queue and drive it, or handle a control signal. A
//! rendezvous signal is crossed cooperatively before the loop resumes; a
//! stop signal (or a drained, closed queue) ends the loop.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded, select, unbounded};

use super::EngineError;
use super::queue::{WorkQueue, WorkerSignal};
use crate::diagnostics::DiagnosticsSink;
use crate::pipeline::driver::PipelineDriver;
use crate::pipeline::{PipelineEvent, StageSet, SyncListener};
use crate::progress::ProgressTracker;
use crate::registry::StateRegistry;

/// Everything the worker loop reads; shared by all workers.
pub(crate) struct WorkerShared {
    pub registry: Arc<StateRegistry>,
    pub passes: StageSet,
    pub listener: Arc<SyncListener>,
    pub diagnostics: Arc<dyn DiagnosticsSink>,
    pub progress: Arc<ProgressTracker>,
    pub queue: Arc<WorkQueue>,
}

pub(crate) struct WorkerHandle {
    signal_tx: Sender<WorkerSignal>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn signal(&self, signal: WorkerSignal) {
        let _ = self.signal_tx.send(signal);
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn one worker. The returned receiver fires once the worker has built
/// its isolated state and entered the dequeue loop; the engine waits on it
/// before accepting work that depends on this worker.
pub(crate) fn spawn(
    index: usize,
    shared: Arc<WorkerShared>,
) -> Result<(WorkerHandle, Receiver<()>), EngineError> {
    let (signal_tx, signal_rx) = unbounded();
    let (ready_tx, ready_rx) = bounded(1);
    let work_rx = shared.queue.receiver();

    let join = thread::Builder::new()
        .name(format!("stagehand-worker-{index}"))
        .spawn(move || run(index, shared, work_rx, signal_rx, ready_tx))
        .map_err(EngineError::WorkerSpawn)?;

    Ok((
        WorkerHandle {
            signal_tx,
            join: Some(join),
        },
        ready_rx,
    ))
}

fn run(
    index: usize,
    shared: Arc<WorkerShared>,
    work_rx: Receiver<crate::pipeline::CompilationUnit>,
    signal_rx: Receiver<WorkerSignal>,
    ready_tx: Sender<()>,
) {
    let _span = tracing::info_span!("engine.worker", worker = index).entered();

    // Starting: copy isolated state from the registry templates, exactly
    // once for this worker's lifetime.
    let mut isolated = shared.registry.build_isolated_set();
    let _ = ready_tx.send(());
    tracing::debug!(worker = index, "worker ready");

    let driver = PipelineDriver {
        worker: index,
        passes: &shared.passes,
        registry: &shared.registry,
        listener: &shared.listener,
        diagnostics: shared.diagnostics.as_ref(),
        progress: &shared.progress,
    };

    loop {
        // Control signals take priority over queued work, so a requested
        // rendezvous is never starved by a deep queue.
        match signal_rx.try_recv() {
            Ok(WorkerSignal::Rendezvous(rendezvous)) => {
                shared.listener.notify(PipelineEvent::RendezvousCrossed { worker: index });
                rendezvous.cross();
                continue;
            }
            Ok(WorkerSignal::Stop) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        select! {
            recv(work_rx) -> msg => match msg {
                Ok(mut unit) => {
                    let discovered = driver.drive(&mut unit, &mut isolated);
                    for nested in discovered {
                        shared.progress.add_total(1);
                        if shared.queue.push(nested).is_err() {
                            tracing::error!(worker = index, "work queue closed while enqueueing a discovered unit");
                        }
                    }
                    shared.queue.task_done();
                }
                // Queue observed shutdown and drained.
                Err(_) => break,
            },
            recv(signal_rx) -> msg => match msg {
                Ok(WorkerSignal::Rendezvous(rendezvous)) => {
                    shared.listener.notify(PipelineEvent::RendezvousCrossed { worker: index });
                    rendezvous.cross();
                }
                Ok(WorkerSignal::Stop) | Err(_) => break,
            },
        }
    }

    tracing::debug!(worker = index, "worker stopped");
}
