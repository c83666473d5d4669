//! The compilation engine: a fixed pool of workers draining a shared queue.
//!
//! The host registers pipeline state in a [`StateRegistry`], supplies one
//! pass per stage, and submits compilation units. Workers drive each unit
//! through its pending stages; units discovered mid-stage re-enter the
//! queue; stage errors become diagnostics instead of aborting the run. The
//! host can pause every worker at a rendezvous point between units when a
//! phase-global invariant requires it.

pub mod barrier;
pub mod queue;
pub mod worker;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::diagnostics::{DiagnosticsLog, DiagnosticsSink};
use crate::pipeline::{CompilationUnit, NoopListener, PipelineListener, StageSet, SyncListener};
use crate::progress::{ProgressSnapshot, ProgressTracker};
use crate::registry::{RegistryError, StateRegistry};

use self::barrier::Rendezvous;
use self::queue::{WorkQueue, WorkerSignal};
use self::worker::{WorkerHandle, WorkerShared};

#[derive(Debug)]
pub enum EngineError {
    /// The engine is shutting down; no further units are accepted.
    ShuttingDown,
    /// Mis-wired engine configuration. Fatal.
    Registry(RegistryError),
    /// A worker thread could not be spawned.
    WorkerSpawn(io::Error),
    /// A worker died before signalling readiness.
    WorkerPanicked(usize),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EngineError::ShuttingDown => {
                write!(f, "engine is shutting down and no longer accepts units")
            }
            EngineError::Registry(err) => write!(f, "{err}"),
            EngineError::WorkerSpawn(err) => write!(f, "failed to spawn worker thread: {err}"),
            EngineError::WorkerPanicked(index) => {
                write!(f, "worker {index} exited before becoming ready")
            }
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Registry(err) => Some(err),
            EngineError::WorkerSpawn(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RegistryError> for EngineError {
    fn from(err: RegistryError) -> Self {
        EngineError::Registry(err)
    }
}

/// Engine construction parameters.
pub struct EngineConfig {
    /// Number of worker threads; 0 means one per available CPU.
    pub worker_count: usize,
    /// Receives serialized pipeline lifecycle events.
    pub listener: Box<dyn PipelineListener>,
    /// Where stage errors and warnings are recorded.
    pub diagnostics: Arc<dyn DiagnosticsSink>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 0,
            listener: Box::new(NoopListener),
            diagnostics: Arc::new(DiagnosticsLog::new()),
        }
    }
}

pub struct CompileEngine {
    queue: Arc<WorkQueue>,
    progress: Arc<ProgressTracker>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    workers: Vec<WorkerHandle>,
    shutting_down: AtomicBool,
}

impl CompileEngine {
    /// Build the engine and start its workers. Returns once every worker has
    /// constructed its isolated state and entered the dequeue loop, so
    /// submitted work never races worker initialization. The registry is
    /// frozen here: classifications are fixed for the engine's lifetime.
    pub fn new(
        config: EngineConfig,
        registry: StateRegistry,
        passes: StageSet,
    ) -> Result<Self, EngineError> {
        registry.freeze();

        let worker_count = if config.worker_count == 0 {
            num_cpus::get()
        } else {
            config.worker_count
        };

        let queue = Arc::new(WorkQueue::new());
        let progress = Arc::new(ProgressTracker::new());
        let shared = Arc::new(WorkerShared {
            registry: Arc::new(registry),
            passes,
            listener: Arc::new(SyncListener::from_boxed(config.listener)),
            diagnostics: config.diagnostics.clone(),
            progress: progress.clone(),
            queue: queue.clone(),
        });

        let mut engine = Self {
            queue,
            progress,
            diagnostics: config.diagnostics,
            workers: Vec::with_capacity(worker_count),
            shutting_down: AtomicBool::new(false),
        };

        let mut ready = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            match worker::spawn(index, shared.clone()) {
                Ok((handle, ready_rx)) => {
                    engine.workers.push(handle);
                    ready.push(ready_rx);
                }
                Err(err) => {
                    engine.stop_workers();
                    return Err(err);
                }
            }
        }

        for (index, ready_rx) in ready.iter().enumerate() {
            if ready_rx.recv().is_err() {
                engine.stop_workers();
                return Err(EngineError::WorkerPanicked(index));
            }
        }

        tracing::debug!(workers = worker_count, "engine started");
        Ok(engine)
    }

    /// Enqueue a compilation unit. Non-blocking.
    pub fn submit(&self, unit: CompilationUnit) -> Result<(), EngineError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        self.progress.add_total(1);
        self.queue.push(unit)
    }

    /// Signal that no further units will be submitted. Queued units and
    /// units still being discovered drain normally.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        tracing::debug!("engine shutdown requested");
    }

    /// Block until every submitted unit, including units transitively
    /// discovered during processing, has reached its terminal stage or
    /// recorded a diagnostic.
    pub fn await_completion(&self) {
        self.queue.wait_idle();
    }

    /// Pause point: every worker must rendezvous before taking more pipeline
    /// work. Returns once all workers (and this caller) have crossed. Used
    /// when no unit may enter stage `k + 1` until all workers finished stage
    /// `k` for everything queued so far.
    pub fn rendezvous(&self) {
        if self.workers.is_empty() {
            return;
        }
        self.progress.set_paused(true);
        let rendezvous = Arc::new(Rendezvous::new(self.workers.len() + 1));
        for worker in &self.workers {
            worker.signal(WorkerSignal::Rendezvous(rendezvous.clone()));
        }
        rendezvous.cross();
        self.progress.set_paused(false);
        tracing::debug!(workers = self.workers.len(), "rendezvous complete");
    }

    /// Aggregate error count across all units, from the shared diagnostics sink.
    pub fn error_count(&self) -> usize {
        self.diagnostics.error_count()
    }

    pub fn warning_count(&self) -> usize {
        self.diagnostics.warning_count()
    }

    pub fn diagnostics(&self) -> &Arc<dyn DiagnosticsSink> {
        &self.diagnostics
    }

    /// Point-in-time progress for an external renderer.
    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn stop_workers(&mut self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        for worker in &self.workers {
            worker.signal(WorkerSignal::Stop);
        }
        for worker in &mut self.workers {
            worker.join();
        }
        self.workers.clear();
    }
}

impl Drop for CompileEngine {
    fn drop(&mut self) {
        self.stop_workers();
    }
}
