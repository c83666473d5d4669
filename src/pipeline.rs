//! Pipeline data model: stages, compilation units, passes and events.
//!
//! The engine does not know how to parse or attribute anything: the host
//! supplies one [`StagePass`] per [`Stage`]. What lives here is the ordered
//! stage enumeration, the per-unit completion vector that enforces stage
//! ordering and idempotent re-entry, and the serialized event sink workers
//! report lifecycle notifications through.

pub mod driver;

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use anyhow::Result;
use serde::Serialize;

use crate::diagnostics::{Diagnostic, DiagnosticsSink};
use crate::registry::{IsolatedSet, RegistryError, StateRegistry};

/// One ordered phase of the compilation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Parse,
    Enter,
    Attribute,
    Flow,
    Desugar,
    Generate,
}

impl Stage {
    pub const COUNT: usize = 6;

    /// Pipeline order. Stage `i + 1` for a unit never starts before stage
    /// `i` is marked done for that unit.
    pub const ALL: [Stage; Stage::COUNT] = [
        Stage::Parse,
        Stage::Enter,
        Stage::Attribute,
        Stage::Flow,
        Stage::Desugar,
        Stage::Generate,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Parse => "parse",
            Stage::Enter => "enter",
            Stage::Attribute => "attribute",
            Stage::Flow => "flow",
            Stage::Desugar => "desugar",
            Stage::Generate => "generate",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Pending,
    Done,
}

/// One translation unit tracked through the pipeline.
///
/// A unit owns an opaque payload the stage passes operate on and a per-stage
/// completion vector. It moves through the work queue by value, so at most
/// one worker holds (and mutates) it at any instant. Once the final stage
/// completes, or a stage error marks it failed, the unit is terminal and
/// dropped after its completion is accounted for.
pub struct CompilationUnit {
    name: String,
    payload: Box<dyn Any + Send>,
    completed: [StageStatus; Stage::COUNT],
    failed: bool,
}

impl CompilationUnit {
    pub fn new(name: impl Into<String>, payload: impl Any + Send) -> Self {
        Self {
            name: name.into(),
            payload: Box::new(payload),
            completed: [StageStatus::Pending; Stage::COUNT],
            failed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    pub fn payload_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.payload.downcast_mut::<T>()
    }

    pub fn is_done(&self, stage: Stage) -> bool {
        self.completed[stage.index()] == StageStatus::Done
    }

    /// Record a stage as completed. Public so hosts can submit units whose
    /// early stages were already run elsewhere (a nested unit discovered
    /// mid-attribution re-enters the pipeline with its parse already done).
    pub fn mark_done(&mut self, stage: Stage) {
        self.completed[stage.index()] = StageStatus::Done;
    }

    /// The next stage that still has to run, in pipeline order.
    pub fn next_pending(&self) -> Option<Stage> {
        Stage::ALL.into_iter().find(|stage| !self.is_done(*stage))
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    pub(crate) fn set_failed(&mut self) {
        self.failed = true;
    }

    /// A unit is terminal when every stage is done or a diagnostic was
    /// recorded and its remaining stages were skipped.
    pub fn is_terminal(&self) -> bool {
        self.failed || self.completed.iter().all(|status| *status == StageStatus::Done)
    }
}

impl fmt::Debug for CompilationUnit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CompilationUnit")
            .field("name", &self.name)
            .field("next_pending", &self.next_pending())
            .field("failed", &self.failed)
            .finish()
    }
}

/// A stage algorithm supplied by the host.
///
/// Passes read and mutate the unit's payload, reach isolated state directly
/// and shared state through synchronized registry accessors, and may discover
/// nested units which the engine re-enqueues rather than processing inline.
pub trait StagePass: Send + Sync {
    fn run(&self, unit: &mut CompilationUnit, ctx: &mut StageContext<'_>) -> Result<()>;
}

impl<F> StagePass for F
where
    F: Fn(&mut CompilationUnit, &mut StageContext<'_>) -> Result<()> + Send + Sync,
{
    fn run(&self, unit: &mut CompilationUnit, ctx: &mut StageContext<'_>) -> Result<()> {
        self(unit, ctx)
    }
}

/// The host's stage algorithms, one per pipeline stage. Stages without a
/// registered pass are marked done without doing any work.
#[derive(Clone, Default)]
pub struct StageSet {
    passes: AHashMap<Stage, Arc<dyn StagePass>>,
}

impl StageSet {
    pub fn new() -> Self {
        Self {
            passes: AHashMap::new(),
        }
    }

    pub fn set<P: StagePass + 'static>(mut self, stage: Stage, pass: P) -> Self {
        self.passes.insert(stage, Arc::new(pass));
        self
    }

    pub fn get(&self, stage: Stage) -> Option<&Arc<dyn StagePass>> {
        self.passes.get(&stage)
    }
}

/// What a stage pass sees while it runs: which stage and worker it is on,
/// the worker's isolated state, synchronized shared state, and a buffer for
/// units it discovers mid-stage.
pub struct StageContext<'a> {
    stage: Stage,
    worker: usize,
    unit_name: String,
    registry: &'a StateRegistry,
    isolated: &'a mut IsolatedSet,
    diagnostics: &'a dyn DiagnosticsSink,
    discovered: Vec<CompilationUnit>,
}

impl<'a> StageContext<'a> {
    pub(crate) fn new(
        stage: Stage,
        worker: usize,
        unit_name: String,
        registry: &'a StateRegistry,
        isolated: &'a mut IsolatedSet,
        diagnostics: &'a dyn DiagnosticsSink,
    ) -> Self {
        Self {
            stage,
            worker,
            unit_name,
            registry,
            isolated,
            diagnostics,
            discovered: Vec::new(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Shared state, through the registry's synchronized accessor.
    pub fn shared<T: Any + Send + Sync>(&self, key: &'static str) -> Result<Arc<T>, RegistryError> {
        self.registry.shared::<T>(key)
    }

    /// This worker's private instance of an isolated component.
    pub fn isolated<T: Any>(&self, key: &'static str) -> Result<&T, RegistryError> {
        self.isolated.get::<T>(key)
    }

    pub fn isolated_mut<T: Any>(&mut self, key: &'static str) -> Result<&mut T, RegistryError> {
        self.isolated.get_mut::<T>(key)
    }

    /// Hand a nested unit found mid-stage to the engine. It is enqueued on
    /// the work queue after the stage returns, never processed inline, so
    /// any idle worker can pick it up.
    pub fn discover(&mut self, unit: CompilationUnit) {
        self.discovered.push(unit);
    }

    /// Record a warning against the current unit without failing the stage.
    pub fn warn(&self, message: impl Into<String>) {
        self.diagnostics
            .report(Diagnostic::warning(self.unit_name.clone(), self.stage, message));
    }

    pub(crate) fn take_discovered(&mut self) -> Vec<CompilationUnit> {
        std::mem::take(&mut self.discovered)
    }
}

/// Pipeline lifecycle notifications originating from concurrent workers.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StageStarted { unit: String, stage: Stage, worker: usize },
    StageFinished { unit: String, stage: Stage, worker: usize },
    UnitFailed { unit: String, stage: Stage, worker: usize, message: String },
    UnitFinished { unit: String, worker: usize },
    RendezvousCrossed { worker: usize },
}

/// Receives pipeline events. Implementations do not have to be
/// concurrency-aware: the engine only ever calls a listener through
/// [`SyncListener`], which serializes events into a single total order.
pub trait PipelineListener: Send {
    fn notify(&mut self, event: &PipelineEvent);
}

/// Discards all events.
pub struct NoopListener;

impl PipelineListener for NoopListener {
    fn notify(&mut self, _event: &PipelineEvent) {}
}

/// Wraps an arbitrary listener with synchronized entry points so interleaved
/// worker events arrive in one total order, without the listener itself
/// being concurrency-aware.
pub struct SyncListener {
    inner: Mutex<Box<dyn PipelineListener>>,
}

impl SyncListener {
    pub fn new(listener: impl PipelineListener + 'static) -> Self {
        Self::from_boxed(Box::new(listener))
    }

    pub fn from_boxed(listener: Box<dyn PipelineListener>) -> Self {
        Self {
            inner: Mutex::new(listener),
        }
    }

    pub fn notify(&self, event: PipelineEvent) {
        emit_tracing_event(&event);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.notify(&event);
    }
}

/// Mirror events into tracing for observability; the listener is for the
/// host's UX, these are for timing and debugging.
fn emit_tracing_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::StageStarted { unit, stage, worker } => {
            tracing::trace!(unit = %unit, stage = %stage, worker = worker, "pipeline.stage_started");
        }
        PipelineEvent::StageFinished { unit, stage, worker } => {
            tracing::trace!(unit = %unit, stage = %stage, worker = worker, "pipeline.stage_finished");
        }
        PipelineEvent::UnitFailed {
            unit,
            stage,
            worker,
            message,
        } => {
            tracing::error!(unit = %unit, stage = %stage, worker = worker, message = %message, "pipeline.unit_failed");
        }
        PipelineEvent::UnitFinished { unit, worker } => {
            tracing::debug!(unit = %unit, worker = worker, "pipeline.unit_finished");
        }
        PipelineEvent::RendezvousCrossed { worker } => {
            tracing::debug!(worker = worker, "pipeline.rendezvous_crossed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_is_fixed() {
        let names: Vec<&str> = Stage::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["parse", "enter", "attribute", "flow", "desugar", "generate"]);
    }

    #[test]
    fn completion_vector_tracks_next_pending() {
        let mut unit = CompilationUnit::new("Main", ());
        assert_eq!(unit.next_pending(), Some(Stage::Parse));
        unit.mark_done(Stage::Parse);
        unit.mark_done(Stage::Enter);
        assert_eq!(unit.next_pending(), Some(Stage::Attribute));
        assert!(!unit.is_terminal());

        for stage in Stage::ALL {
            unit.mark_done(stage);
        }
        assert_eq!(unit.next_pending(), None);
        assert!(unit.is_terminal());
    }

    #[test]
    fn failed_unit_is_terminal() {
        let mut unit = CompilationUnit::new("Broken", ());
        unit.mark_done(Stage::Parse);
        unit.set_failed();
        assert!(unit.is_terminal());
        assert!(unit.has_failed());
    }

    #[test]
    fn payload_is_typed() {
        let mut unit = CompilationUnit::new("Main", String::from("fn main"));
        assert_eq!(unit.payload::<String>().unwrap(), "fn main");
        unit.payload_mut::<String>().unwrap().push_str(" {}");
        assert_eq!(unit.payload::<String>().unwrap(), "fn main {}");
        assert!(unit.payload::<u32>().is_none());
    }

    #[test]
    fn sync_listener_serializes_events() {
        struct Counting(Arc<Mutex<usize>>);
        impl PipelineListener for Counting {
            fn notify(&mut self, _event: &PipelineEvent) {
                *self.0.lock().unwrap() += 1;
            }
        }

        let seen = Arc::new(Mutex::new(0));
        let listener = Arc::new(SyncListener::new(Counting(seen.clone())));

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let listener = &listener;
                scope.spawn(move || {
                    for _ in 0..100 {
                        listener.notify(PipelineEvent::RendezvousCrossed { worker });
                    }
                });
            }
        });

        assert_eq!(*seen.lock().unwrap(), 800);
    }
}
