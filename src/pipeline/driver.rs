//! Per-worker pipeline driver.
//!
//! Drives one unit through its remaining stages in order. Already-done
//! stages are skipped, which silently absorbs duplicate re-entry when a
//! partially processed unit is rediscovered and enqueued again. A stage
//! error is recorded against the unit in the shared diagnostics log and the
//! unit's remaining stages are skipped, but the engine keeps running: one
//! run reports errors across all units instead of aborting at the first one.

use tracing::info_span;

use crate::diagnostics::{Diagnostic, DiagnosticsSink};
use crate::pipeline::{CompilationUnit, PipelineEvent, Stage, StageContext, StageSet, SyncListener};
use crate::progress::ProgressTracker;
use crate::registry::{IsolatedSet, StateRegistry};

pub struct PipelineDriver<'a> {
    pub worker: usize,
    pub passes: &'a StageSet,
    pub registry: &'a StateRegistry,
    pub listener: &'a SyncListener,
    pub diagnostics: &'a dyn DiagnosticsSink,
    pub progress: &'a ProgressTracker,
}

impl PipelineDriver<'_> {
    /// Run every pending stage of `unit` in pipeline order, against this
    /// worker's isolated state bundle. Returns the nested units discovered
    /// by the passes; the caller enqueues them on the work queue.
    pub fn drive(&self, unit: &mut CompilationUnit, isolated: &mut IsolatedSet) -> Vec<CompilationUnit> {
        let was_terminal = unit.is_terminal();
        let mut discovered = Vec::new();

        for stage in Stage::ALL {
            if unit.has_failed() {
                break;
            }
            if unit.is_done(stage) {
                // Duplicate re-entry of a rediscovered unit. Expected, not an error.
                continue;
            }
            self.run_stage(unit, stage, isolated, &mut discovered);
        }

        if !was_terminal && unit.is_terminal() {
            self.progress.step();
            self.listener.notify(PipelineEvent::UnitFinished {
                unit: unit.name().to_string(),
                worker: self.worker,
            });
        }

        discovered
    }

    fn run_stage(
        &self,
        unit: &mut CompilationUnit,
        stage: Stage,
        isolated: &mut IsolatedSet,
        discovered: &mut Vec<CompilationUnit>,
    ) {
        let _span = info_span!(
            "pipeline.stage",
            stage = stage.name(),
            unit = unit.name(),
            worker = self.worker,
        )
        .entered();

        self.listener.notify(PipelineEvent::StageStarted {
            unit: unit.name().to_string(),
            stage,
            worker: self.worker,
        });

        let result = match self.passes.get(stage) {
            Some(pass) => {
                let mut ctx = StageContext::new(
                    stage,
                    self.worker,
                    unit.name().to_string(),
                    self.registry,
                    isolated,
                    self.diagnostics,
                );
                let result = pass.run(unit, &mut ctx);
                discovered.append(&mut ctx.take_discovered());
                result
            }
            None => Ok(()),
        };

        match result {
            Ok(()) => {
                unit.mark_done(stage);
                self.listener.notify(PipelineEvent::StageFinished {
                    unit: unit.name().to_string(),
                    stage,
                    worker: self.worker,
                });
            }
            Err(err) => {
                let message = format!("{err:#}");
                self.diagnostics
                    .report(Diagnostic::error(unit.name(), stage, message.clone()));
                unit.set_failed();
                self.listener.notify(PipelineEvent::UnitFailed {
                    unit: unit.name().to_string(),
                    stage,
                    worker: self.worker,
                    message,
                });
            }
        }
    }
}
