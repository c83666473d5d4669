//! stagehand: a concurrent multi-stage compilation engine.
//!
//! The engine parallelizes the compilation of many independent translation
//! units through a fixed, ordered pipeline of stages. Pipeline state is
//! classified up front: *shared* components (symbol tables, the diagnostics
//! log) exist once and are reached through synchronized accessors, while
//! *isolated* components (attribution scratch state) are duplicated per
//! worker and never observed across threads. Cooperative rendezvous points
//! let the host pause every worker at a controlled synchronization point so
//! phase-global invariants hold even with eager workers.
//!
//! The stage algorithms themselves are external collaborators: the host
//! supplies one [`StagePass`] per [`Stage`] and the factories for every
//! registry component; the engine only decides when and on which state
//! instance they run.

pub mod diagnostics;
pub mod engine;
pub mod helpers;
pub mod pipeline;
pub mod progress;
pub mod registry;

pub use diagnostics::{Diagnostic, DiagnosticsLog, DiagnosticsSink, Severity};
pub use engine::{CompileEngine, EngineConfig, EngineError};
pub use pipeline::{
    CompilationUnit, NoopListener, PipelineEvent, PipelineListener, Stage, StageContext, StagePass,
    StageSet, StageStatus, SyncListener,
};
pub use progress::{ProgressSnapshot, ProgressTracker, render};
pub use registry::{IsolatedSet, Ownership, RegistryError, StateRegistry};
