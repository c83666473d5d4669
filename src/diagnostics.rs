//! Shared diagnostics log.
//!
//! Stage errors never abort the run: they are recorded here against the
//! failing unit and the engine keeps going so one run reports errors across
//! all units. The sink is the one shared component every worker writes to,
//! which is why it is internally synchronized rather than handed out through
//! the state registry.

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use ahash::AHashMap;
use anyhow::Result;
use serde::Serialize;

use crate::pipeline::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// One recorded error or warning, keyed by the unit it was raised against.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub unit: String,
    pub stage: Stage,
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    pub fn error(unit: impl Into<String>, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            stage,
            severity: Severity::Error,
            message: message.into(),
        }
    }

    pub fn warning(unit: impl Into<String>, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            stage,
            severity: Severity::Warning,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let severity = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{severity}[{}/{}]: {}", self.unit, self.stage, self.message)
    }
}

/// Where workers record per-unit stage errors and warnings. Implementations
/// must be safe to call from every worker concurrently.
pub trait DiagnosticsSink: Send + Sync {
    fn report(&self, diagnostic: Diagnostic);
    fn error_count(&self) -> usize;
    fn warning_count(&self) -> usize;
}

/// In-memory diagnostics log keyed by unit name.
pub struct DiagnosticsLog {
    by_unit: Mutex<AHashMap<String, Vec<Diagnostic>>>,
    errors: AtomicUsize,
    warnings: AtomicUsize,
}

impl DiagnosticsLog {
    pub fn new() -> Self {
        Self {
            by_unit: Mutex::new(AHashMap::new()),
            errors: AtomicUsize::new(0),
            warnings: AtomicUsize::new(0),
        }
    }

    /// All diagnostics recorded against one unit, in report order.
    pub fn for_unit(&self, unit: &str) -> Vec<Diagnostic> {
        let by_unit = self.by_unit.lock().unwrap_or_else(|e| e.into_inner());
        by_unit.get(unit).cloned().unwrap_or_default()
    }

    pub fn all(&self) -> Vec<Diagnostic> {
        let by_unit = self.by_unit.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<Diagnostic> = by_unit.values().flatten().cloned().collect();
        all.sort_by(|a, b| a.unit.cmp(&b.unit));
        all
    }

    /// Machine-readable report for host tooling.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.all())?)
    }
}

impl DiagnosticsSink for DiagnosticsLog {
    fn report(&self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Error => self.errors.fetch_add(1, Ordering::SeqCst),
            Severity::Warning => self.warnings.fetch_add(1, Ordering::SeqCst),
        };
        let mut by_unit = self.by_unit.lock().unwrap_or_else(|e| e.into_inner());
        by_unit.entry(diagnostic.unit.clone()).or_default().push(diagnostic);
    }

    fn error_count(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }

    fn warning_count(&self) -> usize {
        self.warnings.load(Ordering::SeqCst)
    }
}

impl Default for DiagnosticsLog {
    fn default() -> Self {
        Self::new()
    }
}
