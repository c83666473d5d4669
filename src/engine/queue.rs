//! The work queue feeding units to idle workers.
//!
//! A blocking multi-producer/multi-consumer channel of compilation units,
//! plus in-flight accounting: every push (submission or mid-stage discovery)
//! raises the outstanding count and every finished unit lowers it, so
//! `wait_idle` can block until all submitted units, including units
//! transitively discovered during processing, have reached their terminal
//! stage.

use std::sync::{Condvar, Mutex};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, unbounded};

use super::EngineError;
use super::barrier::Rendezvous;
use crate::pipeline::CompilationUnit;

/// Control message delivered to a worker out of band from the work channel.
pub(crate) enum WorkerSignal {
    /// Rendezvous with the other workers before taking more work.
    Rendezvous(Arc<Rendezvous>),
    /// Exit the dequeue loop.
    Stop,
}

pub(crate) struct WorkQueue {
    tx: Sender<CompilationUnit>,
    rx: Receiver<CompilationUnit>,
    outstanding: Mutex<u64>,
    idle: Condvar,
}

impl WorkQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            outstanding: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    /// Enqueue a unit. Non-blocking; the outstanding count is raised before
    /// the unit becomes visible to workers so `wait_idle` can never miss it.
    pub fn push(&self, unit: CompilationUnit) -> Result<(), EngineError> {
        {
            let mut outstanding = self.outstanding.lock().unwrap_or_else(|e| e.into_inner());
            *outstanding += 1;
        }
        if self.tx.send(unit).is_err() {
            self.task_done();
            return Err(EngineError::ShuttingDown);
        }
        Ok(())
    }

    /// A receiver handle for one worker. All handles share the same queue.
    pub fn receiver(&self) -> Receiver<CompilationUnit> {
        self.rx.clone()
    }

    /// Mark one dequeued unit as terminal.
    pub fn task_done(&self) {
        let mut outstanding = self.outstanding.lock().unwrap_or_else(|e| e.into_inner());
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }

    /// Block until every pushed unit has been marked done.
    pub fn wait_idle(&self) {
        let mut outstanding = self.outstanding.lock().unwrap_or_else(|e| e.into_inner());
        while *outstanding > 0 {
            outstanding = self.idle.wait(outstanding).unwrap_or_else(|e| e.into_inner());
        }
    }
}
