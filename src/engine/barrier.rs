//! Rendezvous barrier for cooperative worker pauses.
//!
//! A pure synchronization object with no owner: the engine hands one out by
//! `Arc` to every worker required to rendezvous, plus itself. Crossing
//! blocks until all parties of the current generation have crossed, and the
//! generation counter makes the same object reusable for later rendezvous
//! rounds.

use std::sync::{Condvar, Mutex};

pub struct Rendezvous {
    state: Mutex<RendezvousState>,
    all_crossed: Condvar,
}

struct RendezvousState {
    required: usize,
    arrived: usize,
    generation: u64,
}

impl Rendezvous {
    pub fn new(required: usize) -> Self {
        Self {
            state: Mutex::new(RendezvousState {
                required,
                arrived: 0,
                generation: 0,
            }),
            all_crossed: Condvar::new(),
        }
    }

    /// Cross the rendezvous point. Returns once every required party has
    /// crossed; the last arrival releases everyone and resets the barrier
    /// for the next generation.
    pub fn cross(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.arrived += 1;
        if state.arrived >= state.required {
            state.arrived = 0;
            state.generation += 1;
            self.all_crossed.notify_all();
            return;
        }
        let generation = state.generation;
        while state.generation == generation {
            state = self.all_crossed.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn required(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.required
    }
}
