//! Admission control capping the number of simultaneously active operations
//! in one task category.
//!
//! The gate never blocks: callers either get a slot or are told no, and decide
//! themselves whether to queue, retry or reject. Admission is opportunistic,
//! so a steady stream of admissions can starve a particular caller; there is
//! no fairness or priority ordering.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Default)]
struct GateState {
    max_concurrent: usize,
    admitted: HashSet<String>,
}

/// Tracks admitted task ids rather than a bare counter, so a double release
/// or a release after a refused admission cannot skew the count.
pub struct ConcurrencyGate {
    name: String,
    state: Mutex<GateState>,
}

impl fmt::Debug for ConcurrencyGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConcurrencyGate")
            .field("name", &self.name)
            .field("max_concurrent", &state.max_concurrent)
            .field("active", &state.admitted.len())
            .finish()
    }
}

impl ConcurrencyGate {
    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(GateState {
                max_concurrent,
                admitted: HashSet::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admits `id` if a slot is free. An id that is already admitted is
    /// reported as admitted without taking a second slot.
    pub fn try_admit(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        if state.admitted.contains(id) {
            return true;
        }
        if state.admitted.len() >= state.max_concurrent {
            tracing::debug!(
                gate = %self.name,
                id,
                active = state.admitted.len(),
                "admission refused"
            );
            return false;
        }
        state.admitted.insert(id.to_string());
        true
    }

    /// Frees the slot held by `id`. Returns whether a slot was actually held.
    pub fn release(&self, id: &str) -> bool {
        self.state.lock().admitted.remove(id)
    }

    /// Like `try_admit`, but the slot is released when the permit drops.
    pub fn try_permit(self: &Arc<Self>, id: &str) -> Option<GatePermit> {
        if self.try_admit(id) {
            Some(GatePermit {
                gate: Arc::clone(self),
                id: id.to_string(),
            })
        } else {
            None
        }
    }

    /// Changing the limit never evicts admitted ids; a lower limit only
    /// refuses further admissions until enough slots are released.
    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        let mut state = self.state.lock();
        if state.max_concurrent != max_concurrent {
            tracing::debug!(
                gate = %self.name,
                from = state.max_concurrent,
                to = max_concurrent,
                "gate limit changed"
            );
        }
        state.max_concurrent = max_concurrent;
    }

    pub fn max_concurrent(&self) -> usize {
        self.state.lock().max_concurrent
    }

    pub fn active(&self) -> usize {
        self.state.lock().admitted.len()
    }

    pub fn available(&self) -> usize {
        let state = self.state.lock();
        state.max_concurrent.saturating_sub(state.admitted.len())
    }

    pub fn is_admitted(&self, id: &str) -> bool {
        self.state.lock().admitted.contains(id)
    }
}

/// A held gate slot, released on drop.
#[derive(Debug)]
pub struct GatePermit {
    gate: Arc<ConcurrencyGate>,
    id: String,
}

impl GatePermit {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.release(&self.id);
    }
}
