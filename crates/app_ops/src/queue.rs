//! Admission control for concurrent copy/move operations
//!
//! Process-wide list of running operations. An operation marked
//! "start on idle" is parked as auto-paused while anything else runs;
//! when the last running operation ends, exactly the oldest auto-paused
//! entry is resumed. The queue only flips gates and bookkeeping under
//! its mutex; the actual suspension happens in the worker.

use crate::gate::Gate;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type OperationId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseState {
    Running,
    /// Parked by the queue; only the queue moves an entry out of this
    AutoPaused,
    /// Parked by the user; never auto-resumed
    ManuallyPaused,
}

struct Entry {
    id: OperationId,
    state: PauseState,
    gate: Arc<Gate>,
}

pub struct OperationsQueue {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

static GLOBAL_QUEUE: Lazy<Arc<OperationsQueue>> = Lazy::new(|| Arc::new(OperationsQueue::new()));

impl OperationsQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The process-wide queue of disk copy/move operations
    pub fn global() -> Arc<OperationsQueue> {
        GLOBAL_QUEUE.clone()
    }

    /// Admit an operation; returns its id and whether it must start
    /// paused. The decision is immediate, the queue never blocks.
    pub fn add(&self, gate: Arc<Gate>, start_on_idle: bool) -> (OperationId, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock();
        let busy = entries.iter().any(|e| e.state == PauseState::Running);
        let start_paused = start_on_idle && busy;
        if start_paused {
            gate.close();
        }
        entries.push(Entry {
            id,
            state: if start_paused {
                PauseState::AutoPaused
            } else {
                PauseState::Running
            },
            gate,
        });
        (id, start_paused)
    }

    /// Remove a finished operation; unless `do_not_resume`, resume the
    /// oldest auto-paused entry when nothing is left running
    pub fn operation_ended(&self, id: OperationId, do_not_resume: bool) -> Option<OperationId> {
        let mut entries = self.entries.lock();
        entries.retain(|e| e.id != id);
        if do_not_resume || entries.is_empty() {
            return None;
        }
        if entries.iter().any(|e| e.state == PauseState::Running) {
            // Never preempt or double-start while something runs
            return None;
        }
        let entry = entries
            .iter_mut()
            .find(|e| e.state == PauseState::AutoPaused)?;
        entry.state = PauseState::Running;
        entry.gate.open();
        tracing::debug!("queue resumed operation {}", entry.id);
        Some(entry.id)
    }

    /// Record a user pause/resume and flip the worker's gate
    pub fn set_paused(&self, id: OperationId, state: PauseState) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            entry.state = state;
            match state {
                PauseState::Running => entry.gate.open(),
                PauseState::AutoPaused | PauseState::ManuallyPaused => entry.gate.close(),
            }
        }
    }

    /// "Wait for others": move the entry to the back and park it
    pub fn auto_pause(&self, id: OperationId) {
        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().position(|e| e.id == id) {
            let mut entry = entries.remove(pos);
            entry.state = PauseState::AutoPaused;
            entry.gate.close();
            entries.push(entry);
        }
    }

    pub fn state_of(&self, id: OperationId) -> Option<PauseState> {
        self.entries.lock().iter().find(|e| e.id == id).map(|e| e.state)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for OperationsQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> Arc<Gate> {
        Arc::new(Gate::new(true))
    }

    #[test]
    fn test_empty_queue_starts_running() {
        let queue = OperationsQueue::new();
        let g = gate();
        let (id, paused) = queue.add(g.clone(), true);
        assert!(!paused);
        assert!(g.is_open());
        assert_eq!(queue.state_of(id), Some(PauseState::Running));
    }

    #[test]
    fn test_concurrent_start_without_idle_flag() {
        let queue = OperationsQueue::new();
        let (_, p1) = queue.add(gate(), false);
        let (_, p2) = queue.add(gate(), false);
        let (_, p3) = queue.add(gate(), false);
        assert!(!p1 && !p2 && !p3);
    }

    #[test]
    fn test_start_on_idle_parks_behind_running() {
        let queue = OperationsQueue::new();
        let g1 = gate();
        let g2 = gate();
        let (id1, p1) = queue.add(g1, false);
        let (id2, p2) = queue.add(g2.clone(), true);
        assert!(!p1);
        assert!(p2);
        assert!(!g2.is_open());

        // First one ends: exactly the parked entry resumes
        let resumed = queue.operation_ended(id1, false);
        assert_eq!(resumed, Some(id2));
        assert!(g2.is_open());
        assert_eq!(queue.state_of(id2), Some(PauseState::Running));
    }

    #[test]
    fn test_at_most_one_idle_entry_runs() {
        let queue = OperationsQueue::new();
        let gates: Vec<_> = (0..4).map(|_| gate()).collect();
        let (first, _) = queue.add(gates[0].clone(), true);
        let ids: Vec<_> = gates[1..]
            .iter()
            .map(|g| queue.add(g.clone(), true).0)
            .collect();

        // Only the first runs; the rest are parked
        let running = |q: &OperationsQueue| {
            let mut n = 0;
            for id in std::iter::once(first).chain(ids.iter().copied()) {
                if q.state_of(id) == Some(PauseState::Running) {
                    n += 1;
                }
            }
            n
        };
        assert_eq!(running(&queue), 1);

        // Each completion hands off to exactly one successor, in order
        let resumed = queue.operation_ended(first, false);
        assert_eq!(resumed, Some(ids[0]));
        assert_eq!(running(&queue), 1);

        let resumed = queue.operation_ended(ids[0], false);
        assert_eq!(resumed, Some(ids[1]));
        assert_eq!(running(&queue), 1);
    }

    #[test]
    fn test_no_resume_while_something_runs() {
        let queue = OperationsQueue::new();
        let (id1, _) = queue.add(gate(), false);
        let (_id2, _) = queue.add(gate(), false);
        let g3 = gate();
        let (id3, p3) = queue.add(g3.clone(), true);
        assert!(p3);

        // id1 ends but id2 still runs: the parked entry stays parked
        assert_eq!(queue.operation_ended(id1, false), None);
        assert_eq!(queue.state_of(id3), Some(PauseState::AutoPaused));
        assert!(!g3.is_open());
    }

    #[test]
    fn test_manual_pause_is_never_auto_resumed() {
        let queue = OperationsQueue::new();
        let (id1, _) = queue.add(gate(), false);
        let g2 = gate();
        let (id2, _) = queue.add(g2.clone(), false);
        queue.set_paused(id2, PauseState::ManuallyPaused);
        assert!(!g2.is_open());

        assert_eq!(queue.operation_ended(id1, false), None);
        assert_eq!(queue.state_of(id2), Some(PauseState::ManuallyPaused));
    }

    #[test]
    fn test_auto_pause_moves_to_back() {
        let queue = OperationsQueue::new();
        let (id1, _) = queue.add(gate(), false);
        let (id2, _) = queue.add(gate(), false);
        let (id3, _) = queue.add(gate(), true);
        assert_eq!(queue.state_of(id3), Some(PauseState::AutoPaused));

        // "Wait for others" on the first operation
        queue.auto_pause(id1);
        assert_eq!(queue.state_of(id1), Some(PauseState::AutoPaused));

        // id2 ends; id3 was queued before id1 moved back, so it wins
        assert_eq!(queue.operation_ended(id2, false), Some(id3));
    }

    #[test]
    fn test_do_not_resume() {
        let queue = OperationsQueue::new();
        let (id1, _) = queue.add(gate(), false);
        let g2 = gate();
        let (id2, _) = queue.add(g2.clone(), true);
        assert_eq!(queue.operation_ended(id1, true), None);
        assert_eq!(queue.state_of(id2), Some(PauseState::AutoPaused));
        assert!(!g2.is_open());
    }
}
