//! Shared state between the pipeline and the refinement worker.
//!
//! The pose graph sits behind a single `RwLock`: the pipeline is the only
//! writer during registration, the worker reads while collecting a
//! refinement problem and writes only to apply a solution.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::map::PoseGraph;

pub struct SharedState {
    pub graph: RwLock<PoseGraph>,

    /// Set by a registration to cancel an in-flight refinement solve.
    abort_refinement: Arc<AtomicBool>,

    shutdown_requested: AtomicBool,
}

impl SharedState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_graph(PoseGraph::new()))
    }

    pub fn with_graph(graph: PoseGraph) -> Self {
        Self {
            graph: RwLock::new(graph),
            abort_refinement: Arc::new(AtomicBool::new(false)),
            shutdown_requested: AtomicBool::new(false),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Refinement abort
    // ─────────────────────────────────────────────────────────────────────────

    /// Flag polled by a running solver.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort_refinement)
    }

    pub fn should_abort_refinement(&self) -> bool {
        self.abort_refinement.load(Ordering::SeqCst)
    }

    pub fn request_abort_refinement(&self) {
        self.abort_refinement.store(true, Ordering::SeqCst);
    }

    pub fn clear_abort_refinement(&self) {
        self.abort_refinement.store(false, Ordering::SeqCst);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Shutdown
    // ─────────────────────────────────────────────────────────────────────────

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.request_abort_refinement();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::with_graph(PoseGraph::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_flag_is_shared() {
        let shared = SharedState::new();
        let flag = shared.abort_flag();
        assert!(!flag.load(Ordering::SeqCst));

        shared.request_abort_refinement();
        assert!(flag.load(Ordering::SeqCst));
        assert!(shared.should_abort_refinement());

        shared.clear_abort_refinement();
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_shutdown_also_aborts() {
        let shared = SharedState::new();
        shared.request_shutdown();
        assert!(shared.is_shutdown_requested());
        assert!(shared.should_abort_refinement());
    }
}
