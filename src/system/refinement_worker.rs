//! Background refinement worker.
//!
//! Runs refinement passes off the pipeline thread in three phases:
//! collect under the read lock, solve with no lock held, apply under the
//! write lock. A registration that lands while a pass is solving bumps the
//! store revision, so the pass is either cancelled through the abort flag
//! or discarded as stale when it tries to apply.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::capability::BundleAdjuster;
use crate::error::RefineError;
use crate::optimizer::{ApplyOutcome, RefinementScheduler, RefinementScope, RefinementStats};

use super::shared_state::SharedState;

/// Pending passes. A full queue drops new requests.
const JOB_QUEUE_CAPACITY: usize = 4;

/// Poll interval for the shutdown flag.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

pub struct RefinementWorker {
    job_tx: Option<Sender<RefinementScope>>,
    handle: Option<JoinHandle<RefinementStats>>,
    shared: Arc<SharedState>,
}

impl RefinementWorker {
    pub fn spawn(
        shared: Arc<SharedState>,
        scheduler: RefinementScheduler,
        adjuster: Arc<dyn BundleAdjuster>,
        timeout: Duration,
    ) -> std::io::Result<Self> {
        let (job_tx, job_rx) = bounded::<RefinementScope>(JOB_QUEUE_CAPACITY);
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("refinement".into())
            .spawn(move || run(job_rx, worker_shared, scheduler, adjuster, timeout))?;

        Ok(Self {
            job_tx: Some(job_tx),
            handle: Some(handle),
            shared,
        })
    }

    /// Queue a pass. Returns false if the queue is full or the worker is gone.
    pub fn submit(&self, scope: RefinementScope) -> bool {
        let Some(tx) = &self.job_tx else {
            return false;
        };
        match tx.try_send(scope) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("[Refine-Worker] queue full, dropping {:?}", scope);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("[Refine-Worker] worker has exited");
                false
            }
        }
    }

    /// Let queued passes finish, stop the thread and return its counters.
    pub fn finish(&mut self) -> RefinementStats {
        self.job_tx.take();
        self.join()
    }

    fn join(&mut self) -> RefinementStats {
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(stats)) => stats,
            Some(Err(_)) => {
                warn!("[Refine-Worker] worker thread panicked");
                RefinementStats::default()
            }
            None => RefinementStats::default(),
        }
    }
}

impl Drop for RefinementWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shared.request_shutdown();
            self.job_tx.take();
            self.join();
        }
    }
}

fn run(
    job_rx: Receiver<RefinementScope>,
    shared: Arc<SharedState>,
    mut scheduler: RefinementScheduler,
    adjuster: Arc<dyn BundleAdjuster>,
    timeout: Duration,
) -> RefinementStats {
    loop {
        if shared.is_shutdown_requested() {
            break;
        }
        match job_rx.recv_timeout(RECV_TIMEOUT) {
            Ok(scope) => process(scope, &shared, &mut scheduler, &adjuster, timeout),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    scheduler.stats().clone()
}

fn process(
    scope: RefinementScope,
    shared: &Arc<SharedState>,
    scheduler: &mut RefinementScheduler,
    adjuster: &Arc<dyn BundleAdjuster>,
    timeout: Duration,
) {
    shared.clear_abort_refinement();

    // Phase 1: collect (read lock)
    let problem = {
        let graph = shared.graph.read();
        scheduler.collect(&graph, scope)
    };
    let Some(problem) = problem else {
        debug!("[Refine-Worker] nothing to refine for {:?}", scope);
        return;
    };
    if shared.should_abort_refinement() {
        // A registration arrived while collecting.
        scheduler.record_superseded(scope);
        return;
    }
    let problem = Arc::new(problem);

    // Phase 2: solve (no lock)
    let solution = match RefinementScheduler::solve(adjuster, &problem, timeout, Some(shared.abort_flag())) {
        Ok(solution) => solution,
        Err(RefineError::Cancelled) => {
            scheduler.record_superseded(scope);
            return;
        }
        Err(e) => {
            scheduler.record_failure(scope, &e);
            return;
        }
    };

    // Phase 3: apply (write lock)
    let outcome = {
        let mut graph = shared.graph.write();
        scheduler.apply(&mut graph, &problem, &solution)
    };
    if let ApplyOutcome::Applied { poses, points, .. } = outcome {
        info!(
            "[Refine-Worker] {:?}: iters={} error: {:.3} -> {:.3} px ({} poses, {} points)",
            scope, solution.iterations, solution.initial_rms, solution.final_rms, poses, points
        );
    }
}
