//! Deadlines, bounded retries and fan-out for capability calls.
//!
//! A call that overruns its deadline is abandoned: the worker thread is
//! detached and its late result dropped. The caller sees
//! [`CapabilityError::Timeout`] and carries on.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError};
use tracing::warn;

use crate::error::{CapabilityError, MatchError, RefineError};
use crate::map::KeyframeId;
use crate::tracking::FeatureSet;

use super::{CapabilityConfig, Correspondence, CorrespondenceProvider};

/// Errors that may succeed on retry.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for CapabilityError {
    fn is_transient(&self) -> bool {
        CapabilityError::is_transient(self)
    }
}

impl Retryable for MatchError {
    fn is_transient(&self) -> bool {
        matches!(self, MatchError::Capability(e) if e.is_transient())
    }
}

impl Retryable for RefineError {
    fn is_transient(&self) -> bool {
        matches!(self, RefineError::Capability(e) if e.is_transient())
    }
}

/// Run `job` on a worker thread and wait at most `timeout` for its result.
pub fn run_with_deadline<T, F>(timeout: Duration, job: F) -> Result<T, CapabilityError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = bounded(1);
    thread::Builder::new()
        .name("capability".into())
        .spawn(move || {
            // Receiver is gone after a timeout.
            let _ = tx.send(job());
        })
        .map_err(|e| CapabilityError::Unavailable(format!("failed to spawn worker: {e}")))?;

    match rx.recv_timeout(timeout) {
        Ok(value) => Ok(value),
        Err(RecvTimeoutError::Timeout) => Err(CapabilityError::Timeout(timeout)),
        Err(RecvTimeoutError::Disconnected) => Err(CapabilityError::Disconnected),
    }
}

/// Call `f` until it succeeds, fails permanently, or `max_retries` retries are spent.
///
/// `f` receives the attempt number, starting at 0.
pub fn with_retries<T, E, F>(max_retries: usize, label: &str, mut f: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut(usize) -> Result<T, E>,
{
    let mut attempt = 0;
    loop {
        match f(attempt) {
            Err(e) if e.is_transient() && attempt < max_retries => {
                warn!("[Capability] {} attempt {} failed: {}, retrying", label, attempt + 1, e);
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Correspondences between a query keyframe and one window member.
#[derive(Debug, Clone)]
pub struct WindowMatch {
    pub target: KeyframeId,
    pub result: Result<Vec<Correspondence>, MatchError>,
}

/// One correspondence request under a deadline.
pub fn match_pair(
    provider: &Arc<dyn CorrespondenceProvider>,
    query: &Arc<FeatureSet>,
    target: &Arc<FeatureSet>,
    timeout: Duration,
) -> Result<Vec<Correspondence>, MatchError> {
    let provider = Arc::clone(provider);
    let query = Arc::clone(query);
    let target = Arc::clone(target);
    run_with_deadline(timeout, move || provider.match_features(&query, &target))?
}

/// Match `query` against every target, `config.workers` requests at a time.
///
/// Results come back in target order. Requests that time out or hit a
/// transient failure are retried one by one afterwards.
pub fn match_window(
    provider: &Arc<dyn CorrespondenceProvider>,
    query: &Arc<FeatureSet>,
    targets: &[(KeyframeId, Arc<FeatureSet>)],
    config: &CapabilityConfig,
) -> Vec<WindowMatch> {
    let timeout = config.match_timeout();
    let mut results: Vec<WindowMatch> = Vec::with_capacity(targets.len());

    for batch in targets.chunks(config.workers.max(1)) {
        let (tx, rx) = bounded(batch.len());
        for (slot, (_, features)) in batch.iter().enumerate() {
            let tx = tx.clone();
            let provider = Arc::clone(provider);
            let query = Arc::clone(query);
            let features = Arc::clone(features);
            let spawned = thread::Builder::new().name("matcher".into()).spawn(move || {
                let _ = tx.send((slot, provider.match_features(&query, &features)));
            });
            if let Err(e) = spawned {
                warn!("[Capability] failed to spawn matcher worker: {}", e);
            }
        }
        drop(tx);

        let mut batch_results: Vec<Option<Result<Vec<Correspondence>, MatchError>>> =
            (0..batch.len()).map(|_| None).collect();
        let deadline = Instant::now() + timeout;
        let mut received = 0;
        while received < batch.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((slot, result)) => {
                    batch_results[slot] = Some(result);
                    received += 1;
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!("[Capability] {} match request(s) exceeded {:?}", batch.len() - received, timeout);
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        for ((target, _), result) in batch.iter().zip(batch_results) {
            results.push(WindowMatch {
                target: *target,
                result: result.unwrap_or(Err(MatchError::Capability(CapabilityError::Timeout(timeout)))),
            });
        }
    }

    for (window_match, (_, features)) in results.iter_mut().zip(targets) {
        let needs_retry = matches!(&window_match.result, Err(e) if e.is_transient());
        if needs_retry && config.max_retries > 0 {
            let label = format!("match with {}", window_match.target);
            window_match.result = with_retries(config.max_retries - 1, &label, |_| {
                match_pair(provider, query, features, timeout)
            });
        }
    }

    results
}
