//! Pipeline - drives frames through selection, registration and refinement.
//!
//! Per frame:
//! 1. Extract features
//! 2. Estimate displacement against the last keyframe and ask the selector
//! 3. Admitted keyframes bootstrap the store (first pair) or register
//!    against the window
//! 4. Each registration schedules a local pass and, every K registrations,
//!    a global pass
//!
//! Keyframes that fail to register stay in the store unregistered and are
//! retried after the next success. The run always ends with a
//! [`PipelineStatus`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLockReadGuard;
use tracing::{debug, error, info, warn};

use crate::calibration::{Calibration, ControlPoint, DistanceConstraint, ScaleCalibrator};
use crate::capability::{
    match_pair, match_window, with_retries, BundleAdjuster, Correspondence, CorrespondenceProvider, FeatureExtractor,
    FrameSource,
};
use crate::config::PipelineConfig;
use crate::error::{CalibrationError, CapabilityError, MatchError, RefineError, RegistrationError};
use crate::geometry::Sim3;
use crate::io::Exporter;
use crate::map::{KeyframeId, PoseGraph};
use crate::mapping::{PendingKeyframe, RegistrationOutcome, Registrator};
use crate::optimizer::{ApplyOutcome, LmBundleAdjuster, RefinementScheduler, RefinementScope, RefinementStats};
use crate::tracking::{
    Displacement, FeatureSet, Frame, Keyframe, KeyframeDecision, KeyframeSelector, RegistrationTracker, TrackingState,
};

use super::refinement_worker::RefinementWorker;
use super::report::{FailureReason, PipelineCounters, PipelineReport, PipelineStatus};
use super::shared_state::SharedState;

/// A keyframe waiting in the store for another registration attempt.
#[derive(Debug, Clone, Copy)]
struct RetryEntry {
    kf_id: KeyframeId,
    attempts: usize,
}

/// State of one [`Pipeline::run`].
struct RunState {
    selector: KeyframeSelector,
    tracker: RegistrationTracker,
    counters: PipelineCounters,
    /// Features of the last admitted keyframe.
    last_keyframe: Option<Arc<FeatureSet>>,
    bootstrapped: bool,
    /// First keyframe, waiting for a bootstrap partner.
    seed: Option<PendingKeyframe>,
    /// Candidates that failed to bootstrap with the seed.
    deferred: Vec<PendingKeyframe>,
    retry_queue: VecDeque<RetryEntry>,
    failure: Option<FailureReason>,
    worker: Option<RefinementWorker>,
}

pub struct Pipeline {
    config: PipelineConfig,
    extractor: Arc<dyn FeatureExtractor>,
    matcher: Arc<dyn CorrespondenceProvider>,
    adjuster: Arc<dyn BundleAdjuster>,
    shared: Arc<SharedState>,
    registrator: Registrator,
    scheduler: RefinementScheduler,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        extractor: Arc<dyn FeatureExtractor>,
        matcher: Arc<dyn CorrespondenceProvider>,
        adjuster: Arc<dyn BundleAdjuster>,
    ) -> Self {
        let registrator = Registrator::new(config.registration.clone());
        let scheduler = Self::make_scheduler(&config);
        Self {
            config,
            extractor,
            matcher,
            adjuster,
            shared: SharedState::new(),
            registrator,
            scheduler,
        }
    }

    /// Pipeline with the configured descriptor matcher and the built-in adjuster.
    pub fn with_builtin_capabilities(config: PipelineConfig, extractor: Arc<dyn FeatureExtractor>) -> Self {
        let matcher: Arc<dyn CorrespondenceProvider> = Arc::new(config.matcher.build());
        let adjuster: Arc<dyn BundleAdjuster> = Arc::new(LmBundleAdjuster::new(config.refinement.lm_config()));
        Self::new(config, extractor, matcher, adjuster)
    }

    fn make_scheduler(config: &PipelineConfig) -> RefinementScheduler {
        RefinementScheduler::new(
            config.refinement.clone(),
            config.registration.triangulation.min_parallax_deg,
        )
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Read access to the store.
    pub fn graph(&self) -> RwLockReadGuard<'_, PoseGraph> {
        self.shared.graph.read()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Run
    // ─────────────────────────────────────────────────────────────────────────

    /// Process every frame of `source` and report how the run ended.
    ///
    /// The store is cleared first, so a pipeline can be run more than once.
    pub fn run(&mut self, source: &dyn FrameSource) -> PipelineReport {
        let start = Instant::now();
        self.shared.graph.write().clear();
        self.shared.clear_abort_refinement();
        self.scheduler = Self::make_scheduler(&self.config);

        let mut run = RunState {
            selector: KeyframeSelector::new(self.config.selector.clone()),
            tracker: RegistrationTracker::new(self.config.registration.max_consecutive_failures),
            counters: PipelineCounters::default(),
            last_keyframe: None,
            bootstrapped: false,
            seed: None,
            deferred: Vec::new(),
            retry_queue: VecDeque::new(),
            failure: None,
            worker: self.spawn_worker(),
        };

        info!(
            "[Pipeline] {} frames (skip {}, limit {:?}), matcher {}",
            source.len(),
            self.config.frame_skip,
            self.config.max_frames,
            self.matcher.name()
        );

        let step = self.config.frame_skip.max(1);
        let limit = self.config.max_frames.unwrap_or(usize::MAX);
        for position in (0..source.len()).step_by(step).take(limit) {
            let Some(frame) = source.frame(position) else {
                warn!("[Pipeline] frame source ended early at position {}", position);
                break;
            };
            run.counters.frames_seen += 1;
            self.process_frame(&mut run, frame);
            if run.failure.is_some() {
                break;
            }
        }

        let mut refinement = RefinementStats::default();
        if let Some(mut worker) = run.worker.take() {
            refinement.merge(&worker.finish());
        }

        if run.bootstrapped && run.failure.is_none() && self.config.refinement.final_global {
            self.refine(&mut run, RefinementScope::Global);
        }
        refinement.merge(self.scheduler.stats());

        let status = self.status(&run);
        let graph_stats = self.shared.graph.read().stats();
        let report = PipelineReport::new(status, run.counters, &graph_stats, refinement, start.elapsed());
        report.log_summary();
        report
    }

    fn spawn_worker(&self) -> Option<RefinementWorker> {
        if !self.config.refinement.background_global {
            return None;
        }
        match RefinementWorker::spawn(
            Arc::clone(&self.shared),
            Self::make_scheduler(&self.config),
            Arc::clone(&self.adjuster),
            self.config.capability.refine_timeout(),
        ) {
            Ok(worker) => Some(worker),
            Err(e) => {
                warn!("[Pipeline] could not start refinement worker, refining inline: {}", e);
                None
            }
        }
    }

    fn status(&self, run: &RunState) -> PipelineStatus {
        if run.counters.frames_seen == 0 || run.counters.keyframes_admitted == 0 {
            return PipelineStatus::InsufficientData;
        }
        if let Some(reason) = run.failure {
            return PipelineStatus::Failure(reason);
        }
        if !run.bootstrapped {
            return if run.counters.keyframes_admitted <= 1 {
                PipelineStatus::InsufficientMotion
            } else {
                PipelineStatus::Failure(FailureReason::BootstrapFailed)
            };
        }
        let graph = self.shared.graph.read();
        let registered = graph.num_registered();
        let total_keyframes = graph.num_keyframes();
        if registered == total_keyframes {
            PipelineStatus::Success { registered }
        } else {
            PipelineStatus::Partial {
                registered,
                total_keyframes,
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Per-frame processing
    // ─────────────────────────────────────────────────────────────────────────

    fn process_frame(&mut self, run: &mut RunState, frame: Frame) {
        let features = match self.extract(&frame) {
            Ok(features) => Arc::new(features),
            Err(e) => {
                warn!("[Pipeline] frame {}: feature extraction failed: {}", frame.index, e);
                run.counters.extraction_failures += 1;
                return;
            }
        };

        let mut displacement = match &run.last_keyframe {
            Some(last) => Displacement::from_correspondences(&self.correspondences(last, &features)),
            None => Displacement::Unavailable,
        };
        // After a redetection the last keyframe may itself be unregistered;
        // fall back to the newest registered one.
        if displacement == Displacement::Unavailable && run.selector.needs_redetection() {
            if let Some(anchor) = self.last_registered_features() {
                let same = run.last_keyframe.as_ref().is_some_and(|last| Arc::ptr_eq(last, &anchor));
                if !same {
                    debug!("[Selector] frame {}: measuring against last registered keyframe", frame.index);
                    displacement = Displacement::from_correspondences(&self.correspondences(&anchor, &features));
                }
            }
        }

        match run.selector.decide(&displacement) {
            KeyframeDecision::Admit(reason) => {
                debug!(
                    "[Selector] frame {} admitted ({:?}, displacement {:?})",
                    frame.index,
                    reason,
                    displacement.mean_px()
                );
                run.counters.keyframes_admitted += 1;
                let intrinsics = frame.intrinsics.unwrap_or(self.config.default_intrinsics);
                let keyframe = Arc::new(Keyframe::new(frame, Arc::clone(&features), displacement));
                run.last_keyframe = Some(features);
                self.on_keyframe(run, PendingKeyframe::new(keyframe, intrinsics));
            }
            KeyframeDecision::Skip => {
                run.counters.frames_skipped += 1;
            }
            KeyframeDecision::Redetect => {
                run.counters.redetections += 1;
                debug!("[Selector] frame {}: no displacement estimate, re-detecting", frame.index);
            }
        }
    }

    fn on_keyframe(&mut self, run: &mut RunState, pending: PendingKeyframe) {
        if run.bootstrapped {
            self.register_new(run, pending);
            return;
        }

        let Some(seed) = run.seed.clone() else {
            debug!("[Pipeline] frame {} seeds the reconstruction", pending.keyframe.index());
            run.seed = Some(pending);
            return;
        };

        run.counters.bootstrap_attempts += 1;
        let correspondences = self.correspondences(&seed.keyframe.features, &pending.keyframe.features);
        let result = {
            let mut graph = self.shared.graph.write();
            self.registrator.bootstrap(&mut graph, &seed, &pending, &correspondences)
        };

        match result {
            Ok(outcome) => {
                run.bootstrapped = true;
                run.seed = None;
                run.tracker.on_success();

                // Earlier candidates get another chance against the new map.
                if !run.deferred.is_empty() {
                    let mut graph = self.shared.graph.write();
                    for deferred in run.deferred.drain(..) {
                        let kf_id = graph.insert_keyframe(deferred.keyframe, deferred.intrinsics);
                        run.retry_queue.push_back(RetryEntry { kf_id, attempts: 0 });
                    }
                }

                if let Some(&candidate) = outcome.registered.last() {
                    self.after_registration(run, candidate);
                }
                self.drain_retries(run);
            }
            Err(e) => {
                warn!(
                    "[Pipeline] bootstrap with frame {} failed: {}",
                    pending.keyframe.index(),
                    e
                );
                run.counters.registration_failures += 1;
                run.deferred.push(pending);
                if run.tracker.on_failure() == TrackingState::Lost {
                    error!("[Pipeline] no two-view initialization after {} attempts", run.counters.bootstrap_attempts);
                    run.failure = Some(FailureReason::BootstrapFailed);
                }
            }
        }
    }

    fn register_new(&mut self, run: &mut RunState, pending: PendingKeyframe) {
        let frame_index = pending.keyframe.index();
        let kf_id = self
            .shared
            .graph
            .write()
            .insert_keyframe(pending.keyframe, pending.intrinsics);

        match self.try_register(kf_id) {
            Ok(_) => {
                run.tracker.on_success();
                self.after_registration(run, kf_id);
                self.drain_retries(run);
            }
            Err(e) => {
                warn!("[Pipeline] {} (frame {}) not registered: {}", kf_id, frame_index, e);
                run.counters.registration_failures += 1;
                run.retry_queue.push_back(RetryEntry { kf_id, attempts: 0 });
                if run.tracker.on_failure() == TrackingState::Lost {
                    error!(
                        "[Pipeline] tracking lost after {} consecutive failures",
                        run.tracker.consecutive_failures()
                    );
                    run.failure = Some(FailureReason::TrackingLost);
                }
            }
        }
    }

    /// Match against the window without holding the lock, then register
    /// under the write lock.
    fn try_register(&self, kf_id: KeyframeId) -> Result<RegistrationOutcome, RegistrationError> {
        let (query, targets) = {
            let graph = self.shared.graph.read();
            let query = graph.keyframe(kf_id).map(|kf| Arc::clone(kf.features()));
            let targets: Vec<(KeyframeId, Arc<FeatureSet>)> = self
                .registrator
                .window(&graph)
                .into_iter()
                .filter_map(|id| graph.keyframe(id).map(|kf| (id, Arc::clone(kf.features()))))
                .collect();
            (query, targets)
        };
        let query = query.unwrap_or_default();

        debug!("[Pipeline] matching {} against {} window keyframes", kf_id, targets.len());
        let matches = match_window(&self.matcher, &query, &targets, &self.config.capability);

        self.shared.request_abort_refinement();
        let mut graph = self.shared.graph.write();
        self.registrator.register(&mut graph, kf_id, &matches)
    }

    /// Retry queued keyframes once each; drop those out of attempts.
    fn drain_retries(&mut self, run: &mut RunState) {
        let queued: Vec<RetryEntry> = run.retry_queue.drain(..).collect();
        for mut entry in queued {
            match self.try_register(entry.kf_id) {
                Ok(_) => {
                    info!("[Pipeline] {} registered on retry {}", entry.kf_id, entry.attempts + 1);
                    run.counters.recovered_by_retry += 1;
                    run.tracker.on_success();
                    self.after_registration(run, entry.kf_id);
                }
                Err(e) => {
                    entry.attempts += 1;
                    if entry.attempts < self.config.registration.max_retries_per_keyframe {
                        run.retry_queue.push_back(entry);
                    } else {
                        debug!("[Pipeline] giving up on {}: {}", entry.kf_id, e);
                    }
                }
            }
        }
    }

    fn after_registration(&mut self, run: &mut RunState, kf_id: KeyframeId) {
        for scope in self.scheduler.on_registered(kf_id) {
            self.refine(run, scope);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Refinement
    // ─────────────────────────────────────────────────────────────────────────

    fn refine(&mut self, run: &mut RunState, scope: RefinementScope) {
        if scope == RefinementScope::Global {
            if let Some(worker) = &run.worker {
                if worker.submit(scope) {
                    return;
                }
            }
        }

        let timeout = self.config.capability.refine_timeout();
        let max_retries = self.config.capability.max_retries;
        let mut graph = self.shared.graph.write();
        let result = with_retries(max_retries, "refinement", |_| {
            self.scheduler.refine_now(&mut graph, scope, &self.adjuster, timeout)
        });
        match result {
            Ok(Some(ApplyOutcome::Applied { outliers_removed, .. })) if outliers_removed > 0 => {
                debug!("[Pipeline] {:?} removed {} outlier observations", scope, outliers_removed);
            }
            Ok(_) => {}
            // Already logged by the scheduler; the store is unchanged.
            Err(_) => {}
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Capabilities
    // ─────────────────────────────────────────────────────────────────────────

    fn last_registered_features(&self) -> Option<Arc<FeatureSet>> {
        let graph = self.shared.graph.read();
        let kf_id = *graph.recent_registered(1).first()?;
        graph.keyframe(kf_id).map(|kf| Arc::clone(kf.features()))
    }

    fn extract(&self, frame: &Frame) -> Result<FeatureSet, CapabilityError> {
        with_retries(self.config.capability.max_retries, "feature extraction", |_| {
            self.extractor.extract(frame)
        })
    }

    /// Correspondences between two feature sets. Nothing shared, or a
    /// capability failure after retries, gives an empty list.
    fn correspondences(&self, a: &Arc<FeatureSet>, b: &Arc<FeatureSet>) -> Vec<Correspondence> {
        let timeout = self.config.capability.match_timeout();
        let result = with_retries(self.config.capability.max_retries, "match", |_| {
            match_pair(&self.matcher, a, b, timeout)
        });
        match result {
            Ok(correspondences) => correspondences,
            Err(MatchError::NoCorrespondence) => Vec::new(),
            Err(MatchError::Capability(e)) => {
                warn!("[Pipeline] correspondence request failed: {}", e);
                Vec::new()
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Direct stages
    // ─────────────────────────────────────────────────────────────────────────

    fn pending(&self, frame: &Frame) -> Result<PendingKeyframe, CapabilityError> {
        let features = Arc::new(self.extract(frame)?);
        let intrinsics = frame.intrinsics.unwrap_or(self.config.default_intrinsics);
        let keyframe = Keyframe::new(frame.clone(), features, Displacement::Unavailable);
        Ok(PendingKeyframe::new(Arc::new(keyframe), intrinsics))
    }

    /// Two-view initialization of the store from two specific frames.
    ///
    /// On failure the store is left as it was.
    pub fn bootstrap_frames(&mut self, seed: &Frame, candidate: &Frame) -> Result<RegistrationOutcome, RegistrationError> {
        let seed = self.pending(seed)?;
        let candidate = self.pending(candidate)?;
        let correspondences = self.correspondences(&seed.keyframe.features, &candidate.keyframe.features);
        let mut graph = self.shared.graph.write();
        self.registrator.bootstrap(&mut graph, &seed, &candidate, &correspondences)
    }

    /// Refine the whole store now, outside the regular cadence.
    pub fn refine_global(&mut self) -> Result<Option<ApplyOutcome>, RefineError> {
        let timeout = self.config.capability.refine_timeout();
        let mut graph = self.shared.graph.write();
        self.scheduler
            .refine_now(&mut graph, RefinementScope::Global, &self.adjuster, timeout)
    }

    pub fn calibrate(&self, control_points: &[ControlPoint]) -> Result<Calibration, CalibrationError> {
        ScaleCalibrator::default().calibrate(&self.shared.graph.read(), control_points)
    }

    pub fn calibrate_from_distances(&self, constraints: &[DistanceConstraint]) -> Result<Calibration, CalibrationError> {
        ScaleCalibrator::default().from_distances(&self.shared.graph.read(), constraints)
    }

    pub fn exporter(&self, transform: Option<&Sim3>) -> Exporter {
        Exporter::new(&self.shared.graph.read(), transform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticScene;
    use crate::tracking::ImageRef;

    fn pipeline_for(scene: &Arc<SyntheticScene>) -> Pipeline {
        Pipeline::with_builtin_capabilities(PipelineConfig::default(), Arc::clone(scene) as Arc<dyn FeatureExtractor>)
    }

    #[test]
    fn test_empty_source_is_insufficient_data() {
        let scene = Arc::new(SyntheticScene::straight_line(0, 0.7));
        let mut pipeline = pipeline_for(&scene);
        let report = pipeline.run(scene.as_ref());
        assert_eq!(report.status, PipelineStatus::InsufficientData);
        assert!(pipeline.graph().is_empty());
    }

    struct StillSource {
        scene: SyntheticScene,
        frames: usize,
    }

    impl FrameSource for StillSource {
        fn len(&self) -> usize {
            self.frames
        }

        fn frame(&self, position: usize) -> Option<Frame> {
            (position < self.frames).then(|| {
                Frame::new(position as u64, position as f64 * 0.1, ImageRef::new(format!("still_{position}.png")))
            })
        }
    }

    impl FeatureExtractor for StillSource {
        fn extract(&self, _frame: &Frame) -> Result<FeatureSet, CapabilityError> {
            Ok(FeatureSet::clone(self.scene.features(0).ok_or(CapabilityError::Disconnected)?))
        }
    }

    #[test]
    fn test_static_sequence_is_insufficient_motion() {
        let still = Arc::new(StillSource {
            scene: SyntheticScene::straight_line(1, 0.7),
            frames: 8,
        });
        let mut pipeline =
            Pipeline::with_builtin_capabilities(PipelineConfig::default(), Arc::clone(&still) as Arc<dyn FeatureExtractor>);
        let report = pipeline.run(still.as_ref());
        assert_eq!(report.status, PipelineStatus::InsufficientMotion);
        assert_eq!(report.counters.keyframes_admitted, 1);
        assert_eq!(report.counters.frames_skipped, 7);
    }

    #[test]
    fn test_frame_skip_and_limit() {
        let scene = Arc::new(SyntheticScene::straight_line(10, 0.9));
        let mut config = PipelineConfig::default();
        config.frame_skip = 2;
        config.max_frames = Some(3);
        let mut pipeline = Pipeline::with_builtin_capabilities(config, Arc::clone(&scene) as Arc<dyn FeatureExtractor>);
        let report = pipeline.run(scene.as_ref());
        assert_eq!(report.counters.frames_seen, 3);
    }

    #[test]
    fn test_bootstrap_frames_builds_two_view_map() {
        let scene = Arc::new(SyntheticScene::straight_line(2, 0.7));
        let mut pipeline = pipeline_for(&scene);
        let outcome = pipeline
            .bootstrap_frames(&scene.frame(0).unwrap(), &scene.frame(1).unwrap())
            .unwrap();
        assert_eq!(outcome.registered.len(), 2);
        let graph = pipeline.graph();
        assert_eq!(graph.num_registered(), 2);
        assert!(graph.num_landmarks() >= 20);
    }

    #[test]
    fn test_background_refinement_run_succeeds() {
        let scene = Arc::new(SyntheticScene::straight_line(8, 0.7));
        let mut config = PipelineConfig::default();
        config.refinement.background_global = true;
        config.refinement.global_every = 2;
        let mut pipeline = Pipeline::with_builtin_capabilities(config, Arc::clone(&scene) as Arc<dyn FeatureExtractor>);
        let report = pipeline.run(scene.as_ref());
        assert_eq!(report.status, PipelineStatus::Success { registered: 8 });
        assert!(report.refinement.global_applied >= 1);
        pipeline.graph().assert_invariants();
    }
}
