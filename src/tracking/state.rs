//! Registration state machine.

/// State of incremental registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingState {
    /// No two-view initialization yet.
    NotInitialized,
    /// Last keyframe registered.
    Ok,
    /// Recent registrations failed, still under the failure budget.
    RecentlyLost,
    /// Consecutive-failure limit reached.
    Lost,
}

impl Default for TrackingState {
    fn default() -> Self {
        Self::NotInitialized
    }
}

/// Counts consecutive registration failures against a budget.
#[derive(Debug, Clone)]
pub struct RegistrationTracker {
    state: TrackingState,
    consecutive_failures: usize,
    max_consecutive_failures: usize,
    total_failures: usize,
}

impl RegistrationTracker {
    pub fn new(max_consecutive_failures: usize) -> Self {
        Self {
            state: TrackingState::NotInitialized,
            consecutive_failures: 0,
            max_consecutive_failures: max_consecutive_failures.max(1),
            total_failures: 0,
        }
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn is_lost(&self) -> bool {
        self.state == TrackingState::Lost
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures
    }

    pub fn total_failures(&self) -> usize {
        self.total_failures
    }

    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = TrackingState::Ok;
    }

    /// Record a failure and return the new state.
    ///
    /// Failures before initialization count too: a sequence that never
    /// bootstraps must still terminate.
    pub fn on_failure(&mut self) -> TrackingState {
        self.consecutive_failures += 1;
        self.total_failures += 1;
        self.state = if self.consecutive_failures >= self.max_consecutive_failures {
            TrackingState::Lost
        } else if self.state == TrackingState::NotInitialized {
            TrackingState::NotInitialized
        } else {
            TrackingState::RecentlyLost
        };
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_reach_lost() {
        let mut tracker = RegistrationTracker::new(3);
        tracker.on_success();
        assert_eq!(tracker.on_failure(), TrackingState::RecentlyLost);
        assert_eq!(tracker.on_failure(), TrackingState::RecentlyLost);
        assert_eq!(tracker.on_failure(), TrackingState::Lost);
        assert!(tracker.is_lost());
    }

    #[test]
    fn test_success_resets_counter() {
        let mut tracker = RegistrationTracker::new(2);
        tracker.on_success();
        tracker.on_failure();
        tracker.on_success();
        assert_eq!(tracker.consecutive_failures(), 0);
        assert_eq!(tracker.on_failure(), TrackingState::RecentlyLost);
        assert_eq!(tracker.total_failures(), 2);
    }

    #[test]
    fn test_uninitialized_failures_stay_uninitialized() {
        let mut tracker = RegistrationTracker::new(5);
        assert_eq!(tracker.on_failure(), TrackingState::NotInitialized);
        assert_eq!(tracker.state(), TrackingState::NotInitialized);
    }
}
