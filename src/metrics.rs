use serde::Serialize;
use std::collections::VecDeque;

use crate::models::PerformanceSample;

// Recent samples kept for inspection; aggregates cover every request
const SAMPLE_HISTORY: usize = 100;

/// Aggregate telemetry exposed to the UI.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
    pub average_response_time: f64,
    pub cache_hit_rate: f64,
    pub total_requests: u64,
}

#[derive(Debug, Default)]
pub struct PerformanceTracker {
    recent: VecDeque<PerformanceSample>,
    total_requests: u64,
    cache_hits: u64,
    total_response_ms: u64,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, sample: PerformanceSample) {
        log::info!(
            "Request resolved in {}ms (cache hit: {}, {:?})",
            sample.response_time_ms,
            sample.cache_hit,
            sample.optimization_level
        );
        self.total_requests += 1;
        self.total_response_ms += sample.response_time_ms;
        if sample.cache_hit {
            self.cache_hits += 1;
        }
        if self.recent.len() == SAMPLE_HISTORY {
            self.recent.pop_front();
        }
        self.recent.push_back(sample);
    }

    pub fn summary(&self) -> PerformanceSummary {
        if self.total_requests == 0 {
            return PerformanceSummary::default();
        }
        let total = self.total_requests as f64;
        PerformanceSummary {
            average_response_time: self.total_response_ms as f64 / total,
            cache_hit_rate: self.cache_hits as f64 / total,
            total_requests: self.total_requests,
        }
    }

    pub fn recent(&self) -> impl Iterator<Item = &PerformanceSample> {
        self.recent.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn summary_averages_and_counts_hits() {
        let mut tracker = PerformanceTracker::new();
        assert_eq!(tracker.summary(), PerformanceSummary::default());

        tracker.record(PerformanceSample::new(Duration::from_millis(3000), false));
        tracker.record(PerformanceSample::new(Duration::from_millis(0), true));
        tracker.record(PerformanceSample::new(Duration::from_millis(0), true));
        tracker.record(PerformanceSample::new(Duration::from_millis(1000), false));

        let summary = tracker.summary();
        assert_eq!(summary.total_requests, 4);
        assert_eq!(summary.average_response_time, 1000.0);
        assert_eq!(summary.cache_hit_rate, 0.5);
    }

    #[test]
    fn history_is_bounded_but_totals_are_not() {
        let mut tracker = PerformanceTracker::new();
        for _ in 0..(SAMPLE_HISTORY + 5) {
            tracker.record(PerformanceSample::new(Duration::from_millis(10), false));
        }
        assert_eq!(tracker.recent().count(), SAMPLE_HISTORY);
        assert_eq!(tracker.summary().total_requests, (SAMPLE_HISTORY + 5) as u64);
    }
}
