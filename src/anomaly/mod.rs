//! Anomaly tracking: per-alert rolling-window threshold monitors over a
//! metric's finalized buckets, with per-dimension-key refractory
//! suppression that survives restarts via the persisted-state interface.

pub mod alarm;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::info;

use crate::config::AlertConfig;
use crate::dimension::DimensionKey;
use crate::time::ns_to_secs;

/// An anomaly that fired. Delivery beyond the registered handler is out of
/// scope.
#[derive(Debug, Clone)]
pub struct AnomalyAlert {
    pub alert_id: i64,
    pub metric_id: i64,
    pub key: DimensionKey,
    /// The rolling sum that crossed the threshold.
    pub rolling_sum: i64,
    /// Seconds timestamp the alert fired at (bucket end).
    pub at_sec: i64,
}

/// Callback invoked when an anomaly fires.
pub type AlertHandler = Arc<dyn Fn(&AnomalyAlert) + Send + Sync>;

/// Rolling window of the last N finalized buckets for one dimension key.
/// The sum is maintained incrementally; nothing is re-summed from scratch.
#[derive(Debug, Default)]
struct KeyWindow {
    /// (bucket index, value) pairs, oldest first.
    buckets: VecDeque<(i64, i64)>,
    sum: i64,
}

/// Threshold monitor for one alert config.
#[derive(Debug)]
pub struct AnomalyTracker {
    alert_id: i64,
    metric_id: i64,
    num_buckets: i64,
    threshold: i64,
    refractory_period_secs: i64,
    /// Bucket duration of the watched metric, for bucket numbering.
    bucket_size_ns: i64,
    windows: HashMap<DimensionKey, KeyWindow>,
    /// Per-key refractory end, in seconds.
    refractory_until_sec: HashMap<DimensionKey, i64>,
}

impl AnomalyTracker {
    pub fn new(cfg: &AlertConfig, bucket_size_ns: i64) -> Self {
        Self {
            alert_id: cfg.id,
            metric_id: cfg.metric_id,
            num_buckets: i64::from(cfg.num_buckets),
            threshold: cfg.trigger_if_sum_gt,
            refractory_period_secs: i64::from(cfg.refractory_period_secs),
            bucket_size_ns,
            windows: HashMap::new(),
            refractory_until_sec: HashMap::new(),
        }
    }

    pub fn alert_id(&self) -> i64 {
        self.alert_id
    }

    pub fn metric_id(&self) -> i64 {
        self.metric_id
    }

    /// Feeds one finalized bucket. Returns the alert if the rolling sum
    /// crossed the threshold outside the key's refractory period.
    pub fn on_bucket_finalized(
        &mut self,
        key: &DimensionKey,
        value: i64,
        bucket_end_ns: i64,
    ) -> Option<AnomalyAlert> {
        let bucket_index = bucket_end_ns / self.bucket_size_ns;
        let window = self.windows.entry(key.clone()).or_default();

        // Evict buckets that fell out of the window, including across gaps.
        while let Some(&(oldest, v)) = window.buckets.front() {
            if oldest <= bucket_index - self.num_buckets {
                window.sum -= v;
                window.buckets.pop_front();
            } else {
                break;
            }
        }

        window.buckets.push_back((bucket_index, value));
        window.sum += value;

        let end_sec = ns_to_secs(bucket_end_ns);
        let refractory_end = self.refractory_until_sec.get(key).copied().unwrap_or(0);
        if refractory_end <= end_sec && window.sum > self.threshold {
            let alert = AnomalyAlert {
                alert_id: self.alert_id,
                metric_id: self.metric_id,
                key: key.clone(),
                rolling_sum: window.sum,
                at_sec: end_sec,
            };
            self.refractory_until_sec
                .insert(key.clone(), end_sec + self.refractory_period_secs);
            info!(
                alert_id = self.alert_id,
                metric_id = self.metric_id,
                rolling_sum = window.sum,
                threshold = self.threshold,
                "anomaly detected"
            );
            return Some(alert);
        }

        None
    }

    /// Refractory ends per key, for persistence. Timestamps are in the
    /// elapsed-seconds timeline; the caller rebases to wall clock.
    pub fn snapshot_refractory(&self) -> Vec<(DimensionKey, i64)> {
        self.refractory_until_sec
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Restores refractory ends, already rebased into this process's
    /// elapsed timeline.
    pub fn restore_refractory(&mut self, entries: Vec<(DimensionKey, i64)>) {
        for (key, sec) in entries {
            self.refractory_until_sec.insert(key, sec);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::{DimensionEntry, FieldPath};
    use crate::event::FieldValue;

    const SEC: i64 = 1_000_000_000;
    const BUCKET: i64 = 60 * SEC;

    fn tracker(num_buckets: u32, threshold: i64, refractory: u32) -> AnomalyTracker {
        AnomalyTracker::new(
            &AlertConfig {
                id: 1,
                metric_id: 100,
                num_buckets,
                trigger_if_sum_gt: threshold,
                refractory_period_secs: refractory,
            },
            BUCKET,
        )
    }

    fn key(v: i32) -> DimensionKey {
        DimensionKey(vec![DimensionEntry {
            path: FieldPath::top(1),
            value: FieldValue::Int(v),
        }])
    }

    #[test]
    fn test_fires_when_rolling_sum_exceeds_threshold() {
        let mut t = tracker(3, 10, 60);
        let k = key(1);

        assert!(t.on_bucket_finalized(&k, 4, BUCKET).is_none());
        assert!(t.on_bucket_finalized(&k, 4, 2 * BUCKET).is_none());
        let alert = t.on_bucket_finalized(&k, 4, 3 * BUCKET).expect("fires");
        assert_eq!(alert.rolling_sum, 12);
    }

    #[test]
    fn test_window_evicts_old_buckets() {
        let mut t = tracker(2, 10, 0);
        let k = key(1);

        t.on_bucket_finalized(&k, 6, BUCKET);
        t.on_bucket_finalized(&k, 6, 2 * BUCKET);
        // Window is [bucket2, bucket3]: 6 + 3 = 9, no fire.
        assert!(t.on_bucket_finalized(&k, 3, 3 * BUCKET).is_none());
    }

    #[test]
    fn test_gap_clears_stale_window_entries() {
        let mut t = tracker(2, 10, 0);
        let k = key(1);

        t.on_bucket_finalized(&k, 8, BUCKET);
        // 100 buckets later: the old 8 must not count.
        assert!(t.on_bucket_finalized(&k, 8, 101 * BUCKET).is_none());
    }

    #[test]
    fn test_refractory_suppresses_repeat_fires() {
        // Bucket ends at 60s, 120s, ...; refractory 150s.
        let mut t = tracker(1, 5, 150);
        let k = key(1);

        let first = t.on_bucket_finalized(&k, 10, BUCKET).expect("fires");
        assert_eq!(first.at_sec, 60);

        // Refractory ends at 210s; buckets ending at 120s and 180s stay
        // suppressed even though the sum is above threshold.
        assert!(t.on_bucket_finalized(&k, 10, 2 * BUCKET).is_none());
        assert!(t.on_bucket_finalized(&k, 10, 3 * BUCKET).is_none());
        // 240s is past the 210s refractory end: fires again.
        assert!(t.on_bucket_finalized(&k, 10, 4 * BUCKET).is_some());
    }

    #[test]
    fn test_refractory_is_per_key() {
        let mut t = tracker(1, 5, 3600);

        assert!(t.on_bucket_finalized(&key(1), 10, BUCKET).is_some());
        // A different key is not suppressed.
        assert!(t.on_bucket_finalized(&key(2), 10, BUCKET).is_some());
        assert!(t.on_bucket_finalized(&key(1), 10, 2 * BUCKET).is_none());
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut t = tracker(1, 5, 100);
        let k = key(1);
        t.on_bucket_finalized(&k, 10, BUCKET);

        let snapshot = t.snapshot_refractory();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].1, 160);

        let mut fresh = tracker(1, 5, 100);
        fresh.restore_refractory(snapshot);
        // Still inside the restored refractory period.
        assert!(fresh.on_bucket_finalized(&k, 10, 2 * BUCKET).is_none());
    }
}
