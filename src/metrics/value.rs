//! Value metric: accumulates a numeric field per bucket, either raw or as
//! the diff from the previous sample, with reset handling for counters
//! that wrap or restart. Pulled tags feed this producer through the same
//! matched-event path as pushed ones; the puller attributes late arrivals
//! to the bucket they were scheduled for.

use std::collections::HashMap;

use tracing::debug;

use crate::condition::ConditionNetwork;
use crate::dimension::DimensionKey;
use crate::event::{Event, FieldId, TagId};
use crate::report::{DimensionData, MetricData, ValueBucketInfo};

use super::{FinalizedBucket, ProducerBase};

#[derive(Debug, Clone, Default)]
struct ValueState {
    /// Last sample seen, the base for diffs.
    prev: Option<i64>,
    /// Accumulated value this bucket.
    sum: i64,
    /// Whether the bucket saw at least one contributing sample.
    has_data: bool,
}

#[derive(Debug)]
pub struct ValueMetricProducer {
    pub(crate) base: ProducerBase,
    value_field: FieldId,
    use_diff: bool,
    use_absolute_value_on_reset: bool,
    skip_zero_diff_output: bool,
    pull_tag: Option<TagId>,
    current: HashMap<DimensionKey, ValueState>,
    past: HashMap<DimensionKey, Vec<ValueBucketInfo>>,
    pending_finalized: Vec<FinalizedBucket>,
}

impl ValueMetricProducer {
    pub fn new(
        base: ProducerBase,
        value_field: FieldId,
        use_diff: bool,
        use_absolute_value_on_reset: bool,
        skip_zero_diff_output: bool,
        pull_tag: Option<TagId>,
    ) -> Self {
        Self {
            base,
            value_field,
            use_diff,
            use_absolute_value_on_reset,
            skip_zero_diff_output,
            pull_tag,
            current: HashMap::new(),
            past: HashMap::new(),
            pending_finalized: Vec::new(),
        }
    }

    pub fn pull_tag(&self) -> Option<TagId> {
        self.pull_tag
    }

    pub fn on_matched_event(&mut self, event: &Event, conditions: &ConditionNetwork) {
        let t = event.elapsed_ns;
        self.flush_if_needed(t);

        if !self.base.activation.is_active(t) {
            return;
        }

        let Some(value) = event.field(self.value_field).and_then(|v| v.as_long()) else {
            // Missing or non-numeric value field excludes the event from
            // this metric only.
            debug!(
                metric_id = self.base.metric_id,
                field = self.value_field,
                "value field missing, sample dropped"
            );
            return;
        };

        let gated = self.base.gate_passes(event, conditions);

        for key in self.base.keys_for(event) {
            let known = self.current.contains_key(&key);
            if self.base.reject_new_key(self.current.len(), known) {
                continue;
            }
            let st = self.current.entry(key).or_default();

            if !self.use_diff {
                if gated {
                    st.sum += value;
                    st.has_data = true;
                }
                continue;
            }

            // Diff mode: the first sample only establishes a base.
            let Some(prev) = st.prev else {
                st.prev = Some(value);
                continue;
            };
            st.prev = Some(value);
            let diff = value - prev;

            if !gated {
                continue;
            }

            if diff < 0 {
                // Reset or wraparound detected.
                if self.use_absolute_value_on_reset {
                    st.sum += value;
                    st.has_data = true;
                } else {
                    debug!(
                        metric_id = self.base.metric_id,
                        "value decreased, treating as reset and rebasing"
                    );
                }
            } else {
                st.sum += diff;
                st.has_data = true;
            }
        }
    }

    pub fn flush_if_needed(&mut self, now_ns: i64) {
        if !self.base.buckets.needs_rollover(now_ns) {
            return;
        }
        let (start, end) = self.base.buckets.advance_to(now_ns);
        self.finalize_bucket(start, end);
    }

    pub fn force_bucket_split(&mut self, at_ns: i64) {
        let Some(split) = self.base.buckets.force_split(at_ns) else {
            return;
        };
        if split.too_small {
            for st in self.current.values_mut() {
                st.sum = 0;
                st.has_data = false;
            }
            self.base.record_skipped(split.start_ns, split.end_ns);
        } else {
            self.finalize_bucket(split.start_ns, split.end_ns);
        }
    }

    fn emit(&self, st: &ValueState) -> bool {
        st.has_data && !(self.skip_zero_diff_output && st.sum == 0)
    }

    fn finalize_bucket(&mut self, start_ns: i64, end_ns: i64) {
        for (key, st) in self.current.iter_mut() {
            if st.has_data && !(self.skip_zero_diff_output && st.sum == 0) {
                self.past.entry(key.clone()).or_default().push(ValueBucketInfo {
                    start_bucket_elapsed_ns: start_ns,
                    end_bucket_elapsed_ns: end_ns,
                    value: st.sum,
                });
                self.pending_finalized.push(FinalizedBucket {
                    metric_id: self.base.metric_id,
                    key: key.clone(),
                    value: st.sum,
                    bucket_end_ns: end_ns,
                });
            }
            st.sum = 0;
            st.has_data = false;
            // prev is retained: diffs continue across buckets.
        }
    }

    pub fn drain_finalized(&mut self) -> Vec<FinalizedBucket> {
        std::mem::take(&mut self.pending_finalized)
    }

    pub fn on_dump(
        &mut self,
        dump_ns: i64,
        include_current: bool,
        erase: bool,
        hash_strings: bool,
    ) -> MetricData {
        let mut merged: HashMap<DimensionKey, Vec<ValueBucketInfo>> = self.past.clone();
        if include_current && dump_ns > self.base.buckets.current_start_ns() {
            for (key, st) in &self.current {
                if self.emit(st) {
                    merged.entry(key.clone()).or_default().push(ValueBucketInfo {
                        start_bucket_elapsed_ns: self.base.buckets.current_start_ns(),
                        end_bucket_elapsed_ns: dump_ns,
                        value: st.sum,
                    });
                }
            }
        }

        let mut entries: Vec<(DimensionKey, Vec<ValueBucketInfo>)> = merged.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let data: Vec<DimensionData<ValueBucketInfo>> = entries
            .into_iter()
            .map(|(key, buckets)| DimensionData {
                dimensions_in_what: crate::report::dimensions_from_key(&key, hash_strings),
                dimensions_in_condition: self.base.condition_dimensions(&key, hash_strings),
                buckets,
            })
            .collect();

        let skipped = self.base.take_skipped(erase);
        if erase {
            self.past.clear();
            if include_current {
                for st in self.current.values_mut() {
                    st.sum = 0;
                    st.has_data = false;
                }
                self.base.buckets.restart_at(dump_ns);
            }
        }

        MetricData::Value { data, skipped }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MatcherConfig, MatcherKind};
    use crate::event::FieldValue;
    use crate::matcher::MatcherNetwork;
    use crate::metrics::bucket::BucketState;
    use crate::metrics::ResolvedRefs;

    const MIN: i64 = 60 * 1_000_000_000;

    fn conditions() -> ConditionNetwork {
        let matchers = MatcherNetwork::build(&[MatcherConfig {
            id: 1,
            kind: MatcherKind::Simple {
                tag_id: 1,
                field_matchers: Vec::new(),
            },
        }])
        .expect("matchers");
        ConditionNetwork::build(&[], &matchers).expect("conditions")
    }

    fn producer(use_diff: bool, abs_on_reset: bool, skip_zero: bool) -> ValueMetricProducer {
        let base = ProducerBase::new(
            300,
            BucketState::new(0, MIN, 0),
            &ResolvedRefs::default(),
            Vec::new(),
            800,
        );
        ValueMetricProducer::new(base, 1, use_diff, abs_on_reset, skip_zero, None)
    }

    fn sample(t: i64, v: i64) -> Event {
        Event::new(1, 1000, t, t, vec![FieldValue::Long(v)])
    }

    fn buckets(p: &mut ValueMetricProducer, dump_ns: i64) -> Vec<ValueBucketInfo> {
        let MetricData::Value { data, .. } = p.on_dump(dump_ns, true, false, false) else {
            panic!("value data");
        };
        data.into_iter().flat_map(|d| d.buckets).collect()
    }

    #[test]
    fn test_raw_values_accumulate() {
        let conds = conditions();
        let mut p = producer(false, false, false);
        p.on_matched_event(&sample(10, 5), &conds);
        p.on_matched_event(&sample(20, 7), &conds);

        let b = buckets(&mut p, MIN);
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].value, 12);
    }

    #[test]
    fn test_diff_mode_skips_first_sample() {
        let conds = conditions();
        let mut p = producer(true, false, false);
        p.on_matched_event(&sample(10, 100), &conds);
        p.on_matched_event(&sample(20, 130), &conds);
        p.on_matched_event(&sample(30, 170), &conds);

        let b = buckets(&mut p, MIN);
        assert_eq!(b[0].value, 70, "two diffs, base sample excluded");
    }

    #[test]
    fn test_diff_base_carries_across_buckets() {
        let conds = conditions();
        let mut p = producer(true, false, false);
        p.on_matched_event(&sample(10, 100), &conds);
        p.on_matched_event(&sample(MIN + 10, 150), &conds);

        let b = buckets(&mut p, 2 * MIN);
        assert_eq!(b.len(), 1, "first bucket had only the base sample");
        assert_eq!(b[0].value, 50);
        assert_eq!(b[0].start_bucket_elapsed_ns, MIN);
    }

    #[test]
    fn test_reset_without_absolute_drops_sample_and_rebases() {
        let conds = conditions();
        let mut p = producer(true, false, false);
        p.on_matched_event(&sample(10, 100), &conds);
        p.on_matched_event(&sample(20, 30), &conds); // reset
        p.on_matched_event(&sample(30, 50), &conds);

        let b = buckets(&mut p, MIN);
        assert_eq!(b[0].value, 20, "only the post-reset diff counts");
    }

    #[test]
    fn test_reset_with_absolute_uses_current_value() {
        let conds = conditions();
        let mut p = producer(true, true, false);
        p.on_matched_event(&sample(10, 100), &conds);
        p.on_matched_event(&sample(20, 30), &conds); // reset, absolute

        let b = buckets(&mut p, MIN);
        assert_eq!(b[0].value, 30);
    }

    #[test]
    fn test_skip_zero_diff_suppresses_bucket() {
        let conds = conditions();
        let mut p = producer(true, false, true);
        p.on_matched_event(&sample(10, 100), &conds);
        p.on_matched_event(&sample(20, 100), &conds); // zero diff

        let b = buckets(&mut p, MIN);
        assert!(b.is_empty());
    }

    #[test]
    fn test_missing_value_field_drops_sample_only() {
        let conds = conditions();
        let mut p = producer(false, false, false);
        p.on_matched_event(&Event::new(1, 1000, 10, 10, Vec::new()), &conds);
        p.on_matched_event(&sample(20, 3), &conds);

        let b = buckets(&mut p, MIN);
        assert_eq!(b[0].value, 3);
    }
}
