//! Duration metric: tracks the open intervals of its "what" condition per
//! dimension key, intersected with the gating condition's true time, and
//! aggregates per bucket as a SUM of open time or as the longest single
//! open interval (MAX_SPARSE). Intervals are clipped at bucket boundaries
//! when finalizing.

use std::collections::{HashMap, HashSet};

use crate::condition::ConditionNetwork;
use crate::config::DurationAggregation;
use crate::dimension::{project_key, DimensionKey};
use crate::report::{DimensionData, DurationBucketInfo, MetricData};

use super::{FinalizedBucket, ProducerBase};

#[derive(Debug, Clone, Default)]
struct DurationState {
    /// Whether the what-condition is currently met for this key.
    what_met: bool,
    /// Start of the currently-accumulating (what-met AND gated) interval.
    open_since: Option<i64>,
    /// SUM aggregation: accumulated open time this bucket.
    accum_ns: i64,
    /// MAX_SPARSE aggregation: longest closed interval this bucket.
    max_ns: i64,
}

impl DurationState {
    fn close(&mut self, at_ns: i64) {
        if let Some(open) = self.open_since.take() {
            if at_ns > open {
                self.accum_ns += at_ns - open;
                self.max_ns = self.max_ns.max(at_ns - open);
            }
        }
    }

    fn idle(&self) -> bool {
        !self.what_met && self.open_since.is_none() && self.accum_ns == 0 && self.max_ns == 0
    }
}

#[derive(Debug)]
pub struct DurationMetricProducer {
    pub(crate) base: ProducerBase,
    what: usize,
    aggregation: DurationAggregation,
    /// Unsliced gate state; meaningful only without links.
    gate_true: bool,
    /// Condition-side keys currently true; meaningful only with links.
    gate_keys_true: HashSet<DimensionKey>,
    live: HashMap<DimensionKey, DurationState>,
    past: HashMap<DimensionKey, Vec<DurationBucketInfo>>,
    pending_finalized: Vec<FinalizedBucket>,
}

impl DurationMetricProducer {
    pub fn new(base: ProducerBase, what: usize, aggregation: DurationAggregation) -> Self {
        let gate_true = base.condition.is_none();
        Self {
            base,
            what,
            aggregation,
            gate_true,
            gate_keys_true: HashSet::new(),
            live: HashMap::new(),
            past: HashMap::new(),
            pending_finalized: Vec::new(),
        }
    }

    pub fn what(&self) -> usize {
        self.what
    }

    pub(crate) fn set_what(&mut self, what: usize) {
        self.what = what;
    }

    fn gate_ok(&self, key: &DimensionKey) -> bool {
        if self.base.condition.is_none() {
            return true;
        }
        match &self.base.link {
            Some(link) => {
                let cond_key = project_key(key, &link.what_leaves, &link.cond_leaves);
                self.gate_keys_true.contains(&cond_key)
            }
            None => self.gate_true,
        }
    }

    /// Per-key transition of the what-condition.
    pub fn on_what_changed(
        &mut self,
        key: &DimensionKey,
        met: bool,
        now_ns: i64,
        _conditions: &ConditionNetwork,
    ) {
        self.flush_if_needed(now_ns);
        let active = self.base.activation.is_active(now_ns);
        let gated = self.gate_ok(key);

        let known = self.live.contains_key(key);
        if !met && !known {
            return;
        }
        if met && self.base.reject_new_key(self.live.len(), known) {
            return;
        }

        let st = self.live.entry(key.clone()).or_default();
        if met && !st.what_met {
            st.what_met = true;
            if gated && active && st.open_since.is_none() {
                st.open_since = Some(now_ns);
            }
        } else if !met && st.what_met {
            st.what_met = false;
            st.close(now_ns);
        }
    }

    /// Unsliced gating-condition change. Ignored when links are configured;
    /// the sliced handler drives those.
    pub fn on_gate_changed(&mut self, now_true: bool, now_ns: i64) {
        if self.base.link.is_some() {
            return;
        }
        self.flush_if_needed(now_ns);
        self.gate_true = now_true;
        let active = self.base.activation.is_active(now_ns);

        for st in self.live.values_mut() {
            if now_true {
                if st.what_met && st.open_since.is_none() && active {
                    st.open_since = Some(now_ns);
                }
            } else {
                st.close(now_ns);
            }
        }
    }

    /// Per-key gating-condition change, reaching this metric through links.
    pub fn on_gate_sliced_changed(&mut self, cond_key: &DimensionKey, met: bool, now_ns: i64) {
        let Some(link) = self.base.link.clone() else {
            return;
        };
        self.flush_if_needed(now_ns);
        if met {
            self.gate_keys_true.insert(cond_key.clone());
        } else {
            self.gate_keys_true.remove(cond_key);
        }
        let active = self.base.activation.is_active(now_ns);

        for (key, st) in self.live.iter_mut() {
            let projected = project_key(key, &link.what_leaves, &link.cond_leaves);
            if &projected != cond_key {
                continue;
            }
            if met {
                if st.what_met && st.open_since.is_none() && active {
                    st.open_since = Some(now_ns);
                }
            } else {
                st.close(now_ns);
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
            // Clip open intervals at the split, then drop the partial data.
            for st in self.live.values_mut() {
                let open = st.open_since.is_some();
                st.close(split.end_ns);
                st.accum_ns = 0;
                st.max_ns = 0;
                if open {
                    st.open_since = Some(split.end_ns);
                }
            }
            self.base.record_skipped(split.start_ns, split.end_ns);
        } else {
            self.finalize_bucket(split.start_ns, split.end_ns);
        }

        // Aggregation stops while the metric is inactive.
        if !self.base.activation.is_active(split.end_ns) {
            for st in self.live.values_mut() {
                st.open_since = None;
            }
        }
    }

    /// Clips open intervals at the bucket end, emits non-zero aggregates,
    /// and restarts open intervals at the new bucket start.
    fn finalize_bucket(&mut self, start_ns: i64, end_ns: i64) {
        for (key, st) in self.live.iter_mut() {
            let reopen = st.open_since.is_some();
            st.close(end_ns);

            let value = match self.aggregation {
                DurationAggregation::Sum => st.accum_ns,
                DurationAggregation::MaxSparse => st.max_ns,
            };
            if value > 0 {
                self.past
                    .entry(key.clone())
                    .or_default()
                    .push(DurationBucketInfo {
                        start_bucket_elapsed_ns: start_ns,
                        end_bucket_elapsed_ns: end_ns,
                        duration_ns: value,
                    });
                self.pending_finalized.push(FinalizedBucket {
                    metric_id: self.base.metric_id,
                    key: key.clone(),
                    value,
                    bucket_end_ns: end_ns,
                });
            }

            st.accum_ns = 0;
            st.max_ns = 0;
            if reopen {
                st.open_since = Some(end_ns);
            }
        }

        self.live.retain(|_, st| !st.idle());
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
        let mut merged: HashMap<DimensionKey, Vec<DurationBucketInfo>> = self.past.clone();
        if include_current && dump_ns > self.base.buckets.current_start_ns() {
            for (key, st) in &self.live {
                let open_part = st
                    .open_since
                    .map(|o| (dump_ns - o).max(0))
                    .unwrap_or(0);
                let value = match self.aggregation {
                    DurationAggregation::Sum => st.accum_ns + open_part,
                    DurationAggregation::MaxSparse => st.max_ns.max(open_part),
                };
                if value > 0 {
                    merged
                        .entry(key.clone())
                        .or_default()
                        .push(DurationBucketInfo {
                            start_bucket_elapsed_ns: self.base.buckets.current_start_ns(),
                            end_bucket_elapsed_ns: dump_ns,
                            duration_ns: value,
                        });
                }
            }
        }

        let mut entries: Vec<(DimensionKey, Vec<DurationBucketInfo>)> =
            merged.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let data: Vec<DimensionData<DurationBucketInfo>> = entries
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
                for st in self.live.values_mut() {
                    st.accum_ns = 0;
                    st.max_ns = 0;
                    if st.open_since.is_some() {
                        st.open_since = Some(dump_ns);
                    }
                }
                self.base.buckets.restart_at(dump_ns);
            }
        }

        MetricData::Duration { data, skipped }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MatcherConfig, MatcherKind};
    use crate::dimension::{DimensionEntry, FieldPath};
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

    fn producer(aggregation: DurationAggregation) -> DurationMetricProducer {
        let base = ProducerBase::new(
            200,
            BucketState::new(0, MIN, 0),
            &ResolvedRefs::default(),
            Vec::new(),
            800,
        );
        DurationMetricProducer::new(base, 0, aggregation)
    }

    fn key(v: i32) -> DimensionKey {
        DimensionKey(vec![DimensionEntry {
            path: FieldPath::top(1),
            value: FieldValue::Int(v),
        }])
    }

    fn sum_buckets(p: &mut DurationMetricProducer, dump_ns: i64) -> Vec<DurationBucketInfo> {
        let MetricData::Duration { data, .. } = p.on_dump(dump_ns, true, false, false) else {
            panic!("duration data");
        };
        data.into_iter().flat_map(|d| d.buckets).collect()
    }

    #[test]
    fn test_sum_accumulates_open_time() {
        let conds = conditions();
        let mut p = producer(DurationAggregation::Sum);

        p.on_what_changed(&key(1), true, 200, &conds);
        p.on_what_changed(&key(1), false, 500, &conds);
        p.on_what_changed(&key(1), true, 1_000, &conds);
        p.on_what_changed(&key(1), false, 1_600, &conds);

        let buckets = sum_buckets(&mut p, MIN);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].duration_ns, 300 + 600);
    }

    #[test]
    fn test_interval_clipped_at_bucket_boundary() {
        let conds = conditions();
        let mut p = producer(DurationAggregation::Sum);

        // Opens at 200ns and stays open across the boundary.
        p.on_what_changed(&key(1), true, 200, &conds);
        p.on_what_changed(&key(1), false, MIN + 500, &conds);

        let buckets = sum_buckets(&mut p, 2 * MIN);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].duration_ns, MIN - 200);
        assert_eq!(buckets[0].end_bucket_elapsed_ns, MIN);
        assert_eq!(buckets[1].duration_ns, 500);
    }

    #[test]
    fn test_max_sparse_takes_longest_interval_not_sum() {
        let conds = conditions();
        let mut p = producer(DurationAggregation::MaxSparse);

        p.on_what_changed(&key(1), true, 0, &conds);
        p.on_what_changed(&key(1), false, 1_000, &conds);
        p.on_what_changed(&key(1), true, 2_000, &conds);
        p.on_what_changed(&key(1), false, 5_000, &conds);

        let buckets = sum_buckets(&mut p, MIN);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].duration_ns, 3_000, "max, not 4000 sum");
    }

    #[test]
    fn test_gate_pauses_accumulation() {
        let conds = conditions();
        let base = ProducerBase::new(
            200,
            BucketState::new(0, MIN, 0),
            &ResolvedRefs {
                condition: Some(0),
                ..Default::default()
            },
            Vec::new(),
            800,
        );
        let mut p = DurationMetricProducer::new(base, 0, DurationAggregation::Sum);

        // Gate starts false: what turning true opens nothing.
        p.on_what_changed(&key(1), true, 100, &conds);
        // Gate true at 1000: interval opens.
        p.on_gate_changed(true, 1_000);
        // Gate false at 1_400: 400ns accumulated.
        p.on_gate_changed(false, 1_400);
        // Gate true again at 2_000, what stops at 2_100: 100ns more.
        p.on_gate_changed(true, 2_000);
        p.on_what_changed(&key(1), false, 2_100, &conds);

        let buckets = sum_buckets(&mut p, MIN);
        assert_eq!(buckets[0].duration_ns, 500);
    }

    #[test]
    fn test_per_key_independence() {
        let conds = conditions();
        let mut p = producer(DurationAggregation::Sum);

        p.on_what_changed(&key(1), true, 0, &conds);
        p.on_what_changed(&key(2), true, 100, &conds);
        p.on_what_changed(&key(1), false, 300, &conds);
        p.on_what_changed(&key(2), false, 600, &conds);

        let MetricData::Duration { data, .. } = p.on_dump(MIN, true, false, false) else {
            panic!("duration data");
        };
        assert_eq!(data.len(), 2);
        let mut durations: Vec<i64> = data.iter().map(|d| d.buckets[0].duration_ns).collect();
        durations.sort();
        assert_eq!(durations, vec![300, 500]);
    }

    #[test]
    fn test_open_interval_included_in_current_dump() {
        let conds = conditions();
        let mut p = producer(DurationAggregation::Sum);
        p.on_what_changed(&key(1), true, 1_000, &conds);

        let buckets = sum_buckets(&mut p, 5_000);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].duration_ns, 4_000);
    }

    #[test]
    fn test_zero_duration_buckets_not_materialized() {
        let conds = conditions();
        let mut p = producer(DurationAggregation::Sum);

        p.on_what_changed(&key(1), true, 100, &conds);
        p.on_what_changed(&key(1), false, 400, &conds);
        // Roll far forward; the intermediate buckets carry no open time.
        p.flush_if_needed(10 * MIN + 1);

        let MetricData::Duration { data, .. } = p.on_dump(11 * MIN, false, false, false) else {
            panic!("duration data");
        };
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].buckets.len(), 1);
    }
}
