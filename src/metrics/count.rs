//! Count metric: +1 per matched event, per dimension key, per bucket,
//! gated by the linked condition.

use std::collections::HashMap;

use crate::condition::ConditionNetwork;
use crate::dimension::DimensionKey;
use crate::event::Event;
use crate::report::{CountBucketInfo, DimensionData, MetricData};

use super::{FinalizedBucket, ProducerBase};

#[derive(Debug)]
pub struct CountMetricProducer {
    pub(crate) base: ProducerBase,
    /// Counters accumulating in the current bucket.
    current: HashMap<DimensionKey, i64>,
    /// Finalized buckets pending a dump.
    past: HashMap<DimensionKey, Vec<CountBucketInfo>>,
    pending_finalized: Vec<FinalizedBucket>,
}

impl CountMetricProducer {
    pub fn new(base: ProducerBase) -> Self {
        Self {
            base,
            current: HashMap::new(),
            past: HashMap::new(),
            pending_finalized: Vec::new(),
        }
    }

    pub fn on_matched_event(&mut self, event: &Event, conditions: &ConditionNetwork) {
        let t = event.elapsed_ns;
        self.flush_if_needed(t);

        if !self.base.activation.is_active(t) {
            return;
        }
        if !self.base.gate_passes(event, conditions) {
            return;
        }

        for key in self.base.keys_for(event) {
            let known = self.current.contains_key(&key);
            if self.base.reject_new_key(self.current.len(), known) {
                continue;
            }
            *self.current.entry(key).or_insert(0) += 1;
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
            self.current.clear();
            self.base.record_skipped(split.start_ns, split.end_ns);
        } else {
            self.finalize_bucket(split.start_ns, split.end_ns);
        }
    }

    /// Moves the current counters into history. Zero-activity buckets
    /// produce no records.
    fn finalize_bucket(&mut self, start_ns: i64, end_ns: i64) {
        for (key, count) in self.current.drain() {
            if count == 0 {
                continue;
            }
            self.past
                .entry(key.clone())
                .or_default()
                .push(CountBucketInfo {
                    start_bucket_elapsed_ns: start_ns,
                    end_bucket_elapsed_ns: end_ns,
                    count,
                });
            self.pending_finalized.push(FinalizedBucket {
                metric_id: self.base.metric_id,
                key,
                value: count,
                bucket_end_ns: end_ns,
            });
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
        let mut merged: HashMap<DimensionKey, Vec<CountBucketInfo>> = self.past.clone();
        if include_current && dump_ns > self.base.buckets.current_start_ns() {
            for (key, count) in &self.current {
                if *count == 0 {
                    continue;
                }
                merged.entry(key.clone()).or_default().push(CountBucketInfo {
                    start_bucket_elapsed_ns: self.base.buckets.current_start_ns(),
                    end_bucket_elapsed_ns: dump_ns,
                    count: *count,
                });
            }
        }

        let mut entries: Vec<(DimensionKey, Vec<CountBucketInfo>)> = merged.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let data: Vec<DimensionData<CountBucketInfo>> = entries
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
                self.current.clear();
                self.base.buckets.restart_at(dump_ns);
            }
        }

        MetricData::Count { data, skipped }
    }
}
