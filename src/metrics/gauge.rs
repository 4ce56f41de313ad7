//! Gauge metric: captures snapshots of full or filtered field values at
//! qualifying events, per bucket, under a sampling policy.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::condition::{ConditionNetwork, ConditionState};
use crate::config::GaugeSampling;
use crate::dimension::DimensionKey;
use crate::event::{Event, FieldId, FieldValue, TagId};
use crate::report::{
    DimensionData, DimensionValue, FieldValueInfo, GaugeAtomInfo, GaugeBucketInfo, MetricData,
};

use super::ProducerBase;

/// One captured snapshot, held raw until dump time so string hashing can be
/// applied per report.
#[derive(Debug, Clone)]
struct GaugeAtom {
    elapsed_ns: i64,
    values: Vec<(FieldId, FieldValue)>,
}

#[derive(Debug)]
pub struct GaugeMetricProducer {
    pub(crate) base: ProducerBase,
    sampling: GaugeSampling,
    /// Field positions to capture; empty = all fields.
    fields: Vec<FieldId>,
    max_num_samples: u32,
    pull_tag: Option<TagId>,
    rng: StdRng,
    /// Samples seen this bucket per key, for reservoir choice.
    seen: HashMap<DimensionKey, u64>,
    current: HashMap<DimensionKey, Vec<GaugeAtom>>,
    past: HashMap<DimensionKey, Vec<GaugeBucketInfo>>,
    /// Armed by a condition-change-to-true; the next matched event is
    /// captured.
    capture_armed: bool,
}

impl GaugeMetricProducer {
    pub fn new(
        base: ProducerBase,
        sampling: GaugeSampling,
        fields: Vec<FieldId>,
        max_num_samples: u32,
        pull_tag: Option<TagId>,
    ) -> Self {
        Self {
            base,
            sampling,
            fields,
            max_num_samples,
            pull_tag,
            rng: StdRng::from_entropy(),
            seen: HashMap::new(),
            current: HashMap::new(),
            past: HashMap::new(),
            capture_armed: false,
        }
    }

    pub fn pull_tag(&self) -> Option<TagId> {
        self.pull_tag
    }

    pub fn on_condition_changed(&mut self, state: ConditionState, _now_ns: i64) {
        if self.sampling == GaugeSampling::ConditionChangeToTrue && state.is_true() {
            self.capture_armed = true;
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
        if self.sampling == GaugeSampling::ConditionChangeToTrue {
            if !self.capture_armed {
                return;
            }
            self.capture_armed = false;
        }

        let atom = self.snapshot(event);

        for key in self.base.keys_for(event) {
            let known = self.current.contains_key(&key);
            if self.base.reject_new_key(self.current.len(), known) {
                continue;
            }

            let samples = self.current.entry(key.clone()).or_default();
            match self.sampling {
                GaugeSampling::RandomOneSample => {
                    let seen = self.seen.entry(key).or_insert(0);
                    *seen += 1;
                    if samples.is_empty() {
                        samples.push(atom.clone());
                    } else if self.rng.gen_range(0..*seen) == 0 {
                        samples[0] = atom.clone();
                    }
                }
                GaugeSampling::FirstNSamples => {
                    if (samples.len() as u32) < self.max_num_samples {
                        samples.push(atom.clone());
                    }
                }
                GaugeSampling::ConditionChangeToTrue | GaugeSampling::All => {
                    if (samples.len() as u32) < self.max_num_samples {
                        samples.push(atom.clone());
                    }
                }
            }
        }
    }

    fn snapshot(&self, event: &Event) -> GaugeAtom {
        let values = event
            .fields()
            .filter(|(pos, _)| self.fields.is_empty() || self.fields.contains(pos))
            .map(|(pos, v)| (pos, v.clone()))
            .collect();
        GaugeAtom {
            elapsed_ns: event.elapsed_ns,
            values,
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
            self.seen.clear();
            self.base.record_skipped(split.start_ns, split.end_ns);
        } else {
            self.finalize_bucket(split.start_ns, split.end_ns);
        }
    }

    fn finalize_bucket(&mut self, start_ns: i64, end_ns: i64) {
        for (key, atoms) in self.current.drain() {
            if atoms.is_empty() {
                continue;
            }
            self.past.entry(key).or_default().push(GaugeBucketInfo {
                start_bucket_elapsed_ns: start_ns,
                end_bucket_elapsed_ns: end_ns,
                atoms: atoms.iter().map(|a| render_atom(a, false)).collect(),
            });
        }
        self.seen.clear();
    }

    pub fn on_dump(
        &mut self,
        dump_ns: i64,
        include_current: bool,
        erase: bool,
        hash_strings: bool,
    ) -> MetricData {
        let mut merged: HashMap<DimensionKey, Vec<GaugeBucketInfo>> = self.past.clone();
        if include_current && dump_ns > self.base.buckets.current_start_ns() {
            for (key, atoms) in &self.current {
                if atoms.is_empty() {
                    continue;
                }
                merged.entry(key.clone()).or_default().push(GaugeBucketInfo {
                    start_bucket_elapsed_ns: self.base.buckets.current_start_ns(),
                    end_bucket_elapsed_ns: dump_ns,
                    atoms: atoms.iter().map(|a| render_atom(a, hash_strings)).collect(),
                });
            }
        }

        let mut entries: Vec<(DimensionKey, Vec<GaugeBucketInfo>)> = merged.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let data: Vec<DimensionData<GaugeBucketInfo>> = entries
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
                self.seen.clear();
                self.base.buckets.restart_at(dump_ns);
            }
        }

        MetricData::Gauge { data, skipped }
    }
}

fn render_atom(atom: &GaugeAtom, hash_strings: bool) -> GaugeAtomInfo {
    GaugeAtomInfo {
        elapsed_ns: atom.elapsed_ns,
        values: atom
            .values
            .iter()
            .map(|(field, v)| FieldValueInfo {
                field: *field,
                value: render_field(v, hash_strings),
            })
            .collect(),
    }
}

fn render_field(v: &FieldValue, hash_strings: bool) -> DimensionValue {
    match v {
        FieldValue::Int(x) => DimensionValue::Int(*x),
        FieldValue::Long(x) => DimensionValue::Long(*x),
        FieldValue::Float(x) => DimensionValue::Float(*x),
        FieldValue::Bool(x) => DimensionValue::Bool(*x),
        FieldValue::Str(s) => {
            if hash_strings {
                DimensionValue::StrHash(crate::report::hash_string(s))
            } else {
                DimensionValue::Str(s.clone())
            }
        }
        FieldValue::Chain(nodes) => DimensionValue::Tuple(
            nodes
                .iter()
                .enumerate()
                .map(|(i, n)| crate::report::DimensionsValue {
                    field: i as FieldId + 1,
                    value: DimensionValue::Tuple(vec![
                        crate::report::DimensionsValue {
                            field: crate::event::CHAIN_FIELD_UID,
                            value: DimensionValue::Int(n.uid),
                        },
                        crate::report::DimensionsValue {
                            field: crate::event::CHAIN_FIELD_TAG,
                            value: if hash_strings {
                                DimensionValue::StrHash(crate::report::hash_string(&n.tag))
                            } else {
                                DimensionValue::Str(n.tag.clone())
                            },
                        },
                    ]),
                })
                .collect(),
        ),
    }
}
