//! Metric producers: the four aggregation kinds behind one dispatch
//! contract. Kind-specific aggregate state lives behind a closed variant,
//! not a trait object, so cross-references stay index-based and the
//! dispatch paths stay monomorphic.

pub mod activation;
pub mod bucket;
pub mod count;
pub mod duration;
pub mod gauge;
pub mod value;

use tracing::warn;

use crate::condition::{ConditionNetwork, ConditionState};
use crate::config::{MetricConfig, MetricKind};
use crate::dimension::{
    extract_keys, flatten_leaves, project_key, DimensionKey, FieldMatcher, LeafPath,
};
use crate::event::{Event, TagId};
use crate::matcher::MatcherResults;
use crate::report::{DimensionsValue, MetricData, SkippedInterval};

use self::activation::{ActivationState, EventActivation};
use self::bucket::BucketState;
use self::count::CountMetricProducer;
use self::duration::DurationMetricProducer;
use self::gauge::GaugeMetricProducer;
use self::value::ValueMetricProducer;

/// A bucket finalized by a producer, routed to the anomaly trackers after
/// the dispatch pass completes.
#[derive(Debug, Clone)]
pub struct FinalizedBucket {
    pub metric_id: i64,
    pub key: DimensionKey,
    pub value: i64,
    pub bucket_end_ns: i64,
}

/// A resolved metric-to-condition dimension link.
#[derive(Debug, Clone)]
pub struct ConditionLink {
    /// Trees extracting the condition key from a triggering event.
    pub fields_in_condition: Vec<FieldMatcher>,
    /// Flattened metric-side leaves, paired positionally with
    /// `cond_leaves` for key projection.
    pub what_leaves: Vec<LeafPath>,
    pub cond_leaves: Vec<LeafPath>,
}

/// Cross-references of one metric, resolved to arena indices by the
/// manager at build time.
#[derive(Debug, Clone, Default)]
pub struct ResolvedRefs {
    /// `what` matcher index (count/value/gauge).
    pub what_matcher: Option<usize>,
    /// `what` condition index (duration).
    pub what_condition: Option<usize>,
    /// Gating condition index.
    pub condition: Option<usize>,
    pub link: Option<ConditionLink>,
    pub activations: Vec<EventActivation>,
}

/// State common to every producer kind.
#[derive(Debug, Clone)]
pub(crate) struct ProducerBase {
    pub metric_id: i64,
    pub buckets: BucketState,
    pub condition: Option<usize>,
    pub link: Option<ConditionLink>,
    pub dimensions: Vec<FieldMatcher>,
    pub activation: ActivationState,
    pub skipped: Vec<SkippedInterval>,
    pub dimension_hard_limit: usize,
    limit_warned: bool,
}

impl ProducerBase {
    pub fn new(
        metric_id: i64,
        buckets: BucketState,
        refs: &ResolvedRefs,
        dimensions: Vec<FieldMatcher>,
        dimension_hard_limit: usize,
    ) -> Self {
        Self {
            metric_id,
            buckets,
            condition: refs.condition,
            link: refs.link.clone(),
            dimensions,
            activation: ActivationState::new(refs.activations.clone()),
            skipped: Vec::new(),
            dimension_hard_limit,
            limit_warned: false,
        }
    }

    /// Whether the gating condition passes for this event. Linked metrics
    /// extract the condition key from the triggering event; unlinked
    /// metrics are gated by the condition's unsliced value.
    pub fn gate_passes(&self, event: &Event, conditions: &ConditionNetwork) -> bool {
        let Some(c) = self.condition else {
            return true;
        };
        let state = match &self.link {
            Some(link) => {
                let keys = extract_keys(event, &link.fields_in_condition);
                match keys.first() {
                    Some(key) => conditions.query(c, key),
                    // Malformed fields: the event is excluded from this
                    // metric only.
                    None => ConditionState::False,
                }
            }
            None => conditions.state(c),
        };
        state.is_true()
    }

    /// Dimension keys for this event; unsliced metrics aggregate under the
    /// empty key. An extraction failure excludes the event.
    pub fn keys_for(&self, event: &Event) -> Vec<DimensionKey> {
        if self.dimensions.is_empty() {
            vec![DimensionKey::empty()]
        } else {
            extract_keys(event, &self.dimensions)
        }
    }

    /// Soft cardinality cap: rejects aggregation under keys beyond the
    /// limit, warning once per producer.
    pub fn reject_new_key(&mut self, current_len: usize, key_known: bool) -> bool {
        if key_known || current_len < self.dimension_hard_limit {
            return false;
        }
        if !self.limit_warned {
            warn!(
                metric_id = self.metric_id,
                limit = self.dimension_hard_limit,
                "dimension key limit reached, dropping new keys"
            );
            self.limit_warned = true;
        }
        true
    }

    /// Condition-side dimensions for the report, projected through the
    /// link from a metric-side key.
    pub fn condition_dimensions(
        &self,
        key: &DimensionKey,
        hash_strings: bool,
    ) -> Option<Vec<DimensionsValue>> {
        let link = self.link.as_ref()?;
        let projected = project_key(key, &link.what_leaves, &link.cond_leaves);
        if projected.is_empty() {
            return None;
        }
        Some(crate::report::dimensions_from_key(&projected, hash_strings))
    }

    pub fn record_skipped(&mut self, start_ns: i64, end_ns: i64) {
        self.skipped.push(SkippedInterval {
            start_elapsed_ns: start_ns,
            end_elapsed_ns: end_ns,
        });
    }

    pub fn take_skipped(&mut self, erase: bool) -> Vec<SkippedInterval> {
        if erase {
            std::mem::take(&mut self.skipped)
        } else {
            self.skipped.clone()
        }
    }
}

/// One configured metric's producer.
#[derive(Debug)]
pub enum MetricProducer {
    Count(CountMetricProducer),
    Duration(DurationMetricProducer),
    Value(ValueMetricProducer),
    Gauge(GaugeMetricProducer),
}

impl MetricProducer {
    /// Builds a producer from its config and resolved references.
    pub fn build(
        cfg: &MetricConfig,
        refs: ResolvedRefs,
        origin_ns: i64,
        dimension_hard_limit: usize,
    ) -> Self {
        let min_bucket_ns = cfg
            .min_bucket_size
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        let buckets = BucketState::new(origin_ns, cfg.bucket.ns(), min_bucket_ns);
        let base = ProducerBase::new(
            cfg.id,
            buckets,
            &refs,
            cfg.dimensions.clone(),
            dimension_hard_limit,
        );

        match &cfg.kind {
            MetricKind::Count => Self::Count(CountMetricProducer::new(base)),
            MetricKind::Duration { aggregation } => Self::Duration(DurationMetricProducer::new(
                base,
                refs.what_condition.unwrap_or(usize::MAX),
                *aggregation,
            )),
            MetricKind::Value {
                value_field,
                use_diff,
                use_absolute_value_on_reset,
                skip_zero_diff_output,
                pull_tag_id,
            } => Self::Value(ValueMetricProducer::new(
                base,
                *value_field,
                *use_diff,
                *use_absolute_value_on_reset,
                *skip_zero_diff_output,
                *pull_tag_id,
            )),
            MetricKind::Gauge {
                sampling,
                fields,
                max_num_samples,
                pull_tag_id,
            } => Self::Gauge(GaugeMetricProducer::new(
                base,
                *sampling,
                fields.clone(),
                *max_num_samples,
                *pull_tag_id,
            )),
        }
    }

    pub fn metric_id(&self) -> i64 {
        self.base().metric_id
    }

    fn base(&self) -> &ProducerBase {
        match self {
            Self::Count(p) => &p.base,
            Self::Duration(p) => &p.base,
            Self::Value(p) => &p.base,
            Self::Gauge(p) => &p.base,
        }
    }

    fn base_mut(&mut self) -> &mut ProducerBase {
        match self {
            Self::Count(p) => &mut p.base,
            Self::Duration(p) => &mut p.base,
            Self::Value(p) => &mut p.base,
            Self::Gauge(p) => &mut p.base,
        }
    }

    /// Tag this producer wants pulled on bucket boundaries, if any.
    pub fn pull_tag(&self) -> Option<TagId> {
        match self {
            Self::Value(p) => p.pull_tag(),
            Self::Gauge(p) => p.pull_tag(),
            _ => None,
        }
    }

    pub fn is_active(&self, now_ns: i64) -> bool {
        self.base().activation.is_active(now_ns)
    }

    /// Index of the duration `what` condition, if this is a duration
    /// metric.
    pub fn what_condition(&self) -> Option<usize> {
        match self {
            Self::Duration(p) => Some(p.what()),
            _ => None,
        }
    }

    /// Gating condition index, if any.
    pub fn condition(&self) -> Option<usize> {
        self.base().condition
    }

    /// Re-points arena indices after a modular config update that preserved
    /// this producer. The definitions behind the indices are unchanged by
    /// contract; only their positions may have moved.
    pub fn rebind(&mut self, refs: &ResolvedRefs) {
        if let Self::Duration(p) = self {
            if let Some(what) = refs.what_condition {
                p.set_what(what);
            }
        }
        let base = self.base_mut();
        base.condition = refs.condition;
        base.link = refs.link.clone();
        base.activation.rebind(refs.activations.clone());
    }

    /// Applies activation/deactivation matcher firings, splitting buckets
    /// at the transition instant.
    pub fn on_activation_event(&mut self, matched: &MatcherResults, now_ns: i64) {
        let Some(transition) = self.base_mut().activation.on_event(matched, now_ns) else {
            return;
        };
        self.apply_activation_transition(transition.became_active, transition.at_ns);
    }

    /// Checks for a TTL lapse without an event (driven by the periodic
    /// tick).
    pub fn refresh_activation(&mut self, now_ns: i64) {
        let Some(transition) = self.base_mut().activation.refresh(now_ns) else {
            return;
        };
        self.apply_activation_transition(transition.became_active, transition.at_ns);
    }

    fn apply_activation_transition(&mut self, became_active: bool, at_ns: i64) {
        if became_active {
            // Nothing accumulated while inactive; restart the bucket at the
            // activation instant so consumers see the transition boundary.
            let at = crate::time::truncate_to_ms(at_ns);
            self.base_mut().buckets.restart_at(at);
        } else {
            self.force_bucket_split(at_ns);
        }
    }

    pub fn on_matched_event(&mut self, event: &Event, conditions: &ConditionNetwork) {
        match self {
            Self::Count(p) => p.on_matched_event(event, conditions),
            Self::Duration(_) => {} // driven by its what-condition
            Self::Value(p) => p.on_matched_event(event, conditions),
            Self::Gauge(p) => p.on_matched_event(event, conditions),
        }
    }

    /// Unsliced gating-condition change.
    pub fn on_condition_changed(&mut self, state: ConditionState, now_ns: i64) {
        match self {
            Self::Duration(p) => p.on_gate_changed(state.is_true(), now_ns),
            Self::Gauge(p) => p.on_condition_changed(state, now_ns),
            _ => {}
        }
    }

    /// Per-key gating-condition change (sliced gate reached via links).
    pub fn on_sliced_condition_changed(&mut self, cond_key: &DimensionKey, met: bool, now_ns: i64) {
        match self {
            Self::Duration(p) => p.on_gate_sliced_changed(cond_key, met, now_ns),
            Self::Gauge(p) => {
                if met {
                    p.on_condition_changed(ConditionState::True, now_ns);
                }
            }
            _ => {}
        }
    }

    /// Per-key change of a duration metric's what-condition.
    pub fn on_what_changed(
        &mut self,
        key: &DimensionKey,
        met: bool,
        now_ns: i64,
        conditions: &ConditionNetwork,
    ) {
        if let Self::Duration(p) = self {
            p.on_what_changed(key, met, now_ns, conditions);
        }
    }

    pub fn flush_if_needed(&mut self, now_ns: i64) {
        match self {
            Self::Count(p) => p.flush_if_needed(now_ns),
            Self::Duration(p) => p.flush_if_needed(now_ns),
            Self::Value(p) => p.flush_if_needed(now_ns),
            Self::Gauge(p) => p.flush_if_needed(now_ns),
        }
    }

    /// Cuts the current bucket at a forced boundary (app upgrade/removal,
    /// activation edge, TTL expiry).
    pub fn force_bucket_split(&mut self, at_ns: i64) {
        match self {
            Self::Count(p) => p.force_bucket_split(at_ns),
            Self::Duration(p) => p.force_bucket_split(at_ns),
            Self::Value(p) => p.force_bucket_split(at_ns),
            Self::Gauge(p) => p.force_bucket_split(at_ns),
        }
    }

    /// Buckets finalized since the last drain, for anomaly evaluation.
    pub fn drain_finalized(&mut self) -> Vec<FinalizedBucket> {
        match self {
            Self::Count(p) => p.drain_finalized(),
            Self::Duration(p) => p.drain_finalized(),
            Self::Value(p) => p.drain_finalized(),
            Self::Gauge(_) => Vec::new(),
        }
    }

    /// Serializes this producer's data. `include_current` folds the
    /// in-progress bucket in as a partial `[start, dump)` interval; `erase`
    /// clears flushed history afterwards.
    pub fn on_dump(
        &mut self,
        dump_ns: i64,
        include_current: bool,
        erase: bool,
        hash_strings: bool,
    ) -> MetricData {
        match self {
            Self::Count(p) => p.on_dump(dump_ns, include_current, erase, hash_strings),
            Self::Duration(p) => p.on_dump(dump_ns, include_current, erase, hash_strings),
            Self::Value(p) => p.on_dump(dump_ns, include_current, erase, hash_strings),
            Self::Gauge(p) => p.on_dump(dump_ns, include_current, erase, hash_strings),
        }
    }
}

/// Builds the resolved link for a metric config, flattening both sides.
pub fn resolve_link(cfg: &crate::config::MetricConditionLinkConfig) -> ConditionLink {
    ConditionLink {
        fields_in_condition: cfg.fields_in_condition.clone(),
        what_leaves: flatten_leaves(&cfg.fields_in_what),
        cond_leaves: flatten_leaves(&cfg.fields_in_condition),
    }
}
