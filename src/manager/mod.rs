//! Metrics manager: owns one config's matcher network, condition network,
//! metric producers, and anomaly trackers, all in flat arenas
//! cross-referenced by index. Routes each event through the networks in
//! dependency order and aggregates dump requests.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::anomaly::{AlertHandler, AnomalyAlert, AnomalyTracker};
use crate::condition::{ConditionNetwork, ConditionState};
use crate::config::{
    validate, ConfigError, ConfigKey, MetricActivationConfig, MetricConfig, MetricKind,
    PipelineConfig,
};
use crate::dimension::DimensionKey;
use crate::event::{Event, TagId};
use crate::matcher::MatcherNetwork;
use crate::metrics::activation::EventActivation;
use crate::metrics::{resolve_link, MetricProducer, ResolvedRefs};
use crate::report::{ConfigMetricsReport, DumpLatency, DumpReason, MetricReport};
use crate::time::NS_PER_SEC;

/// Lifecycle state of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Failed validation: rejects all events, produces empty reports.
    Invalid,
    /// Valid, but no metric is currently active.
    Inactive,
    /// Valid with at least one active metric.
    Active,
}

/// Event-routing statistics for one manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManagerStats {
    pub events_seen: u64,
    pub events_dropped_source: u64,
    pub events_dropped_invalid: u64,
}

struct BuiltParts {
    matchers: MatcherNetwork,
    conditions: ConditionNetwork,
    producers: Vec<MetricProducer>,
    metrics_by_matcher: Vec<Vec<usize>>,
    metrics_by_condition: Vec<Vec<usize>>,
    metrics_by_what_condition: Vec<Vec<usize>>,
    anomaly_trackers: Vec<AnomalyTracker>,
    trackers_by_metric: HashMap<i64, Vec<usize>>,
}

pub struct MetricsManager {
    key: ConfigKey,
    config: PipelineConfig,
    invalid: bool,
    created_ns: i64,
    ttl_expiry_ns: Option<i64>,
    last_report_ns: i64,
    allowed_sources: HashSet<u32>,
    no_report: HashSet<i64>,

    matchers: MatcherNetwork,
    conditions: ConditionNetwork,
    producers: Vec<MetricProducer>,

    /// matcher index -> producers whose `what` is that matcher.
    metrics_by_matcher: Vec<Vec<usize>>,
    /// condition index -> producers gated by that condition.
    metrics_by_condition: Vec<Vec<usize>>,
    /// condition index -> duration producers driven by that condition.
    metrics_by_what_condition: Vec<Vec<usize>>,

    anomaly_trackers: Vec<AnomalyTracker>,
    trackers_by_metric: HashMap<i64, Vec<usize>>,
    alert_handler: Option<AlertHandler>,

    stats: ManagerStats,
}

impl MetricsManager {
    /// Builds a manager for one config. A validation failure yields an
    /// Invalid manager: it rejects all events and produces empty reports,
    /// leaving other configs unaffected.
    pub fn new(
        key: ConfigKey,
        config: PipelineConfig,
        created_ns: i64,
        dimension_hard_limit: usize,
        alert_handler: Option<AlertHandler>,
    ) -> Self {
        let parts = validate(&config)
            .and_then(|()| Self::build_parts(&config, created_ns, dimension_hard_limit));

        let (parts, invalid) = match parts {
            Ok(parts) => (parts, false),
            Err(e) => {
                warn!(key = %key, error = %e, "config validation failed, manager marked invalid");
                (
                    BuiltParts {
                        matchers: MatcherNetwork::build(&[]).expect("empty network"),
                        conditions: ConditionNetwork::build(
                            &[],
                            &MatcherNetwork::build(&[]).expect("empty network"),
                        )
                        .expect("empty network"),
                        producers: Vec::new(),
                        metrics_by_matcher: Vec::new(),
                        metrics_by_condition: Vec::new(),
                        metrics_by_what_condition: Vec::new(),
                        anomaly_trackers: Vec::new(),
                        trackers_by_metric: HashMap::new(),
                    },
                    true,
                )
            }
        };

        let ttl_expiry_ns = config
            .ttl_secs
            .map(|ttl| created_ns + (ttl as i64) * NS_PER_SEC);

        Self {
            key,
            allowed_sources: config.allowed_log_sources.iter().copied().collect(),
            no_report: config.no_report_metrics.iter().copied().collect(),
            invalid,
            created_ns,
            ttl_expiry_ns,
            last_report_ns: created_ns,
            matchers: parts.matchers,
            conditions: parts.conditions,
            producers: parts.producers,
            metrics_by_matcher: parts.metrics_by_matcher,
            metrics_by_condition: parts.metrics_by_condition,
            metrics_by_what_condition: parts.metrics_by_what_condition,
            anomaly_trackers: parts.anomaly_trackers,
            trackers_by_metric: parts.trackers_by_metric,
            alert_handler,
            stats: ManagerStats::default(),
            config,
        }
    }

    fn build_parts(
        config: &PipelineConfig,
        created_ns: i64,
        dimension_hard_limit: usize,
    ) -> Result<BuiltParts, ConfigError> {
        let matchers = MatcherNetwork::build(&config.matchers)?;
        let conditions = ConditionNetwork::build(&config.conditions, &matchers)?;

        let mut producers = Vec::with_capacity(config.metrics.len());
        let mut metrics_by_matcher = vec![Vec::new(); matchers.len()];
        let mut metrics_by_condition = vec![Vec::new(); conditions.len()];
        let mut metrics_by_what_condition = vec![Vec::new(); conditions.len()];

        for (pi, m) in config.metrics.iter().enumerate() {
            let refs = Self::resolve_refs(m, &config.activations, &matchers, &conditions)?;

            if let Some(wm) = refs.what_matcher {
                metrics_by_matcher[wm].push(pi);
            }
            if let Some(wc) = refs.what_condition {
                metrics_by_what_condition[wc].push(pi);
            }
            if let Some(c) = refs.condition {
                metrics_by_condition[c].push(pi);
            }

            producers.push(MetricProducer::build(
                m,
                refs,
                created_ns,
                dimension_hard_limit,
            ));
        }

        let mut anomaly_trackers = Vec::with_capacity(config.alerts.len());
        let mut trackers_by_metric: HashMap<i64, Vec<usize>> = HashMap::new();
        for alert in &config.alerts {
            let bucket_ns = config
                .metrics
                .iter()
                .find(|m| m.id == alert.metric_id)
                .map(|m| m.bucket.ns())
                .unwrap_or_else(|| crate::config::TimeUnit::default().ns());
            trackers_by_metric
                .entry(alert.metric_id)
                .or_default()
                .push(anomaly_trackers.len());
            anomaly_trackers.push(AnomalyTracker::new(alert, bucket_ns));
        }

        Ok(BuiltParts {
            matchers,
            conditions,
            producers,
            metrics_by_matcher,
            metrics_by_condition,
            metrics_by_what_condition,
            anomaly_trackers,
            trackers_by_metric,
        })
    }

    fn resolve_refs(
        m: &MetricConfig,
        activations: &[MetricActivationConfig],
        matchers: &MatcherNetwork,
        conditions: &ConditionNetwork,
    ) -> Result<ResolvedRefs, ConfigError> {
        let mut refs = ResolvedRefs::default();

        match m.kind {
            MetricKind::Duration { .. } => {
                refs.what_condition =
                    Some(
                        conditions
                            .index_of(m.what)
                            .ok_or(ConfigError::DanglingReference {
                                kind: "metric",
                                from: m.id,
                                target_kind: "condition",
                                to: m.what,
                            })?,
                    );
            }
            _ => {
                refs.what_matcher =
                    Some(
                        matchers
                            .index_of(m.what)
                            .ok_or(ConfigError::DanglingReference {
                                kind: "metric",
                                from: m.id,
                                target_kind: "matcher",
                                to: m.what,
                            })?,
                    );
            }
        }

        if let Some(c) = m.condition {
            refs.condition = Some(conditions.index_of(c).ok_or(ConfigError::DanglingReference {
                kind: "metric",
                from: m.id,
                target_kind: "condition",
                to: c,
            })?);
        }

        if let Some(link_cfg) = &m.links {
            refs.link = Some(resolve_link(link_cfg));
        }

        if let Some(act) = activations.iter().find(|a| a.metric_id == m.id) {
            for ea in &act.activations {
                let matcher = matchers.index_of(ea.activation_matcher_id).ok_or(
                    ConfigError::DanglingReference {
                        kind: "activation",
                        from: m.id,
                        target_kind: "matcher",
                        to: ea.activation_matcher_id,
                    },
                )?;
                let deactivation = ea
                    .deactivation_matcher_id
                    .map(|d| {
                        matchers.index_of(d).ok_or(ConfigError::DanglingReference {
                            kind: "activation",
                            from: m.id,
                            target_kind: "matcher",
                            to: d,
                        })
                    })
                    .transpose()?;
                refs.activations.push(EventActivation {
                    matcher,
                    ttl_ns: (ea.ttl_secs as i64) * NS_PER_SEC,
                    deactivation_matcher: deactivation,
                    active_until_ns: None,
                });
            }
        }

        Ok(refs)
    }

    pub fn key(&self) -> ConfigKey {
        self.key
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn persist_locally(&self) -> bool {
        self.config.persist_locally
    }

    pub fn stats(&self) -> ManagerStats {
        self.stats
    }

    /// Lifecycle state at `now`.
    pub fn state(&self, now_ns: i64) -> ManagerState {
        if self.invalid {
            ManagerState::Invalid
        } else if self.producers.iter().any(|p| p.is_active(now_ns)) {
            ManagerState::Active
        } else {
            ManagerState::Inactive
        }
    }

    pub fn is_expired(&self, now_ns: i64) -> bool {
        self.ttl_expiry_ns.map(|t| now_ns >= t).unwrap_or(false)
    }

    /// Tags any producer wants pulled on bucket boundaries.
    pub fn pulled_tags(&self) -> Vec<TagId> {
        let mut tags: Vec<TagId> = self.producers.iter().filter_map(|p| p.pull_tag()).collect();
        tags.sort_unstable();
        tags.dedup();
        tags
    }

    /// Routes one event through the matcher network, condition network,
    /// and metric producers, in dependency order. Returns anomalies fired
    /// by bucket finalizations this event caused.
    pub fn on_event(&mut self, event: &Event) -> Vec<AnomalyAlert> {
        self.stats.events_seen += 1;

        if self.invalid {
            self.stats.events_dropped_invalid += 1;
            return Vec::new();
        }
        if !self.allowed_sources.is_empty() && !self.allowed_sources.contains(&event.source_uid) {
            self.stats.events_dropped_source += 1;
            return Vec::new();
        }
        if !self.matchers.interested_in(event.tag_id) {
            return Vec::new();
        }

        let t = event.elapsed_ns;
        let matched = self.matchers.matches(event);
        if !matched.any() {
            return Vec::new();
        }

        // Activation edges first, so this event's own aggregation already
        // sees the new activity window.
        for p in &mut self.producers {
            p.on_activation_event(&matched, t);
        }

        let cond_results = self.conditions.on_event(event, &matched);

        // Condition-change fanout, unsliced.
        for (c, changed) in cond_results.changed.iter().enumerate() {
            if !changed || self.conditions.is_sliced(c) {
                continue;
            }
            let state = self.conditions.state(c);
            for pi in self.metrics_by_condition[c].clone() {
                self.producers[pi].on_condition_changed(state, t);
            }
            let met = state.is_true();
            for pi in self.metrics_by_what_condition[c].clone() {
                self.producers[pi].on_what_changed(
                    &DimensionKey::empty(),
                    met,
                    t,
                    &self.conditions,
                );
            }
        }

        // Per-key transitions of sliced conditions.
        for sc in &cond_results.sliced_changes {
            for pi in self.metrics_by_what_condition[sc.condition].clone() {
                self.producers[pi].on_what_changed(&sc.key, sc.met, t, &self.conditions);
            }
            for pi in self.metrics_by_condition[sc.condition].clone() {
                self.producers[pi].on_sliced_condition_changed(&sc.key, sc.met, t);
            }
        }

        // Matched-event fanout to the producers whose what fired.
        for (m, hit) in matched.matched.iter().enumerate() {
            if !hit {
                continue;
            }
            for pi in self.metrics_by_matcher[m].clone() {
                self.producers[pi].on_matched_event(event, &self.conditions);
            }
        }

        self.route_finalized_buckets()
    }

    /// Feeds buckets finalized since the last drain into the anomaly
    /// trackers watching their metrics.
    fn route_finalized_buckets(&mut self) -> Vec<AnomalyAlert> {
        let mut alerts = Vec::new();
        for p in &mut self.producers {
            for fb in p.drain_finalized() {
                let Some(tracker_idxs) = self.trackers_by_metric.get(&fb.metric_id) else {
                    continue;
                };
                for &ti in tracker_idxs {
                    if let Some(alert) = self.anomaly_trackers[ti].on_bucket_finalized(
                        &fb.key,
                        fb.value,
                        fb.bucket_end_ns,
                    ) {
                        if let Some(handler) = &self.alert_handler {
                            handler(&alert);
                        }
                        alerts.push(alert);
                    }
                }
            }
        }
        alerts
    }

    /// Periodic housekeeping: TTL-lapsed activations and overdue bucket
    /// rollovers, then anomaly routing.
    pub fn flush_if_needed(&mut self, now_ns: i64) -> Vec<AnomalyAlert> {
        if self.invalid {
            return Vec::new();
        }
        for p in &mut self.producers {
            p.refresh_activation(now_ns);
            p.flush_if_needed(now_ns);
        }
        self.route_finalized_buckets()
    }

    /// Forces a bucket split at the upgrade/removal timestamp in every
    /// producer.
    pub fn on_app_upgrade(&mut self, at_ns: i64) {
        if self.invalid {
            return;
        }
        debug!(key = %self.key, at_ns, "forcing bucket split for app change");
        for p in &mut self.producers {
            p.force_bucket_split(at_ns);
        }
        // Splits finalize buckets; anomalies still apply.
        let _ = self.route_finalized_buckets();
    }

    /// Produces this config's report. An invalid manager reports no
    /// metrics. `include_strings = false` hashes string values even when
    /// the config did not ask for hashing.
    #[allow(clippy::too_many_arguments)]
    pub fn dump_report(
        &mut self,
        dump_elapsed_ns: i64,
        dump_wall_ns: i64,
        include_current: bool,
        erase: bool,
        include_strings: bool,
        reason: DumpReason,
        latency: DumpLatency,
    ) -> ConfigMetricsReport {
        let mut metrics = Vec::new();
        if !self.invalid {
            let hash_strings = self.config.hash_strings_in_report || !include_strings;
            for p in &mut self.producers {
                let id = p.metric_id();
                if self.no_report.contains(&id) {
                    continue;
                }
                let data = p.on_dump(dump_elapsed_ns, include_current, erase, hash_strings);
                if !data.is_empty() {
                    metrics.push(MetricReport {
                        metric_id: id,
                        data,
                    });
                }
            }
        }

        let report = ConfigMetricsReport {
            current_report_elapsed_ns: dump_elapsed_ns,
            last_report_elapsed_ns: self.last_report_ns,
            current_report_wall_clock_ns: dump_wall_ns,
            dump_reason: reason,
            dump_latency: latency,
            metrics,
        };
        if erase {
            self.last_report_ns = dump_elapsed_ns;
        }
        report
    }

    /// Refractory snapshots per alert, elapsed-seconds timeline.
    pub fn snapshot_refractory(&self) -> Vec<(i64, Vec<(DimensionKey, i64)>)> {
        self.anomaly_trackers
            .iter()
            .map(|t| (t.alert_id(), t.snapshot_refractory()))
            .collect()
    }

    /// Restores refractory ends (already rebased to this process's elapsed
    /// timeline) into the matching alert trackers.
    pub fn restore_refractory(&mut self, alerts: Vec<(i64, Vec<(DimensionKey, i64)>)>) {
        for (alert_id, entries) in alerts {
            if let Some(tracker) = self
                .anomaly_trackers
                .iter_mut()
                .find(|t| t.alert_id() == alert_id)
            {
                tracker.restore_refractory(entries);
            }
        }
    }

    /// Modular config update: matchers, conditions, and metrics whose
    /// definitions (and transitive dependencies) are unchanged keep their
    /// accumulated state; everything else is rebuilt.
    pub fn modular_update(
        mut self,
        new_config: PipelineConfig,
        now_ns: i64,
        dimension_hard_limit: usize,
    ) -> MetricsManager {
        let alert_handler = self.alert_handler.take();
        let unchanged = if self.invalid {
            UnchangedElements::default()
        } else {
            unchanged_elements(&self.config, &new_config)
        };

        let mut next = MetricsManager::new(
            self.key,
            new_config,
            now_ns,
            dimension_hard_limit,
            alert_handler,
        );
        if next.invalid {
            return next;
        }

        // Carry condition truth state for unchanged trackers so gated
        // metrics keep seeing the world they left off in.
        next.conditions
            .carry_state_from(&self.conditions, &unchanged.conditions);

        // Carry preserved producers across, re-pointing their indices into
        // the new arenas.
        let mut old_by_id: HashMap<i64, MetricProducer> = self
            .producers
            .drain(..)
            .map(|p| (p.metric_id(), p))
            .collect();

        for (pi, m) in next.config.metrics.clone().iter().enumerate() {
            if !unchanged.metrics.contains(&m.id) {
                continue;
            }
            let Some(mut preserved) = old_by_id.remove(&m.id) else {
                continue;
            };
            if let Ok(refs) = Self::resolve_refs(
                m,
                &next.config.activations,
                &next.matchers,
                &next.conditions,
            ) {
                preserved.rebind(&refs);
                next.producers[pi] = preserved;
            }
        }

        // Carry preserved anomaly trackers (window + refractory state).
        let mut old_trackers: HashMap<i64, AnomalyTracker> = self
            .anomaly_trackers
            .drain(..)
            .map(|t| (t.alert_id(), t))
            .collect();
        for tracker in next.anomaly_trackers.iter_mut() {
            if unchanged.alerts.contains(&tracker.alert_id()) {
                if let Some(preserved) = old_trackers.remove(&tracker.alert_id()) {
                    *tracker = preserved;
                }
            }
        }

        debug!(
            key = %next.key,
            preserved_metrics = unchanged.metrics.len(),
            preserved_alerts = unchanged.alerts.len(),
            "modular config update applied"
        );
        next
    }
}

/// Element ids that survive a modular update with state intact.
#[derive(Debug, Default)]
struct UnchangedElements {
    conditions: HashSet<i64>,
    metrics: HashSet<i64>,
    alerts: HashSet<i64>,
}

/// Computes which elements survive a modular update with their state
/// intact: the definition must be byte-identical and every transitively
/// referenced matcher/condition definition unchanged too.
fn unchanged_elements(old: &PipelineConfig, new: &PipelineConfig) -> UnchangedElements {
    let old_matchers: HashMap<i64, _> = old.matchers.iter().map(|m| (m.id, m)).collect();
    let old_conditions: HashMap<i64, _> = old.conditions.iter().map(|c| (c.id, c)).collect();
    let old_metrics: HashMap<i64, _> = old.metrics.iter().map(|m| (m.id, m)).collect();
    let old_alerts: HashMap<i64, _> = old.alerts.iter().map(|a| (a.id, a)).collect();

    // Fixpoint over matcher equality: a combination is unchanged only if
    // all of its children are.
    let mut matcher_ok: HashSet<i64> = new
        .matchers
        .iter()
        .filter(|m| old_matchers.get(&m.id).map(|o| *o == *m).unwrap_or(false))
        .map(|m| m.id)
        .collect();
    loop {
        let next: HashSet<i64> = new
            .matchers
            .iter()
            .filter(|m| matcher_ok.contains(&m.id))
            .filter(|m| match &m.kind {
                crate::config::MatcherKind::Simple { .. } => true,
                crate::config::MatcherKind::Combination { matcher_ids, .. } => {
                    matcher_ids.iter().all(|r| matcher_ok.contains(r))
                }
            })
            .map(|m| m.id)
            .collect();
        if next.len() == matcher_ok.len() {
            break;
        }
        matcher_ok = next;
    }

    let mut condition_ok: HashSet<i64> = new
        .conditions
        .iter()
        .filter(|c| {
            old_conditions
                .get(&c.id)
                .map(|o| *o == *c)
                .unwrap_or(false)
        })
        .map(|c| c.id)
        .collect();
    loop {
        let next: HashSet<i64> = new
            .conditions
            .iter()
            .filter(|c| condition_ok.contains(&c.id))
            .filter(|c| match &c.kind {
                crate::config::ConditionKind::Simple {
                    start,
                    stop,
                    stop_all,
                    ..
                } => [Some(*start), *stop, *stop_all]
                    .into_iter()
                    .flatten()
                    .all(|m| matcher_ok.contains(&m)),
                crate::config::ConditionKind::Combination { condition_ids, .. } => {
                    condition_ids.iter().all(|r| condition_ok.contains(r))
                }
            })
            .map(|c| c.id)
            .collect();
        if next.len() == condition_ok.len() {
            break;
        }
        condition_ok = next;
    }

    let activation_for = |cfg: &PipelineConfig, metric_id: i64| -> Option<MetricActivationConfig> {
        cfg.activations
            .iter()
            .find(|a| a.metric_id == metric_id)
            .cloned()
    };

    let metric_ok: HashSet<i64> = new
        .metrics
        .iter()
        .filter(|m| {
            let Some(old_m) = old_metrics.get(&m.id) else {
                return false;
            };
            if *old_m != *m {
                return false;
            }
            let what_ok = match m.kind {
                MetricKind::Duration { .. } => condition_ok.contains(&m.what),
                _ => matcher_ok.contains(&m.what),
            };
            let cond_ok = m.condition.map(|c| condition_ok.contains(&c)).unwrap_or(true);
            let act_old = activation_for(old, m.id);
            let act_new = activation_for(new, m.id);
            let act_ok = act_old == act_new
                && act_new
                    .map(|a| {
                        a.activations.iter().all(|ea| {
                            matcher_ok.contains(&ea.activation_matcher_id)
                                && ea
                                    .deactivation_matcher_id
                                    .map(|d| matcher_ok.contains(&d))
                                    .unwrap_or(true)
                        })
                    })
                    .unwrap_or(true);
            what_ok && cond_ok && act_ok
        })
        .map(|m| m.id)
        .collect();

    let alert_ok: HashSet<i64> = new
        .alerts
        .iter()
        .filter(|a| {
            old_alerts.get(&a.id).map(|o| *o == *a).unwrap_or(false)
                && metric_ok.contains(&a.metric_id)
        })
        .map(|a| a.id)
        .collect();

    UnchangedElements {
        conditions: condition_ok,
        metrics: metric_ok,
        alerts: alert_ok,
    }
}
