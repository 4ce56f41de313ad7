//! Processor: the top-level orchestrator. Owns one metrics manager per
//! config key behind a single coarse mutex, fans events out to them,
//! drives periodic alarms, TTL sweeps and pull schedules, serializes dump
//! reports, and persists carry-over state.
//!
//! All mutable pipeline state is guarded by one mutex: conditions and
//! metrics cross-reference each other by index inside a manager, so
//! finer-grained locking has no safe seam. Pull I/O runs outside the lock;
//! pulled results re-enter the dispatch path as ordinary events.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::anomaly::alarm::{Alarm, AlarmMonitor, PeriodicAlarmTracker};
use crate::anomaly::AlertHandler;
use crate::config::{Config, ConfigKey, PipelineConfig};
use crate::event::{Event, TagId};
use crate::export::health::HealthMetrics;
use crate::manager::{ManagerState, MetricsManager};
use crate::puller::{rebase_events, PullStats, PullerRegistry};
use crate::report::{ConfigMetricsReport, ConfigMetricsReportList, DumpLatency, DumpReason};
use crate::storage::{
    elapsed_to_wall_sec, load_metadata, save_metadata, wall_to_elapsed_sec, PersistedAlert,
    PersistedConfig, PersistedMetadata,
};
use crate::time::{ns_to_secs, NS_PER_SEC};

/// Pulls arriving within this window after their scheduled boundary are
/// attributed to the bucket they were intended for.
const PULL_TOLERANCE_NS: i64 = NS_PER_SEC;

/// Callback invoked when the set of active config ids for a uid changes.
pub type BroadcastFn = Box<dyn Fn(u32, Vec<i64>) + Send + Sync>;

/// Options shaping one dump request.
#[derive(Debug, Clone, Copy)]
pub struct DumpOptions {
    pub include_current_bucket: bool,
    /// When false, string values are hashed even if the config did not ask
    /// for hashing.
    pub include_strings: bool,
    /// Clear flushed history after the dump.
    pub erase_data: bool,
    pub reason: DumpReason,
    pub latency: DumpLatency,
}

/// A periodic alarm that came due, reported to the external subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodicFired {
    pub key: ConfigKey,
    pub alarm_id: i64,
    /// Number of periods that logically fired (catch-up included).
    pub periods: u32,
}

struct PullSchedule {
    key: ConfigKey,
    tag: TagId,
    period_ns: i64,
}

struct Inner {
    managers: HashMap<ConfigKey, MetricsManager>,
    /// Uids with a prior installed record; app upgrades split buckets only
    /// for these.
    known_uids: HashSet<u32>,
    periodic: Vec<(ConfigKey, PeriodicAlarmTracker)>,
    pull_alarms: AlarmMonitor,
    pull_schedules: HashMap<u64, PullSchedule>,
    next_pull_alarm_id: u64,
    /// Last-broadcast active config ids per uid.
    active_ids: HashMap<u32, Vec<i64>>,
    broadcast: Option<BroadcastFn>,
    alert_handler: Option<AlertHandler>,
    /// Finished reports retained for configs with persist_locally.
    saved_reports: HashMap<ConfigKey, Vec<ConfigMetricsReport>>,
}

/// The metrics pipeline entry point. All methods are safe to call from any
/// thread; each entry point serializes on the internal mutex.
pub struct Processor {
    inner: Mutex<Inner>,
    puller: Arc<PullerRegistry>,
    health: Option<Arc<HealthMetrics>>,
    dimension_hard_limit: usize,
    metadata_path: PathBuf,
}

impl Processor {
    pub fn new(cfg: &Config, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                managers: HashMap::new(),
                known_uids: HashSet::new(),
                periodic: Vec::new(),
                pull_alarms: AlarmMonitor::new(),
                pull_schedules: HashMap::new(),
                next_pull_alarm_id: 1,
                active_ids: HashMap::new(),
                broadcast: None,
                alert_handler: None,
                saved_reports: HashMap::new(),
            }),
            puller: Arc::new(PullerRegistry::new(cfg.puller.clone())),
            health,
            dimension_hard_limit: cfg.dimension_hard_limit,
            metadata_path: cfg.storage.metadata_path.clone(),
        }
    }

    pub fn puller(&self) -> Arc<PullerRegistry> {
        Arc::clone(&self.puller)
    }

    /// Registers the handler invoked when anomalies fire. Applies to
    /// managers installed after this call.
    pub fn set_alert_handler(&self, handler: AlertHandler) {
        self.inner.lock().alert_handler = Some(handler);
    }

    /// Registers the active-config-set broadcast callback.
    pub fn set_broadcast(&self, broadcast: BroadcastFn) {
        self.inner.lock().broadcast = Some(broadcast);
    }

    /// Read-only pull diagnostics for one tag.
    pub fn pull_stats(&self, tag: TagId) -> Option<PullStats> {
        self.puller.stats(tag)
    }

    /// Routes one event to every manager whose source filter accepts it.
    pub fn on_log_event(&self, event: &Event) {
        let mut inner = self.inner.lock();
        if let Some(h) = &self.health {
            h.events_received.inc();
        }

        let mut anomalies = 0u64;
        for manager in inner.managers.values_mut() {
            anomalies += manager.on_event(event).len() as u64;
        }
        if anomalies > 0 {
            if let Some(h) = &self.health {
                h.anomalies_fired.inc_by(anomalies as f64);
            }
        }

        Self::broadcast_changes(&mut inner, event.elapsed_ns);
        self.update_health_gauges(&inner, event.elapsed_ns);
    }

    /// Installs or replaces the config under `key`. A modular update
    /// preserves unchanged elements' aggregate state; a full update tears
    /// the old manager down, flushing its data to a final report first.
    pub fn on_config_updated(
        &self,
        timestamp_ns: i64,
        wall_clock_ns: i64,
        key: ConfigKey,
        config: PipelineConfig,
        modular: bool,
    ) {
        let mut inner = self.inner.lock();
        let handler = inner.alert_handler.clone();

        let manager = match inner.managers.remove(&key) {
            Some(old) if modular => {
                old.modular_update(config, timestamp_ns, self.dimension_hard_limit)
            }
            Some(mut old) => {
                let report = old.dump_report(
                    timestamp_ns,
                    wall_clock_ns,
                    true,
                    true,
                    true,
                    DumpReason::ConfigUpdated,
                    DumpLatency::Immediate,
                );
                if old.persist_locally() {
                    inner.saved_reports.entry(key).or_default().push(report);
                }
                MetricsManager::new(
                    key,
                    config,
                    timestamp_ns,
                    self.dimension_hard_limit,
                    handler,
                )
            }
            None => MetricsManager::new(
                key,
                config,
                timestamp_ns,
                self.dimension_hard_limit,
                handler,
            ),
        };

        info!(key = %key, modular, state = ?manager.state(timestamp_ns), "config installed");

        Self::reschedule_for_key(&mut inner, &manager, key, timestamp_ns, wall_clock_ns);
        inner.managers.insert(key, manager);

        Self::broadcast_changes(&mut inner, timestamp_ns);
        self.update_health_gauges(&inner, timestamp_ns);
    }

    /// Removes the config under `key`, flushing a final report.
    pub fn on_config_removed(&self, key: ConfigKey, timestamp_ns: i64, wall_clock_ns: i64) {
        let mut inner = self.inner.lock();
        self.remove_manager(
            &mut inner,
            key,
            timestamp_ns,
            wall_clock_ns,
            DumpReason::ConfigRemoved,
        );
        Self::broadcast_changes(&mut inner, timestamp_ns);
        self.update_health_gauges(&inner, timestamp_ns);
    }

    fn remove_manager(
        &self,
        inner: &mut Inner,
        key: ConfigKey,
        timestamp_ns: i64,
        wall_clock_ns: i64,
        reason: DumpReason,
    ) {
        let Some(mut manager) = inner.managers.remove(&key) else {
            return;
        };
        let report = manager.dump_report(
            timestamp_ns,
            wall_clock_ns,
            true,
            true,
            true,
            reason,
            DumpLatency::Immediate,
        );
        if manager.persist_locally() {
            inner.saved_reports.entry(key).or_default().push(report);
        }

        inner.periodic.retain(|(k, _)| *k != key);
        let stale: Vec<u64> = inner
            .pull_schedules
            .iter()
            .filter(|(_, s)| s.key == key)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            inner.pull_schedules.remove(&id);
            inner.pull_alarms.cancel(id);
        }

        info!(key = %key, reason = ?reason, "config removed");
    }

    fn reschedule_for_key(
        inner: &mut Inner,
        manager: &MetricsManager,
        key: ConfigKey,
        now_elapsed_ns: i64,
        now_wall_ns: i64,
    ) {
        inner.periodic.retain(|(k, _)| *k != key);
        for alarm in &manager.config().periodic_alarms {
            inner.periodic.push((
                key,
                PeriodicAlarmTracker::new(
                    alarm.id,
                    (alarm.offset_millis as i64) * 1_000_000,
                    (alarm.period_millis as i64) * 1_000_000,
                    now_wall_ns,
                ),
            ));
        }

        let stale: Vec<u64> = inner
            .pull_schedules
            .iter()
            .filter(|(_, s)| s.key == key)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            inner.pull_schedules.remove(&id);
            inner.pull_alarms.cancel(id);
        }

        // One pull alarm per pulled tag, at the smallest bucket period any
        // of the key's metrics uses for that tag.
        let mut period_by_tag: HashMap<TagId, i64> = HashMap::new();
        for m in &manager.config().metrics {
            let pull_tag = match &m.kind {
                crate::config::MetricKind::Value { pull_tag_id, .. } => *pull_tag_id,
                crate::config::MetricKind::Gauge { pull_tag_id, .. } => *pull_tag_id,
                _ => None,
            };
            if let Some(tag) = pull_tag {
                let period = m.bucket.ns();
                period_by_tag
                    .entry(tag)
                    .and_modify(|p| *p = (*p).min(period))
                    .or_insert(period);
            }
        }
        for (tag, period_ns) in period_by_tag {
            let id = inner.next_pull_alarm_id;
            inner.next_pull_alarm_id += 1;
            inner.pull_schedules.insert(
                id,
                PullSchedule {
                    key,
                    tag,
                    period_ns,
                },
            );
            inner.pull_alarms.register(Alarm {
                fire_at_ns: now_elapsed_ns + period_ns,
                id,
            });
            debug!(key = %key, tag, period_ns, "pull alarm scheduled");
        }
    }

    /// Notes a uid as installed/known. Later upgrades of known uids force
    /// bucket splits.
    pub fn note_app_installed(&self, uid: u32) {
        self.inner.lock().known_uids.insert(uid);
    }

    /// An app upgraded. Splits buckets at the upgrade timestamp across all
    /// managers, but only when the uid had a prior record; a fresh install
    /// causes no split.
    pub fn on_app_upgraded(&self, uid: u32, timestamp_ns: i64) {
        let mut inner = self.inner.lock();
        if !inner.known_uids.insert(uid) {
            for manager in inner.managers.values_mut() {
                manager.on_app_upgrade(timestamp_ns);
            }
        }
    }

    /// An app was removed; splits like an upgrade, then forgets the uid.
    pub fn on_app_removed(&self, uid: u32, timestamp_ns: i64) {
        let mut inner = self.inner.lock();
        if inner.known_uids.remove(&uid) {
            for manager in inner.managers.values_mut() {
                manager.on_app_upgrade(timestamp_ns);
            }
        }
    }

    /// Periodic tick: TTL sweep, bucket rollovers, periodic alarms, and
    /// due pulls. Returns the periodic alarms that fired, for the external
    /// subscriber.
    pub fn on_periodic_tick(&self, now_elapsed_ns: i64, now_wall_ns: i64) -> Vec<PeriodicFired> {
        let due_pulls = {
            let mut inner = self.inner.lock();

            // TTL sweep: expired managers go away like removed configs.
            let expired: Vec<ConfigKey> = inner
                .managers
                .iter()
                .filter(|(_, m)| m.is_expired(now_elapsed_ns))
                .map(|(k, _)| *k)
                .collect();
            for key in expired {
                self.remove_manager(
                    &mut inner,
                    key,
                    now_elapsed_ns,
                    now_wall_ns,
                    DumpReason::TtlExpired,
                );
            }

            let mut anomalies = 0u64;
            for manager in inner.managers.values_mut() {
                anomalies += manager.flush_if_needed(now_elapsed_ns).len() as u64;
            }
            if anomalies > 0 {
                if let Some(h) = &self.health {
                    h.anomalies_fired.inc_by(anomalies as f64);
                }
            }

            Self::broadcast_changes(&mut inner, now_elapsed_ns);
            self.update_health_gauges(&inner, now_elapsed_ns);

            inner.pull_alarms.pop_due(now_elapsed_ns)
        };

        // Pull outside the lock: sources may block on I/O.
        let mut pulled: Vec<(u64, Alarm, Vec<Event>)> = Vec::new();
        for alarm in due_pulls {
            let tag = {
                let inner = self.inner.lock();
                inner.pull_schedules.get(&alarm.id).map(|s| s.tag)
            };
            let Some(tag) = tag else {
                continue;
            };
            if let Some(events) = self.puller.pull(tag, now_elapsed_ns) {
                // Within tolerance the results count for the boundary the
                // pull was scheduled at; beyond it they keep arrival time.
                let events = if now_elapsed_ns - alarm.fire_at_ns <= PULL_TOLERANCE_NS {
                    rebase_events(events, alarm.fire_at_ns)
                } else {
                    events
                };
                pulled.push((alarm.id, alarm, events));
            } else {
                pulled.push((alarm.id, alarm, Vec::new()));
            }
        }

        // Re-enter the dispatch path with the pulled events and reschedule.
        let mut fired = Vec::new();
        {
            let mut inner = self.inner.lock();
            for (id, alarm, events) in pulled {
                let Some(schedule) = inner.pull_schedules.get(&id) else {
                    continue;
                };
                let (key, period) = (schedule.key, schedule.period_ns);
                if let Some(manager) = inner.managers.get_mut(&key) {
                    for event in &events {
                        manager.on_event(event);
                    }
                }
                // Next boundary strictly after now; a stalled process skips
                // ahead rather than firing a backlog.
                let mut next = alarm.fire_at_ns + period;
                if next <= now_elapsed_ns {
                    let missed = (now_elapsed_ns - alarm.fire_at_ns) / period + 1;
                    next = alarm.fire_at_ns + missed * period;
                }
                inner.pull_alarms.register(Alarm {
                    fire_at_ns: next,
                    id,
                });
            }

            for (key, tracker) in inner.periodic.iter_mut() {
                let periods = tracker.fire_if_due(now_wall_ns);
                if periods > 0 {
                    fired.push(PeriodicFired {
                        key: *key,
                        alarm_id: tracker.alarm_id,
                        periods,
                    });
                }
            }
        }

        fired
    }

    /// Serializes the report for one config key: locally-persisted history
    /// first, then the live manager's current data.
    pub fn on_dump_report(
        &self,
        key: ConfigKey,
        dump_elapsed_ns: i64,
        dump_wall_ns: i64,
        opts: DumpOptions,
    ) -> ConfigMetricsReportList {
        let mut inner = self.inner.lock();
        let mut reports = Vec::new();

        if let Some(history) = inner.saved_reports.get_mut(&key) {
            if opts.erase_data {
                reports.append(history);
            } else {
                reports.extend(history.iter().cloned());
            }
        }

        if let Some(manager) = inner.managers.get_mut(&key) {
            reports.push(manager.dump_report(
                dump_elapsed_ns,
                dump_wall_ns,
                opts.include_current_bucket,
                opts.erase_data,
                opts.include_strings,
                opts.reason,
                opts.latency,
            ));
        }

        if let Some(h) = &self.health {
            h.reports_dumped.inc();
        }

        ConfigMetricsReportList { key, reports }
    }

    /// Persists anomaly refractory state, rebased to wall clock. Failures
    /// are reported, never fatal.
    pub fn save_metadata(&self, wall_clock_ns: i64, elapsed_ns: i64) -> bool {
        let inner = self.inner.lock();
        let elapsed_sec = ns_to_secs(elapsed_ns);
        let wall_sec = ns_to_secs(wall_clock_ns);

        let configs: Vec<PersistedConfig> = inner
            .managers
            .iter()
            .map(|(key, manager)| PersistedConfig {
                key: *key,
                alerts: manager
                    .snapshot_refractory()
                    .into_iter()
                    .map(|(alert_id, entries)| PersistedAlert {
                        alert_id,
                        refractory_end_wall_sec: entries
                            .into_iter()
                            .map(|(k, end)| (k, elapsed_to_wall_sec(end, elapsed_sec, wall_sec)))
                            .collect(),
                    })
                    .collect(),
            })
            .collect();

        let metadata = PersistedMetadata {
            saved_wall_clock_sec: wall_sec,
            configs,
        };
        match save_metadata(&self.metadata_path, &metadata) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "failed to save metadata");
                false
            }
        }
    }

    /// Restores anomaly refractory state saved by a previous process,
    /// rebasing from wall clock into this process's elapsed timeline.
    pub fn load_metadata(&self, wall_clock_ns: i64, elapsed_ns: i64) -> bool {
        let metadata = match load_metadata(&self.metadata_path) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "no persisted metadata loaded, cold start");
                return false;
            }
        };

        let elapsed_sec = ns_to_secs(elapsed_ns);
        let wall_sec = ns_to_secs(wall_clock_ns);
        let mut inner = self.inner.lock();

        for persisted in metadata.configs {
            let Some(manager) = inner.managers.get_mut(&persisted.key) else {
                continue;
            };
            let alerts = persisted
                .alerts
                .into_iter()
                .map(|a| {
                    (
                        a.alert_id,
                        a.refractory_end_wall_sec
                            .into_iter()
                            .map(|(k, wall)| (k, wall_to_elapsed_sec(wall, elapsed_sec, wall_sec)))
                            .collect(),
                    )
                })
                .collect();
            manager.restore_refractory(alerts);
        }

        true
    }

    /// Active config ids for a uid, as last broadcast.
    pub fn active_config_ids(&self, uid: u32) -> Vec<i64> {
        self.inner
            .lock()
            .active_ids
            .get(&uid)
            .cloned()
            .unwrap_or_default()
    }

    /// Invokes the broadcast callback for every uid whose set of active
    /// config ids changed.
    fn broadcast_changes(inner: &mut Inner, now_ns: i64) {
        let mut current: HashMap<u32, Vec<i64>> = HashMap::new();
        for (key, manager) in &inner.managers {
            if manager.state(now_ns) == ManagerState::Active {
                current.entry(key.uid).or_default().push(key.config_id);
            }
        }
        for ids in current.values_mut() {
            ids.sort_unstable();
        }

        let uids: HashSet<u32> = current
            .keys()
            .chain(inner.active_ids.keys())
            .copied()
            .collect();

        for uid in uids {
            let new_ids = current.remove(&uid).unwrap_or_default();
            let old_ids = inner.active_ids.get(&uid);
            if old_ids.map(|v| v.as_slice()) != Some(new_ids.as_slice()) {
                if let Some(broadcast) = &inner.broadcast {
                    broadcast(uid, new_ids.clone());
                }
                if new_ids.is_empty() {
                    inner.active_ids.remove(&uid);
                } else {
                    inner.active_ids.insert(uid, new_ids);
                }
            }
        }
    }

    fn update_health_gauges(&self, inner: &Inner, now_ns: i64) {
        let Some(h) = &self.health else {
            return;
        };
        h.managers_installed.set(inner.managers.len() as f64);
        h.managers_active.set(
            inner
                .managers
                .values()
                .filter(|m| m.state(now_ns) == ManagerState::Active)
                .count() as f64,
        );
        let dropped: u64 = inner
            .managers
            .values()
            .map(|m| {
                let s = m.stats();
                s.events_dropped_source + s.events_dropped_invalid
            })
            .sum();
        h.events_dropped.set(dropped as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MatcherConfig, MatcherKind, MetricConfig, MetricKind, TimeUnit};
    use crate::report::MetricData;

    const MIN: i64 = 60 * 1_000_000_000;

    fn daemon_config() -> Config {
        serde_yaml::from_str("{}").expect("default config")
    }

    fn key(uid: u32, id: i64) -> ConfigKey {
        ConfigKey {
            uid,
            config_id: id,
        }
    }

    fn count_config(tag: TagId) -> PipelineConfig {
        PipelineConfig {
            id: 1,
            allowed_log_sources: Vec::new(),
            ttl_secs: None,
            hash_strings_in_report: false,
            persist_locally: false,
            no_report_metrics: Vec::new(),
            matchers: vec![MatcherConfig {
                id: 1,
                kind: MatcherKind::Simple {
                    tag_id: tag,
                    field_matchers: Vec::new(),
                },
            }],
            conditions: Vec::new(),
            metrics: vec![MetricConfig {
                id: 100,
                what: 1,
                condition: None,
                links: None,
                dimensions: Vec::new(),
                bucket: TimeUnit::OneMinute,
                min_bucket_size: None,
                kind: MetricKind::Count,
            }],
            alerts: Vec::new(),
            periodic_alarms: Vec::new(),
            activations: Vec::new(),
        }
    }

    fn event(tag: TagId, t: i64) -> Event {
        Event::new(tag, 1000, t, t, Vec::new())
    }

    fn dump_opts() -> DumpOptions {
        DumpOptions {
            include_current_bucket: true,
            include_strings: true,
            erase_data: false,
            reason: DumpReason::GetData,
            latency: DumpLatency::Immediate,
        }
    }

    fn total_count(list: &ConfigMetricsReportList) -> i64 {
        list.reports
            .iter()
            .flat_map(|r| &r.metrics)
            .map(|m| match &m.data {
                MetricData::Count { data, .. } => data
                    .iter()
                    .flat_map(|d| &d.buckets)
                    .map(|b| b.count)
                    .sum::<i64>(),
                _ => 0,
            })
            .sum()
    }

    #[test]
    fn test_events_fan_out_to_matching_configs() {
        let p = Processor::new(&daemon_config(), None);
        p.on_config_updated(0, 0, key(1, 1), count_config(10), false);
        p.on_config_updated(0, 0, key(1, 2), count_config(11), false);

        p.on_log_event(&event(10, 100));
        p.on_log_event(&event(10, 200));
        p.on_log_event(&event(11, 300));

        let r1 = p.on_dump_report(key(1, 1), MIN, MIN, dump_opts());
        let r2 = p.on_dump_report(key(1, 2), MIN, MIN, dump_opts());
        assert_eq!(total_count(&r1), 2);
        assert_eq!(total_count(&r2), 1);
    }

    #[test]
    fn test_config_replacement_resets_state_non_modular() {
        let p = Processor::new(&daemon_config(), None);
        p.on_config_updated(0, 0, key(1, 1), count_config(10), false);
        p.on_log_event(&event(10, 100));

        // Full (non-modular) replacement loses in-flight state.
        p.on_config_updated(500, 500, key(1, 1), count_config(10), false);
        let r = p.on_dump_report(key(1, 1), MIN, MIN, dump_opts());
        assert_eq!(total_count(&r), 0);
    }

    #[test]
    fn test_modular_update_preserves_state() {
        let p = Processor::new(&daemon_config(), None);
        p.on_config_updated(0, 0, key(1, 1), count_config(10), false);
        p.on_log_event(&event(10, 100));

        p.on_config_updated(500, 500, key(1, 1), count_config(10), true);
        let r = p.on_dump_report(key(1, 1), MIN, MIN, dump_opts());
        assert_eq!(total_count(&r), 1);
    }

    #[test]
    fn test_config_removal_drops_manager() {
        let p = Processor::new(&daemon_config(), None);
        p.on_config_updated(0, 0, key(1, 1), count_config(10), false);
        p.on_config_removed(key(1, 1), 100, 100);

        let r = p.on_dump_report(key(1, 1), MIN, MIN, dump_opts());
        assert!(r.reports.is_empty());
    }

    #[test]
    fn test_persist_locally_keeps_history_across_replacement() {
        let p = Processor::new(&daemon_config(), None);
        let mut cfg = count_config(10);
        cfg.persist_locally = true;
        p.on_config_updated(0, 0, key(1, 1), cfg.clone(), false);
        p.on_log_event(&event(10, 100));

        // Non-modular replacement flushes the old data into saved history.
        p.on_config_updated(500, 500, key(1, 1), cfg, false);
        p.on_log_event(&event(10, 600));

        let r = p.on_dump_report(key(1, 1), MIN, MIN, dump_opts());
        assert_eq!(r.reports.len(), 2, "history plus current report");
        assert_eq!(total_count(&r), 2);
    }

    #[test]
    fn test_ttl_sweep_removes_expired_config() {
        let p = Processor::new(&daemon_config(), None);
        let mut cfg = count_config(10);
        cfg.ttl_secs = Some(100);
        p.on_config_updated(0, 0, key(1, 1), cfg, false);

        p.on_periodic_tick(99 * NS_PER_SEC, 99 * NS_PER_SEC);
        assert!(!p
            .on_dump_report(key(1, 1), MIN, MIN, dump_opts())
            .reports
            .is_empty());

        p.on_periodic_tick(101 * NS_PER_SEC, 101 * NS_PER_SEC);
        assert!(p
            .on_dump_report(key(1, 1), MIN, MIN, dump_opts())
            .reports
            .is_empty());
    }

    #[test]
    fn test_app_upgrade_splits_only_known_uids() {
        let p = Processor::new(&daemon_config(), None);
        p.on_config_updated(0, 0, key(1, 1), count_config(10), false);
        p.on_log_event(&event(10, 100));

        // Unknown uid: first upgrade is an install, no split.
        p.on_app_upgraded(5000, 30 * NS_PER_SEC);
        let r = p.on_dump_report(key(1, 1), MIN, MIN, dump_opts());
        let buckets: usize = r
            .reports
            .iter()
            .flat_map(|rep| &rep.metrics)
            .map(|m| match &m.data {
                MetricData::Count { data, .. } => {
                    data.iter().map(|d| d.buckets.len()).sum::<usize>()
                }
                _ => 0,
            })
            .sum();
        assert_eq!(buckets, 1, "no split for a fresh install");

        // Known uid: upgrade forces a split at the upgrade timestamp.
        p.on_log_event(&event(10, 31 * NS_PER_SEC));
        p.on_app_upgraded(5000, 40 * NS_PER_SEC);
        let r = p.on_dump_report(key(1, 1), MIN, MIN, dump_opts());
        let ends: Vec<i64> = r
            .reports
            .iter()
            .flat_map(|rep| &rep.metrics)
            .flat_map(|m| match &m.data {
                MetricData::Count { data, .. } => data
                    .iter()
                    .flat_map(|d| &d.buckets)
                    .map(|b| b.end_bucket_elapsed_ns)
                    .collect::<Vec<_>>(),
                _ => Vec::new(),
            })
            .collect();
        assert!(
            ends.contains(&(40 * NS_PER_SEC)),
            "split exactly at the upgrade timestamp, got {ends:?}"
        );
    }

    #[test]
    fn test_periodic_alarm_fires_with_catch_up() {
        let p = Processor::new(&daemon_config(), None);
        let mut cfg = count_config(10);
        cfg.periodic_alarms.push(crate::config::PeriodicAlarmConfig {
            id: 9,
            offset_millis: 0,
            period_millis: 1000,
        });
        p.on_config_updated(0, 0, key(1, 1), cfg, false);

        let fired = p.on_periodic_tick(MIN, 5 * NS_PER_SEC + 1);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].alarm_id, 9);
        assert_eq!(fired[0].periods, 5, "all overdue periods in one pass");
    }

    #[test]
    fn test_broadcast_reports_active_sets() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let p = Processor::new(&daemon_config(), None);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        p.set_broadcast(Box::new(move |uid, ids| {
            assert_eq!(uid, 1);
            assert_eq!(ids, vec![1]);
            calls_clone.fetch_add(1, Ordering::Relaxed);
        }));

        p.on_config_updated(0, 0, key(1, 1), count_config(10), false);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(p.active_config_ids(1), vec![1]);
    }

    #[test]
    fn test_save_and_load_metadata_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut daemon = daemon_config();
        daemon.storage.metadata_path = dir.path().join("meta.json");

        let p = Processor::new(&daemon, None);
        let mut cfg = count_config(10);
        cfg.alerts.push(crate::config::AlertConfig {
            id: 7,
            metric_id: 100,
            num_buckets: 1,
            trigger_if_sum_gt: 0,
            refractory_period_secs: 300,
        });
        p.on_config_updated(0, 0, key(1, 1), cfg.clone(), false);

        // Fire an anomaly to populate refractory state.
        p.on_log_event(&event(10, 100));
        p.on_periodic_tick(MIN + 1, MIN + 1);

        let wall = 1_584_991_200 * NS_PER_SEC;
        assert!(p.save_metadata(wall, 2 * MIN));

        // Fresh processor, same wall clock, new elapsed timeline.
        let p2 = Processor::new(&daemon, None);
        p2.on_config_updated(0, 0, key(1, 1), cfg, false);
        assert!(p2.load_metadata(wall, 10 * NS_PER_SEC));

        // The restored refractory end still suppresses: an anomaly-worthy
        // bucket finalized right away does not fire again.
        p2.on_log_event(&event(10, 100));
        p2.on_periodic_tick(MIN + 1, MIN + 1);
        // Refractory end was 60s + 300s = 360s on the old elapsed line,
        // saved at elapsed 120s => 240s remaining; restored at elapsed 10s
        // => suppression until elapsed 250s.
        let mut inner = p2.inner.lock();
        let manager = inner.managers.get_mut(&key(1, 1)).expect("manager");
        let snapshot = manager.snapshot_refractory();
        assert_eq!(snapshot.len(), 1);
        let (_, entries) = &snapshot[0];
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, 250);
    }
}
