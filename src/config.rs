use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dimension::{flatten_leaves, FieldMatcher, Position};
use crate::event::{FieldId, TagId};

/// Top-level configuration for the metricsd daemon.
///
/// This configures the process itself (logging, health server, storage,
/// pull behavior). Pipeline configs (the matcher/condition/metric
/// definitions) arrive per config key through `Processor::on_config_updated`
/// and use the serde model below.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Persisted-state storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Pull source behavior.
    #[serde(default)]
    pub puller: PullerConfig,

    /// Maximum distinct dimension keys per metric producer before new keys
    /// are dropped. Default: 800.
    #[serde(default = "default_dimension_hard_limit")]
    pub dimension_hard_limit: usize,

    /// How often the alarm/TTL tick runs. Default: 1s.
    #[serde(default = "default_alarm_tick_interval", with = "humantime_serde")]
    pub alarm_tick_interval: Duration,

    /// Pipeline config files installed at startup, keyed as uid 0.
    #[serde(default)]
    pub configs: Vec<PathBuf>,
}

/// Health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Enable the health/metrics HTTP server.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: "127.0.0.1:9091".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

/// Persisted-state storage configuration.
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// Path of the metadata file for refractory-period carry-over.
    #[serde(default = "default_metadata_path")]
    pub metadata_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            metadata_path: default_metadata_path(),
        }
    }
}

/// Pull source behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct PullerConfig {
    /// Minimum interval before a tag is re-pulled; cached data is served
    /// inside the window. Default: 1s.
    #[serde(default = "default_min_repull_interval", with = "humantime_serde")]
    pub min_repull_interval: Duration,

    /// Maximum allowed delay for a pull; results arriving later are
    /// discarded whole. Default: 10s.
    #[serde(default = "default_max_pull_delay", with = "humantime_serde")]
    pub max_pull_delay: Duration,

    /// Consecutive failures after which a source is marked unavailable and
    /// no longer retried every interval. Default: 3.
    #[serde(default = "default_pull_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for PullerConfig {
    fn default() -> Self {
        Self {
            min_repull_interval: default_min_repull_interval(),
            max_pull_delay: default_max_pull_delay(),
            failure_threshold: default_pull_failure_threshold(),
        }
    }
}

impl Config {
    /// Loads daemon configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(cfg)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_health_addr() -> String {
    "127.0.0.1:9091".to_string()
}

fn default_metadata_path() -> PathBuf {
    PathBuf::from("metricsd-metadata.json")
}

fn default_min_repull_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_pull_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_pull_failure_threshold() -> u32 {
    3
}

fn default_dimension_hard_limit() -> usize {
    800
}

fn default_alarm_tick_interval() -> Duration {
    Duration::from_secs(1)
}

// --- Pipeline configuration (per config key) ---

/// Identifies one pipeline config instance: the owning uid plus its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigKey {
    pub uid: u32,
    pub config_id: i64,
}

impl std::fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.uid, self.config_id)
    }
}

/// One pipeline configuration: matchers, conditions, metrics, alerts,
/// alarms, and activations, plus report-shaping flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub id: i64,

    /// Uids allowed to push events into this config. Empty = allow all.
    #[serde(default)]
    pub allowed_log_sources: Vec<u32>,

    /// Lifetime of this config; once elapsed the owning manager is torn
    /// down like an explicit removal.
    #[serde(default)]
    pub ttl_secs: Option<u64>,

    /// Hash string values in dump reports instead of emitting them raw.
    #[serde(default)]
    pub hash_strings_in_report: bool,

    /// Persist finished reports locally so later dumps can include history.
    #[serde(default)]
    pub persist_locally: bool,

    /// Metric ids excluded from dump reports.
    #[serde(default)]
    pub no_report_metrics: Vec<i64>,

    pub matchers: Vec<MatcherConfig>,

    #[serde(default)]
    pub conditions: Vec<ConditionConfig>,

    pub metrics: Vec<MetricConfig>,

    #[serde(default)]
    pub alerts: Vec<AlertConfig>,

    #[serde(default)]
    pub periodic_alarms: Vec<PeriodicAlarmConfig>,

    #[serde(default)]
    pub activations: Vec<MetricActivationConfig>,
}

impl PipelineConfig {
    /// Parses a pipeline config from serialized YAML bytes, the format the
    /// external config-management collaborator delivers.
    pub fn from_yaml_bytes(data: &[u8]) -> Result<Self> {
        serde_yaml::from_slice(data).context("parsing pipeline config")
    }

    /// Parses a pipeline config from JSON bytes.
    pub fn from_json_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("parsing pipeline config")
    }
}

/// Logical combination operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperation {
    And,
    Or,
    Not,
}

/// Named event classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatcherConfig {
    pub id: i64,
    #[serde(flatten)]
    pub kind: MatcherKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatcherKind {
    /// Matches a tag plus zero or more field constraints.
    Simple {
        tag_id: TagId,
        #[serde(default)]
        field_matchers: Vec<FieldValueMatcherConfig>,
    },
    /// Logical combination of other matchers.
    Combination {
        operation: LogicalOperation,
        matcher_ids: Vec<i64>,
    },
}

/// Constraint on one event field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValueMatcherConfig {
    pub field: FieldId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    pub predicate: FieldPredicate,
}

/// Predicate applied to a field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldPredicate {
    EqInt(i64),
    EqAnyInt(Vec<i64>),
    EqString(String),
    EqBool(bool),
    Lt(i64),
    Gt(i64),
    Lte(i64),
    Gte(i64),
    /// Sub-constraints applied to attribution chain node(s) selected by the
    /// enclosing matcher's position.
    Chain(Vec<FieldValueMatcherConfig>),
}

/// Named stateful predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub id: i64,
    #[serde(flatten)]
    pub kind: ConditionKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConditionKind {
    Simple {
        /// Matcher whose firing makes the condition true.
        start: i64,
        /// Matcher whose firing makes the condition false (at nesting zero).
        #[serde(default)]
        stop: Option<i64>,
        /// Matcher that forces the condition (all keys) false.
        #[serde(default)]
        stop_all: Option<i64>,
        /// Count overlapping start/stop pairs instead of treating a start as
        /// idempotent.
        #[serde(default)]
        count_nesting: bool,
        /// Dimension trees slicing the condition per key.
        #[serde(default)]
        dimensions: Vec<FieldMatcher>,
        #[serde(default)]
        initial_value: ConditionInitialValue,
    },
    Combination {
        operation: LogicalOperation,
        condition_ids: Vec<i64>,
    },
}

/// Value a simple condition reports before any start/stop has been seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionInitialValue {
    #[default]
    Unknown,
    False,
}

/// Fixed bucket durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    OneSecond,
    TenSeconds,
    OneMinute,
    #[default]
    FiveMinutes,
    TenMinutes,
    ThirtyMinutes,
    OneHour,
    SixHours,
    TwelveHours,
    OneDay,
    OneWeek,
}

impl TimeUnit {
    /// Bucket duration in nanoseconds.
    pub const fn ns(self) -> i64 {
        const SEC: i64 = 1_000_000_000;
        match self {
            Self::OneSecond => SEC,
            Self::TenSeconds => 10 * SEC,
            Self::OneMinute => 60 * SEC,
            Self::FiveMinutes => 5 * 60 * SEC,
            Self::TenMinutes => 10 * 60 * SEC,
            Self::ThirtyMinutes => 30 * 60 * SEC,
            Self::OneHour => 3600 * SEC,
            Self::SixHours => 6 * 3600 * SEC,
            Self::TwelveHours => 12 * 3600 * SEC,
            Self::OneDay => 24 * 3600 * SEC,
            Self::OneWeek => 7 * 24 * 3600 * SEC,
        }
    }
}

/// One metric definition. `what` names the matcher (count/value/gauge) or
/// condition (duration) that drives the metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricConfig {
    pub id: i64,
    pub what: i64,

    /// Gating condition; when absent the metric is ungated.
    #[serde(default)]
    pub condition: Option<i64>,

    /// Field correspondences mapping metric dimensions to the gating
    /// condition's dimensions.
    #[serde(default)]
    pub links: Option<MetricConditionLinkConfig>,

    /// Dimension trees slicing the metric per key.
    #[serde(default)]
    pub dimensions: Vec<FieldMatcher>,

    #[serde(default)]
    pub bucket: TimeUnit,

    /// Minimum duration a forced-split partial bucket must cover to be
    /// reported as data; shorter partials become skipped intervals.
    #[serde(default, with = "humantime_serde::option")]
    pub min_bucket_size: Option<Duration>,

    #[serde(flatten)]
    pub kind: MetricKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricKind {
    Count,
    Duration {
        #[serde(default)]
        aggregation: DurationAggregation,
    },
    Value {
        value_field: FieldId,
        /// Accumulate sample-to-sample diffs instead of raw values.
        #[serde(default)]
        use_diff: bool,
        /// On a detected reset (decrease), take the current value as-is
        /// instead of dropping the sample.
        #[serde(default)]
        use_absolute_value_on_reset: bool,
        /// Suppress buckets whose accumulated value is exactly zero.
        #[serde(default)]
        skip_zero_diff_output: bool,
        /// Pull this tag on bucket boundaries instead of relying on pushes.
        #[serde(default)]
        pull_tag_id: Option<TagId>,
    },
    Gauge {
        #[serde(default)]
        sampling: GaugeSampling,
        /// Field positions to capture; empty = capture all fields.
        #[serde(default)]
        fields: Vec<FieldId>,
        #[serde(default = "default_max_gauge_samples")]
        max_num_samples: u32,
        #[serde(default)]
        pull_tag_id: Option<TagId>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationAggregation {
    #[default]
    Sum,
    /// Longest single concurrently-open interval per bucket.
    MaxSparse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GaugeSampling {
    RandomOneSample,
    FirstNSamples,
    ConditionChangeToTrue,
    #[default]
    All,
}

fn default_max_gauge_samples() -> u32 {
    10
}

/// Field correspondences between a metric's dimensions and its gating
/// condition's dimensions. The two sides must flatten to the same number of
/// leaves; leaves pair up positionally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricConditionLinkConfig {
    pub fields_in_what: Vec<FieldMatcher>,
    pub fields_in_condition: Vec<FieldMatcher>,
}

/// Threshold alert over a metric's finalized buckets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    pub id: i64,
    pub metric_id: i64,
    /// Rolling window size in buckets.
    pub num_buckets: u32,
    /// Fire when the rolling sum exceeds this.
    pub trigger_if_sum_gt: i64,
    #[serde(default)]
    pub refractory_period_secs: u32,
}

/// Wall-clock periodic alarm: fires at `offset + k * period`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodicAlarmConfig {
    pub id: i64,
    pub offset_millis: u64,
    pub period_millis: u64,
}

/// Event-triggered activation windows for one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricActivationConfig {
    pub metric_id: i64,
    pub activations: Vec<EventActivationConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventActivationConfig {
    pub activation_matcher_id: i64,
    pub ttl_secs: u64,
    #[serde(default)]
    pub deactivation_matcher_id: Option<i64>,
}

// --- Validation ---

/// Errors detected at config-load time. A config failing validation yields
/// an Invalid manager that rejects all events and produces empty reports;
/// other configs are unaffected.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("duplicate {kind} id {id}")]
    DuplicateId { kind: &'static str, id: i64 },

    #[error("{kind} {from} references unknown {target_kind} {to}")]
    DanglingReference {
        kind: &'static str,
        from: i64,
        target_kind: &'static str,
        to: i64,
    },

    #[error("cycle through {kind} {id}")]
    Cycle { kind: &'static str, id: i64 },

    #[error("{kind} {id}: {what}")]
    InvalidValue {
        kind: &'static str,
        id: i64,
        what: String,
    },
}

/// Structural validation of a pipeline config: id uniqueness, reference
/// existence, link arity, alert/alarm sanity. Cycle detection happens in
/// the matcher/condition network builders, which also return `ConfigError`.
pub fn validate(cfg: &PipelineConfig) -> Result<(), ConfigError> {
    let matcher_ids = unique_ids("matcher", cfg.matchers.iter().map(|m| m.id))?;
    let condition_ids = unique_ids("condition", cfg.conditions.iter().map(|c| c.id))?;
    let metric_ids = unique_ids("metric", cfg.metrics.iter().map(|m| m.id))?;
    unique_ids("alert", cfg.alerts.iter().map(|a| a.id))?;
    unique_ids("periodic_alarm", cfg.periodic_alarms.iter().map(|a| a.id))?;

    for m in &cfg.matchers {
        if let MatcherKind::Combination {
            operation,
            matcher_ids: refs,
        } = &m.kind
        {
            check_not_arity("matcher", m.id, *operation, refs.len())?;
            for r in refs {
                if !matcher_ids.contains(r) {
                    return Err(dangling("matcher", m.id, "matcher", *r));
                }
            }
        }
    }

    for c in &cfg.conditions {
        match &c.kind {
            ConditionKind::Simple {
                start,
                stop,
                stop_all,
                ..
            } => {
                for r in [Some(*start), *stop, *stop_all].into_iter().flatten() {
                    if !matcher_ids.contains(&r) {
                        return Err(dangling("condition", c.id, "matcher", r));
                    }
                }
            }
            ConditionKind::Combination {
                operation,
                condition_ids: refs,
            } => {
                check_not_arity("condition", c.id, *operation, refs.len())?;
                for r in refs {
                    if !condition_ids.contains(r) {
                        return Err(dangling("condition", c.id, "condition", *r));
                    }
                }
            }
        }
    }

    for m in &cfg.metrics {
        let what_kind = match m.kind {
            MetricKind::Duration { .. } => "condition",
            _ => "matcher",
        };
        let what_known = match m.kind {
            MetricKind::Duration { .. } => condition_ids.contains(&m.what),
            _ => matcher_ids.contains(&m.what),
        };
        if !what_known {
            return Err(dangling("metric", m.id, what_kind, m.what));
        }

        if let Some(cond) = m.condition {
            if !condition_ids.contains(&cond) {
                return Err(dangling("metric", m.id, "condition", cond));
            }
        }

        if let Some(links) = &m.links {
            if m.condition.is_none() {
                return Err(ConfigError::InvalidValue {
                    kind: "metric",
                    id: m.id,
                    what: "links require a gating condition".into(),
                });
            }
            let what_leaves = flatten_leaves(&links.fields_in_what);
            let cond_leaves = flatten_leaves(&links.fields_in_condition);
            if what_leaves.is_empty() || what_leaves.len() != cond_leaves.len() {
                return Err(ConfigError::InvalidValue {
                    kind: "metric",
                    id: m.id,
                    what: format!(
                        "link sides must flatten to the same non-zero leaf count ({} vs {})",
                        what_leaves.len(),
                        cond_leaves.len()
                    ),
                });
            }
        }
    }

    for a in &cfg.alerts {
        if !metric_ids.contains(&a.metric_id) {
            return Err(dangling("alert", a.id, "metric", a.metric_id));
        }
        if a.num_buckets == 0 {
            return Err(ConfigError::InvalidValue {
                kind: "alert",
                id: a.id,
                what: "num_buckets must be > 0".into(),
            });
        }
    }

    for a in &cfg.periodic_alarms {
        if a.period_millis == 0 {
            return Err(ConfigError::InvalidValue {
                kind: "periodic_alarm",
                id: a.id,
                what: "period_millis must be > 0".into(),
            });
        }
    }

    for act in &cfg.activations {
        if !metric_ids.contains(&act.metric_id) {
            return Err(dangling(
                "activation",
                act.metric_id,
                "metric",
                act.metric_id,
            ));
        }
        for ea in &act.activations {
            if !matcher_ids.contains(&ea.activation_matcher_id) {
                return Err(dangling(
                    "activation",
                    act.metric_id,
                    "matcher",
                    ea.activation_matcher_id,
                ));
            }
            if let Some(d) = ea.deactivation_matcher_id {
                if !matcher_ids.contains(&d) {
                    return Err(dangling("activation", act.metric_id, "matcher", d));
                }
            }
            if ea.ttl_secs == 0 {
                return Err(ConfigError::InvalidValue {
                    kind: "activation",
                    id: act.metric_id,
                    what: "ttl_secs must be > 0".into(),
                });
            }
        }
    }

    Ok(())
}

fn unique_ids(
    kind: &'static str,
    ids: impl Iterator<Item = i64>,
) -> Result<HashSet<i64>, ConfigError> {
    let mut set = HashSet::new();
    for id in ids {
        if !set.insert(id) {
            return Err(ConfigError::DuplicateId { kind, id });
        }
    }
    Ok(set)
}

fn check_not_arity(
    kind: &'static str,
    id: i64,
    op: LogicalOperation,
    children: usize,
) -> Result<(), ConfigError> {
    if op == LogicalOperation::Not && children != 1 {
        return Err(ConfigError::InvalidValue {
            kind,
            id,
            what: format!("NOT requires exactly one child, got {children}"),
        });
    }
    Ok(())
}

fn dangling(kind: &'static str, from: i64, target_kind: &'static str, to: i64) -> ConfigError {
    ConfigError::DanglingReference {
        kind,
        from,
        target_kind,
        to,
    }
}
