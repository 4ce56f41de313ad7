//! Report data model: the structures a dump request serializes. One
//! `ConfigMetricsReportList` per config key, nesting one report per dump (or
//! per locally-persisted historical report), each carrying per-metric data
//! wrappers with per-dimension bucket-info lists and skipped intervals.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::ConfigKey;
use crate::dimension::DimensionKey;
use crate::event::{FieldId, FieldValue};

/// Why a report was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpReason {
    GetData,
    ConfigUpdated,
    ConfigRemoved,
    TtlExpired,
    Shutdown,
    AdbDump,
}

/// Whether the report was produced synchronously with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpLatency {
    Immediate,
    Delayed,
}

/// An interval whose data was dropped rather than reported (forced split
/// below the minimum bucket size). Callers distinguish these from data
/// buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedInterval {
    pub start_elapsed_ns: i64,
    pub end_elapsed_ns: i64,
}

/// A dimension value rendered into the report's nested field-value form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionValue {
    Int(i32),
    Long(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    /// SHA-256 truncated to 64 bits, emitted when string hashing is on.
    StrHash(u64),
    Tuple(Vec<DimensionsValue>),
}

/// One node of a dimension tree: the field position plus its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionsValue {
    pub field: FieldId,
    pub value: DimensionValue,
}

/// Renders a dimension key as a list of dimension trees. Chain sub-fields
/// group under their top-level field as a tuple.
pub fn dimensions_from_key(key: &DimensionKey, hash_strings: bool) -> Vec<DimensionsValue> {
    let mut out: Vec<DimensionsValue> = Vec::new();

    for entry in &key.0 {
        let rendered = render_value(&entry.value, hash_strings);
        match entry.path.sub_field {
            None => out.push(DimensionsValue {
                field: entry.path.field,
                value: rendered,
            }),
            Some(sub) => {
                let node = DimensionsValue {
                    field: sub,
                    value: rendered,
                };
                // Append to an existing tuple for this top-level field.
                if let Some(DimensionsValue {
                    value: DimensionValue::Tuple(children),
                    ..
                }) = out
                    .iter_mut()
                    .find(|d| d.field == entry.path.field)
                {
                    children.push(node);
                } else {
                    out.push(DimensionsValue {
                        field: entry.path.field,
                        value: DimensionValue::Tuple(vec![node]),
                    });
                }
            }
        }
    }

    out
}

fn render_value(value: &FieldValue, hash_strings: bool) -> DimensionValue {
    match value {
        FieldValue::Int(v) => DimensionValue::Int(*v),
        FieldValue::Long(v) => DimensionValue::Long(*v),
        FieldValue::Float(v) => DimensionValue::Float(*v),
        FieldValue::Bool(v) => DimensionValue::Bool(*v),
        FieldValue::Str(s) => {
            if hash_strings {
                DimensionValue::StrHash(hash_string(s))
            } else {
                DimensionValue::Str(s.clone())
            }
        }
        FieldValue::Chain(nodes) => DimensionValue::Tuple(
            nodes
                .iter()
                .enumerate()
                .map(|(i, n)| DimensionsValue {
                    field: i as FieldId + 1,
                    value: DimensionValue::Tuple(vec![
                        DimensionsValue {
                            field: crate::event::CHAIN_FIELD_UID,
                            value: DimensionValue::Int(n.uid),
                        },
                        DimensionsValue {
                            field: crate::event::CHAIN_FIELD_TAG,
                            value: if hash_strings {
                                DimensionValue::StrHash(hash_string(&n.tag))
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

/// SHA-256 truncated to the first 8 bytes, big-endian.
pub fn hash_string(s: &str) -> u64 {
    let digest = Sha256::digest(s.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().unwrap_or_default())
}

// --- Bucket infos per metric kind ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountBucketInfo {
    pub start_bucket_elapsed_ns: i64,
    pub end_bucket_elapsed_ns: i64,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationBucketInfo {
    pub start_bucket_elapsed_ns: i64,
    pub end_bucket_elapsed_ns: i64,
    pub duration_ns: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueBucketInfo {
    pub start_bucket_elapsed_ns: i64,
    pub end_bucket_elapsed_ns: i64,
    pub value: i64,
}

/// One captured field value inside a gauge atom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValueInfo {
    pub field: FieldId,
    pub value: DimensionValue,
}

/// One gauge snapshot: the capture time plus the captured field values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeAtomInfo {
    pub elapsed_ns: i64,
    pub values: Vec<FieldValueInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeBucketInfo {
    pub start_bucket_elapsed_ns: i64,
    pub end_bucket_elapsed_ns: i64,
    pub atoms: Vec<GaugeAtomInfo>,
}

/// Per-dimension-key data for one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionData<B> {
    pub dimensions_in_what: Vec<DimensionsValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions_in_condition: Option<Vec<DimensionsValue>>,
    pub buckets: Vec<B>,
}

/// Per-metric report payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricData {
    Count {
        data: Vec<DimensionData<CountBucketInfo>>,
        skipped: Vec<SkippedInterval>,
    },
    Duration {
        data: Vec<DimensionData<DurationBucketInfo>>,
        skipped: Vec<SkippedInterval>,
    },
    Value {
        data: Vec<DimensionData<ValueBucketInfo>>,
        skipped: Vec<SkippedInterval>,
    },
    Gauge {
        data: Vec<DimensionData<GaugeBucketInfo>>,
        skipped: Vec<SkippedInterval>,
    },
}

impl MetricData {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Count { data, skipped } => data.is_empty() && skipped.is_empty(),
            Self::Duration { data, skipped } => data.is_empty() && skipped.is_empty(),
            Self::Value { data, skipped } => data.is_empty() && skipped.is_empty(),
            Self::Gauge { data, skipped } => data.is_empty() && skipped.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReport {
    pub metric_id: i64,
    #[serde(flatten)]
    pub data: MetricData,
}

/// One dump's worth of data for one config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigMetricsReport {
    pub current_report_elapsed_ns: i64,
    pub last_report_elapsed_ns: i64,
    pub current_report_wall_clock_ns: i64,
    pub dump_reason: DumpReason,
    pub dump_latency: DumpLatency,
    pub metrics: Vec<MetricReport>,
}

/// The full dump result for one config key: the current report plus any
/// locally-persisted historical reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigMetricsReportList {
    pub key: ConfigKey,
    pub reports: Vec<ConfigMetricsReport>,
}
