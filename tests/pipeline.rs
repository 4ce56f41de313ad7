//! End-to-end pipeline tests: YAML configs in, typed events through the
//! processor, structured reports out.

use metricsd::config::{Config, ConfigKey, PipelineConfig};
use metricsd::event::{Event, FieldValue, TagId};
use metricsd::processor::{DumpOptions, Processor};
use metricsd::report::{ConfigMetricsReportList, DumpLatency, DumpReason, MetricData};

const SEC: i64 = 1_000_000_000;
const MIN: i64 = 60 * SEC;

const TAG_SCREEN_ON: TagId = 2;
const TAG_SCREEN_OFF: TagId = 3;
const TAG_ACQUIRE: TagId = 4;
const TAG_RELEASE: TagId = 5;
const TAG_APP_EVENT: TagId = 6;

fn daemon_config() -> Config {
    serde_yaml::from_str("{}").expect("default daemon config")
}

fn key() -> ConfigKey {
    ConfigKey {
        uid: 1000,
        config_id: 1,
    }
}

fn install(processor: &Processor, yaml: &str) {
    let cfg = PipelineConfig::from_yaml_bytes(yaml.as_bytes()).expect("pipeline config");
    processor.on_config_updated(0, 0, key(), cfg, false);
}

fn event(tag: TagId, t: i64, fields: Vec<FieldValue>) -> Event {
    Event::new(tag, 1000, t, t, fields)
}

fn dump(processor: &Processor, t: i64) -> ConfigMetricsReportList {
    processor.on_dump_report(
        key(),
        t,
        t,
        DumpOptions {
            include_current_bucket: true,
            include_strings: true,
            erase_data: false,
            reason: DumpReason::GetData,
            latency: DumpLatency::Immediate,
        },
    )
}

/// Wakelock-style setup: a duration metric over a per-uid held condition,
/// gated by screen-off.
fn wakelock_config() -> String {
    format!(
        r#"
id: 1
matchers:
  - {{ id: 1, kind: simple, tag_id: {TAG_SCREEN_ON} }}
  - {{ id: 2, kind: simple, tag_id: {TAG_SCREEN_OFF} }}
  - {{ id: 3, kind: simple, tag_id: {TAG_ACQUIRE} }}
  - {{ id: 4, kind: simple, tag_id: {TAG_RELEASE} }}
conditions:
  - {{ id: 10, kind: simple, start: 2, stop: 1, initial_value: "false" }}
  - id: 11
    kind: simple
    start: 3
    stop: 4
    dimensions:
      - {{ field: 1 }}
metrics:
  - id: 100
    what: 11
    condition: 10
    type: duration
    aggregation: sum
    bucket: one_minute
"#
    )
}

fn duration_buckets(list: &ConfigMetricsReportList) -> Vec<(i64, i64, i64)> {
    list.reports
        .iter()
        .flat_map(|r| &r.metrics)
        .flat_map(|m| match &m.data {
            MetricData::Duration { data, .. } => data
                .iter()
                .flat_map(|d| &d.buckets)
                .map(|b| {
                    (
                        b.start_bucket_elapsed_ns,
                        b.end_bucket_elapsed_ns,
                        b.duration_ns,
                    )
                })
                .collect::<Vec<_>>(),
            _ => Vec::new(),
        })
        .collect()
}

#[test]
fn duration_sum_equals_condition_intersection() {
    let processor = Processor::new(&daemon_config(), None);
    install(&processor, &wakelock_config());

    let uid = FieldValue::Int(42);
    // Wakelock held from 0; screen off during [200ns, 1min+500ns).
    processor.on_log_event(&event(TAG_ACQUIRE, 0, vec![uid.clone()]));
    processor.on_log_event(&event(TAG_SCREEN_OFF, 200, Vec::new()));
    processor.on_log_event(&event(TAG_SCREEN_ON, MIN + 500, Vec::new()));
    processor.on_log_event(&event(TAG_RELEASE, MIN + 1000, vec![uid]));

    let report = dump(&processor, 2 * MIN);
    let buckets = duration_buckets(&report);
    assert_eq!(buckets.len(), 2, "buckets: {buckets:?}");

    // First bucket: screen-off time within [0, 1min) is 1min - 200ns.
    assert_eq!(buckets[0], (0, MIN, MIN - 200));
    // Second bucket: the 500ns tail of the screen-off interval.
    assert_eq!(buckets[1].2, 500);
}

#[test]
fn bucket_alignment_invariant_holds_across_jumps() {
    let processor = Processor::new(&daemon_config(), None);
    install(
        &processor,
        &format!(
            r#"
id: 1
matchers:
  - {{ id: 1, kind: simple, tag_id: {TAG_APP_EVENT} }}
metrics:
  - id: 100
    what: 1
    type: count
    bucket: one_minute
    dimensions:
      - {{ field: 1 }}
"#
        ),
    );

    // Irregular, monotonically non-decreasing trace with large gaps.
    let times = [10, 20, MIN + 1, MIN + 2, 7 * MIN + 5, 7 * MIN + 6, 30 * MIN];
    for (i, t) in times.iter().enumerate() {
        processor.on_log_event(&event(
            TAG_APP_EVENT,
            *t,
            vec![FieldValue::Int((i % 2) as i32)],
        ));
    }

    let report = dump(&processor, 31 * MIN);
    for rep in &report.reports {
        for m in &rep.metrics {
            let MetricData::Count { data, .. } = &m.data else {
                panic!("count data");
            };
            for dim in data {
                let mut prev_end = 0;
                for b in &dim.buckets {
                    assert!(b.start_bucket_elapsed_ns < b.end_bucket_elapsed_ns);
                    assert_eq!(
                        b.start_bucket_elapsed_ns % MIN,
                        0,
                        "bucket start aligned to bucket size"
                    );
                    assert!(
                        b.start_bucket_elapsed_ns >= prev_end,
                        "no overlap or negative gap"
                    );
                    prev_end = b.end_bucket_elapsed_ns;
                }
            }
        }
    }
}

#[test]
fn count_gated_by_condition_counts_exactly() {
    let processor = Processor::new(&daemon_config(), None);
    install(
        &processor,
        &format!(
            r#"
id: 1
matchers:
  - {{ id: 1, kind: simple, tag_id: {TAG_APP_EVENT} }}
  - {{ id: 2, kind: simple, tag_id: {TAG_SCREEN_OFF} }}
  - {{ id: 3, kind: simple, tag_id: {TAG_SCREEN_ON} }}
conditions:
  - {{ id: 10, kind: simple, start: 2, stop: 3, initial_value: "false" }}
metrics:
  - id: 100
    what: 1
    condition: 10
    type: count
    bucket: one_minute
"#
        ),
    );

    processor.on_log_event(&event(TAG_APP_EVENT, 100, Vec::new())); // gate false
    processor.on_log_event(&event(TAG_SCREEN_OFF, 200, Vec::new()));
    processor.on_log_event(&event(TAG_APP_EVENT, 300, Vec::new())); // counted
    processor.on_log_event(&event(TAG_APP_EVENT, 400, Vec::new())); // counted
    processor.on_log_event(&event(TAG_SCREEN_ON, 500, Vec::new()));
    processor.on_log_event(&event(TAG_APP_EVENT, 600, Vec::new())); // gate false

    let report = dump(&processor, MIN);
    let total: i64 = report
        .reports
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
        .sum();
    assert_eq!(total, 2);
}

#[test]
fn forced_split_below_minimum_reports_skipped_interval() {
    let processor = Processor::new(&daemon_config(), None);
    install(
        &processor,
        &format!(
            r#"
id: 1
matchers:
  - {{ id: 1, kind: simple, tag_id: {TAG_APP_EVENT} }}
metrics:
  - id: 100
    what: 1
    type: count
    bucket: five_minutes
    min_bucket_size: 1m
"#
        ),
    );

    processor.note_app_installed(9999);
    processor.on_log_event(&event(TAG_APP_EVENT, 10, Vec::new()));
    // Upgrade 30s in, below the 60s minimum partial bucket size. The
    // sub-millisecond part of the timestamp must be truncated away.
    processor.on_app_upgraded(9999, 30 * SEC + 123_456);

    let report = dump(&processor, MIN);
    let (data_buckets, skipped): (usize, Vec<(i64, i64)>) = report
        .reports
        .iter()
        .flat_map(|r| &r.metrics)
        .map(|m| match &m.data {
            MetricData::Count { data, skipped } => (
                data.iter().map(|d| d.buckets.len()).sum::<usize>(),
                skipped
                    .iter()
                    .map(|s| (s.start_elapsed_ns, s.end_elapsed_ns))
                    .collect::<Vec<_>>(),
            ),
            _ => (0, Vec::new()),
        })
        .fold((0, Vec::new()), |(a, mut v), (b, mut w)| {
            v.append(&mut w);
            (a + b, v)
        });

    assert_eq!(skipped.len(), 1, "exactly one skipped interval");
    assert_eq!(skipped[0].1, 30 * SEC, "millisecond-truncated split end");
    // The in-progress partial bucket after the split is present (dump
    // includes the current bucket); the dropped pre-split data is not.
    assert_eq!(data_buckets, 0, "dropped partial does not appear as data");
}

#[test]
fn upgrade_of_unknown_uid_does_not_split() {
    let processor = Processor::new(&daemon_config(), None);
    install(
        &processor,
        &format!(
            r#"
id: 1
matchers:
  - {{ id: 1, kind: simple, tag_id: {TAG_APP_EVENT} }}
metrics:
  - id: 100
    what: 1
    type: count
    bucket: one_minute
"#
        ),
    );

    processor.on_log_event(&event(TAG_APP_EVENT, 10, Vec::new()));
    // Never-seen uid: treated as a fresh install, no split.
    processor.on_app_upgraded(4242, 30 * SEC);
    processor.on_log_event(&event(TAG_APP_EVENT, 40 * SEC, Vec::new()));

    let report = dump(&processor, MIN);
    let ends: Vec<i64> = report
        .reports
        .iter()
        .flat_map(|r| &r.metrics)
        .flat_map(|m| match &m.data {
            MetricData::Count { data, .. } => data
                .iter()
                .flat_map(|d| &d.buckets)
                .map(|b| b.end_bucket_elapsed_ns)
                .collect::<Vec<_>>(),
            _ => Vec::new(),
        })
        .collect();
    assert_eq!(ends, vec![MIN], "single untouched bucket");
}

#[test]
fn anomaly_fires_once_inside_refractory_period() {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    let processor = Processor::new(&daemon_config(), None);
    let fired = Arc::new(AtomicU32::new(0));
    let fired_clone = Arc::clone(&fired);
    processor.set_alert_handler(Arc::new(move |_| {
        fired_clone.fetch_add(1, Ordering::Relaxed);
    }));

    install(
        &processor,
        &format!(
            r#"
id: 1
matchers:
  - {{ id: 1, kind: simple, tag_id: {TAG_APP_EVENT} }}
metrics:
  - id: 100
    what: 1
    type: count
    bucket: one_minute
alerts:
  - id: 7
    metric_id: 100
    num_buckets: 2
    trigger_if_sum_gt: 1
    refractory_period_secs: 120
"#
        ),
    );

    // Two events per bucket keep the rolling sum above threshold in every
    // bucket, but the 120s refractory allows one fire per two buckets.
    for bucket in 0..4 {
        processor.on_log_event(&event(TAG_APP_EVENT, bucket * MIN + 10, Vec::new()));
        processor.on_log_event(&event(TAG_APP_EVENT, bucket * MIN + 20, Vec::new()));
        processor.on_periodic_tick((bucket + 1) * MIN, (bucket + 1) * MIN);
    }

    // Fires at bucket end 60s (refractory to 180s), suppressed at 120s,
    // fires again once the refractory has fully elapsed at 180s, then
    // suppressed at 240s.
    assert_eq!(fired.load(Ordering::Relaxed), 2);
}

#[test]
fn string_hashing_applies_to_report_dimensions() {
    let processor = Processor::new(&daemon_config(), None);
    install(
        &processor,
        &format!(
            r#"
id: 1
hash_strings_in_report: true
matchers:
  - {{ id: 1, kind: simple, tag_id: {TAG_APP_EVENT} }}
metrics:
  - id: 100
    what: 1
    type: count
    bucket: one_minute
    dimensions:
      - {{ field: 1 }}
"#
        ),
    );

    processor.on_log_event(&event(
        TAG_APP_EVENT,
        10,
        vec![FieldValue::Str("com.example.app".into())],
    ));

    let report = dump(&processor, MIN);
    let json = serde_json::to_string(&report).expect("serialize");
    assert!(
        !json.contains("com.example.app"),
        "raw string must not appear in a hashed report"
    );
    assert!(json.contains("str_hash"));
}
