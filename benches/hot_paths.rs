use criterion::{black_box, criterion_group, criterion_main, Criterion};

use metricsd::config::{
    ConfigKey, FieldPredicate, FieldValueMatcherConfig, LogicalOperation, MatcherConfig,
    MatcherKind, MetricConfig, MetricKind, PipelineConfig, TimeUnit,
};
use metricsd::dimension::FieldMatcher;
use metricsd::event::{Event, FieldValue};
use metricsd::manager::MetricsManager;
use metricsd::matcher::MatcherNetwork;

fn matcher_configs() -> Vec<MatcherConfig> {
    let mut matchers = Vec::new();
    for i in 0..16 {
        matchers.push(MatcherConfig {
            id: i + 1,
            kind: MatcherKind::Simple {
                tag_id: 10 + (i as u32 % 4),
                field_matchers: vec![FieldValueMatcherConfig {
                    field: 1,
                    position: None,
                    predicate: FieldPredicate::EqInt(i % 3),
                }],
            },
        });
    }
    matchers.push(MatcherConfig {
        id: 100,
        kind: MatcherKind::Combination {
            operation: LogicalOperation::Or,
            matcher_ids: (1..=16).collect(),
        },
    });
    matchers
}

fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        id: 1,
        allowed_log_sources: Vec::new(),
        ttl_secs: None,
        hash_strings_in_report: false,
        persist_locally: false,
        no_report_metrics: Vec::new(),
        matchers: matcher_configs(),
        conditions: Vec::new(),
        metrics: vec![MetricConfig {
            id: 1000,
            what: 100,
            condition: None,
            links: None,
            dimensions: vec![FieldMatcher::leaf(1)],
            bucket: TimeUnit::FiveMinutes,
            min_bucket_size: None,
            kind: MetricKind::Count,
        }],
        alerts: Vec::new(),
        periodic_alarms: Vec::new(),
        activations: Vec::new(),
    }
}

fn bench_matcher_network(c: &mut Criterion) {
    let net = MatcherNetwork::build(&matcher_configs()).expect("network");
    let hit = Event::new(10, 1000, 100, 100, vec![FieldValue::Int(0)]);
    let uninteresting = Event::new(999, 1000, 100, 100, vec![FieldValue::Int(0)]);

    c.bench_function("matcher_eval_hit", |b| {
        b.iter(|| black_box(net.matches(black_box(&hit))))
    });
    c.bench_function("matcher_eval_uninteresting_tag", |b| {
        b.iter(|| black_box(net.matches(black_box(&uninteresting))))
    });
}

fn bench_manager_dispatch(c: &mut Criterion) {
    let key = ConfigKey {
        uid: 0,
        config_id: 1,
    };
    let mut manager = MetricsManager::new(key, pipeline_config(), 0, 800, None);
    let mut t = 0i64;

    c.bench_function("manager_event_dispatch", |b| {
        b.iter(|| {
            t += 1_000;
            let event = Event::new(10, 1000, t, t, vec![FieldValue::Int(0)]);
            manager.on_event(black_box(&event));
        })
    });
}

criterion_group!(benches, bench_matcher_network, bench_manager_dispatch);
criterion_main!(benches);
