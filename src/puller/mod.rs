//! Pull sources: collaborators that produce events on demand (hardware
//! counters, process stats). The registry caches results per tag with a
//! minimum re-pull interval, tracks per-tag diagnostics, discards pulls
//! that exceed the maximum allowed delay, and stops retrying sources that
//! are persistently unavailable.

use anyhow::Result;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::config::PullerConfig;
use crate::event::{Event, TagId};
use crate::time::monotonic_ns;

/// A source of pulled events for one tag.
pub trait PullSource: Send + Sync {
    fn tag_id(&self) -> TagId;

    /// Produces the current events for this tag. `deadline_ns` is the
    /// elapsed-time instant after which the result will be discarded.
    fn pull(&self, deadline_ns: i64) -> Result<Vec<Event>>;
}

/// Read-only per-tag pull diagnostics.
#[derive(Debug, Clone, Default)]
pub struct PullStats {
    pub total_pulls: u64,
    pub cache_hits: u64,
    pub failures: u64,
    pub discarded_late: u64,
    /// Smallest observed interval between real pulls, ns. Zero until two
    /// pulls happened.
    pub min_interval_ns: i64,
    pub unavailable: bool,
}

#[derive(Debug, Default)]
struct TagState {
    stats: PullStats,
    consecutive_failures: u32,
    last_pull_ns: i64,
    cached: Option<(i64, Vec<Event>)>,
}

/// Registry of pull sources with caching and failure memory.
pub struct PullerRegistry {
    cfg: PullerConfig,
    sources: DashMap<TagId, Box<dyn PullSource>>,
    tags: DashMap<TagId, TagState>,
}

impl std::fmt::Debug for PullerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullerRegistry")
            .field("sources", &self.sources.len())
            .finish()
    }
}

impl PullerRegistry {
    pub fn new(cfg: PullerConfig) -> Self {
        Self {
            cfg,
            sources: DashMap::new(),
            tags: DashMap::new(),
        }
    }

    pub fn register(&self, source: Box<dyn PullSource>) {
        let tag = source.tag_id();
        self.sources.insert(tag, source);
        self.tags.entry(tag).or_default();
    }

    /// Diagnostics for one tag.
    pub fn stats(&self, tag: TagId) -> Option<PullStats> {
        self.tags.get(&tag).map(|s| s.stats.clone())
    }

    /// Pulls events for a tag, serving cached data inside the minimum
    /// re-pull interval. Returns None when the tag has no source, the
    /// source is unavailable, the pull failed, or the result arrived past
    /// the maximum allowed delay.
    pub fn pull(&self, tag: TagId, now_ns: i64) -> Option<Vec<Event>> {
        let mut state = self.tags.entry(tag).or_default();

        if state.stats.unavailable {
            return None;
        }

        let min_interval = self.cfg.min_repull_interval.as_nanos() as i64;
        let cache_hit = match &state.cached {
            Some((pulled_at, events)) if now_ns - pulled_at < min_interval => {
                Some(events.clone())
            }
            _ => None,
        };
        if let Some(events) = cache_hit {
            state.stats.cache_hits += 1;
            return Some(events);
        }

        let source = self.sources.get(&tag)?;
        let max_delay = self.cfg.max_pull_delay.as_nanos() as i64;
        let deadline = now_ns + max_delay;

        let result = source.pull(deadline);
        let finished_ns = monotonic_ns();

        match result {
            Ok(events) => {
                // A pull completing past the deadline is discarded whole;
                // no partial application.
                if finished_ns > deadline {
                    state.stats.discarded_late += 1;
                    warn!(tag, "pull exceeded max delay, discarding result");
                    return None;
                }

                state.consecutive_failures = 0;
                state.stats.total_pulls += 1;
                if state.last_pull_ns > 0 {
                    let interval = now_ns - state.last_pull_ns;
                    if state.stats.min_interval_ns == 0 || interval < state.stats.min_interval_ns {
                        state.stats.min_interval_ns = interval;
                    }
                }
                state.last_pull_ns = now_ns;
                state.cached = Some((now_ns, events.clone()));
                debug!(tag, count = events.len(), "pulled events");
                Some(events)
            }
            Err(e) => {
                state.stats.failures += 1;
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.cfg.failure_threshold {
                    state.stats.unavailable = true;
                    warn!(tag, error = %e, "pull source marked unavailable, no further retries");
                } else {
                    warn!(tag, error = %e, "pull failed");
                }
                None
            }
        }
    }
}

/// Rewrites pulled events onto the bucket boundary they were scheduled
/// for, so a slightly-late arrival still lands in its intended bucket.
pub fn rebase_events(events: Vec<Event>, intended_elapsed_ns: i64) -> Vec<Event> {
    events
        .into_iter()
        .map(|e| {
            let fields = e.fields().map(|(_, v)| v.clone()).collect();
            Event::new(
                e.tag_id,
                e.source_uid,
                intended_elapsed_ns,
                e.wall_clock_ns,
                fields,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::event::FieldValue;

    struct FakeSource {
        tag: TagId,
        calls: Arc<AtomicU32>,
        fail: bool,
    }

    impl PullSource for FakeSource {
        fn tag_id(&self) -> TagId {
            self.tag
        }

        fn pull(&self, _deadline_ns: i64) -> Result<Vec<Event>> {
            let n = self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                anyhow::bail!("hal unavailable");
            }
            Ok(vec![Event::new(
                self.tag,
                0,
                0,
                0,
                vec![FieldValue::Long(i64::from(n))],
            )])
        }
    }

    fn registry(min_repull_ms: u64) -> PullerRegistry {
        PullerRegistry::new(PullerConfig {
            min_repull_interval: Duration::from_millis(min_repull_ms),
            max_pull_delay: Duration::from_secs(10),
            failure_threshold: 3,
        })
    }

    #[test]
    fn test_cache_serves_within_min_interval() {
        let reg = registry(1000);
        let calls = Arc::new(AtomicU32::new(0));
        reg.register(Box::new(FakeSource {
            tag: 50,
            calls: Arc::clone(&calls),
            fail: false,
        }));

        let now = monotonic_ns();
        assert!(reg.pull(50, now).is_some());
        assert!(reg.pull(50, now + 1000).is_some());
        assert_eq!(calls.load(Ordering::Relaxed), 1, "second pull was cached");

        let stats = reg.stats(50).expect("stats");
        assert_eq!(stats.total_pulls, 1);
        assert_eq!(stats.cache_hits, 1);
    }

    #[test]
    fn test_repull_after_interval() {
        let reg = registry(0);
        let calls = Arc::new(AtomicU32::new(0));
        reg.register(Box::new(FakeSource {
            tag: 50,
            calls: Arc::clone(&calls),
            fail: false,
        }));

        let now = monotonic_ns();
        reg.pull(50, now);
        reg.pull(50, now + 1_000_000);
        assert_eq!(calls.load(Ordering::Relaxed), 2);

        let stats = reg.stats(50).expect("stats");
        assert_eq!(stats.min_interval_ns, 1_000_000);
    }

    #[test]
    fn test_persistent_failure_marks_unavailable() {
        let reg = registry(0);
        let calls = Arc::new(AtomicU32::new(0));
        reg.register(Box::new(FakeSource {
            tag: 51,
            calls: Arc::clone(&calls),
            fail: true,
        }));

        let now = monotonic_ns();
        for i in 0..5 {
            assert!(reg.pull(51, now + i).is_none());
        }
        // Three failures, then fail-fast with no more source calls.
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert!(reg.stats(51).expect("stats").unavailable);
    }

    #[test]
    fn test_unknown_tag_returns_none() {
        let reg = registry(0);
        assert!(reg.pull(99, monotonic_ns()).is_none());
    }

    #[test]
    fn test_rebase_events_moves_elapsed_only() {
        let events = vec![Event::new(7, 10, 123, 456, vec![FieldValue::Int(1)])];
        let rebased = rebase_events(events, 999);
        assert_eq!(rebased[0].elapsed_ns, 999);
        assert_eq!(rebased[0].wall_clock_ns, 456);
        assert_eq!(rebased[0].field(1), Some(&FieldValue::Int(1)));
    }
}
