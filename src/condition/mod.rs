//! Condition tracker network: stateful boolean predicates over event
//! history. Simple conditions flip on start/stop/stop-all matcher firings
//! (optionally sliced per dimension key, optionally counting nested
//! start/stop pairs); combination conditions recompute from their children.
//!
//! Evaluation is strictly children-before-parents via a topological order
//! resolved at build time, so a condition's change propagates to dependent
//! combinations within the same dispatch pass.

use std::collections::HashMap;

use crate::config::{
    ConditionConfig, ConditionInitialValue, ConditionKind, ConfigError, LogicalOperation,
};
use crate::dimension::{extract_keys, DimensionKey, FieldMatcher};
use crate::event::Event;
use crate::matcher::{MatcherNetwork, MatcherResults};

/// Truth value of a condition. Trackers start Unknown (or False when the
/// config says so) and never enter a terminal state; they live as long as
/// their manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionState {
    Unknown,
    False,
    True,
}

impl ConditionState {
    /// Gating semantics: only a known-true condition passes.
    pub fn is_true(self) -> bool {
        self == Self::True
    }
}

impl From<ConditionInitialValue> for ConditionState {
    fn from(v: ConditionInitialValue) -> Self {
        match v {
            ConditionInitialValue::Unknown => Self::Unknown,
            ConditionInitialValue::False => Self::False,
        }
    }
}

/// A per-key truth transition of a sliced simple condition, reported to
/// whoever subscribes to the condition (duration metrics mainly).
#[derive(Debug, Clone)]
pub struct SlicedChange {
    pub condition: usize,
    pub key: DimensionKey,
    pub met: bool,
}

/// Per-event evaluation outcome.
#[derive(Debug, Default)]
pub struct ConditionResults {
    /// Which trackers' overall value changed this event.
    pub changed: Vec<bool>,
    /// Per-key transitions of sliced conditions.
    pub sliced_changes: Vec<SlicedChange>,
}

#[derive(Debug, Clone)]
struct SimpleCondition {
    start: usize,
    stop: Option<usize>,
    stop_all: Option<usize>,
    count_nesting: bool,
    dimensions: Vec<FieldMatcher>,
    /// Nesting count per key; only non-zero entries are kept.
    sliced: HashMap<DimensionKey, u32>,
    /// Nesting count for the unsliced case.
    unsliced_count: u32,
}

impl SimpleCondition {
    fn is_sliced(&self) -> bool {
        !self.dimensions.is_empty()
    }

    fn drop_one(count: &mut u32, count_nesting: bool) -> bool {
        if *count == 0 {
            return false;
        }
        if count_nesting {
            *count -= 1;
        } else {
            *count = 0;
        }
        *count == 0
    }
}

#[derive(Debug, Clone)]
struct CombinationCondition {
    operation: LogicalOperation,
    children: Vec<usize>,
}

#[derive(Debug, Clone)]
enum ConditionTracker {
    Simple(SimpleCondition),
    Combination(CombinationCondition),
}

/// The built condition network for one config.
#[derive(Debug)]
pub struct ConditionNetwork {
    ids: Vec<i64>,
    trackers: Vec<ConditionTracker>,
    id_to_index: HashMap<i64, usize>,
    eval_order: Vec<usize>,
    states: Vec<ConditionState>,
}

impl ConditionNetwork {
    /// Builds the network against an already-built matcher network.
    pub fn build(
        configs: &[ConditionConfig],
        matchers: &MatcherNetwork,
    ) -> Result<Self, ConfigError> {
        let mut id_to_index = HashMap::with_capacity(configs.len());
        for (i, c) in configs.iter().enumerate() {
            if id_to_index.insert(c.id, i).is_some() {
                return Err(ConfigError::DuplicateId {
                    kind: "condition",
                    id: c.id,
                });
            }
        }

        let mut trackers = Vec::with_capacity(configs.len());
        let mut initial = Vec::with_capacity(configs.len());
        for c in configs {
            match &c.kind {
                ConditionKind::Simple {
                    start,
                    stop,
                    stop_all,
                    count_nesting,
                    dimensions,
                    initial_value,
                } => {
                    let resolve = |id: i64| {
                        matchers
                            .index_of(id)
                            .ok_or(ConfigError::DanglingReference {
                                kind: "condition",
                                from: c.id,
                                target_kind: "matcher",
                                to: id,
                            })
                    };
                    trackers.push(ConditionTracker::Simple(SimpleCondition {
                        start: resolve(*start)?,
                        stop: stop.map(resolve).transpose()?,
                        stop_all: stop_all.map(resolve).transpose()?,
                        count_nesting: *count_nesting,
                        dimensions: dimensions.clone(),
                        sliced: HashMap::new(),
                        unsliced_count: 0,
                    }));
                    initial.push(ConditionState::from(*initial_value));
                }
                ConditionKind::Combination {
                    operation,
                    condition_ids,
                } => {
                    let mut children = Vec::with_capacity(condition_ids.len());
                    for r in condition_ids {
                        let idx = *id_to_index.get(r).ok_or(ConfigError::DanglingReference {
                            kind: "condition",
                            from: c.id,
                            target_kind: "condition",
                            to: *r,
                        })?;
                        children.push(idx);
                    }
                    trackers.push(ConditionTracker::Combination(CombinationCondition {
                        operation: *operation,
                        children,
                    }));
                    initial.push(ConditionState::Unknown);
                }
            }
        }

        let adjacency: Vec<Vec<usize>> = trackers
            .iter()
            .map(|t| match t {
                ConditionTracker::Simple(_) => Vec::new(),
                ConditionTracker::Combination(c) => c.children.clone(),
            })
            .collect();
        let eval_order =
            crate::graph::topo_order(&adjacency).map_err(|node| ConfigError::Cycle {
                kind: "condition",
                id: configs[node].id,
            })?;

        let mut net = Self {
            ids: configs.iter().map(|c| c.id).collect(),
            trackers,
            id_to_index,
            eval_order,
            states: initial,
        };

        // Seed combination states from their children so AND-of-nothing
        // starts true and OR-of-nothing starts false.
        for &i in &net.eval_order.clone() {
            if let ConditionTracker::Combination(c) = &net.trackers[i] {
                net.states[i] = combine(c.operation, &c.children, &net.states);
            }
        }

        Ok(net)
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    pub fn index_of(&self, id: i64) -> Option<usize> {
        self.id_to_index.get(&id).copied()
    }

    pub fn id_at(&self, index: usize) -> i64 {
        self.ids[index]
    }

    /// Current overall value of a tracker. For a sliced simple condition
    /// this is "true iff any key is currently met".
    pub fn state(&self, index: usize) -> ConditionState {
        self.states[index]
    }

    /// Whether the tracker keeps per-dimension-key state.
    pub fn is_sliced(&self, index: usize) -> bool {
        matches!(&self.trackers[index], ConditionTracker::Simple(s) if s.is_sliced())
    }

    /// Queries a condition for a specific dimension key. Unsliced trackers
    /// ignore the key; combinations apply their operation over children
    /// queried with the same key.
    pub fn query(&self, index: usize, key: &DimensionKey) -> ConditionState {
        match &self.trackers[index] {
            ConditionTracker::Simple(s) => {
                if !s.is_sliced() || key.is_empty() {
                    self.states[index]
                } else if s.sliced.get(key).copied().unwrap_or(0) > 0 {
                    ConditionState::True
                } else {
                    ConditionState::False
                }
            }
            ConditionTracker::Combination(c) => {
                let child_states: Vec<ConditionState> = c
                    .children
                    .iter()
                    .map(|&child| self.query(child, key))
                    .collect();
                combine_values(c.operation, &child_states)
            }
        }
    }

    /// Carries truth state over from a previous network for trackers whose
    /// definitions survived a modular config update, then recomputes every
    /// combination from its (possibly carried) children.
    pub fn carry_state_from(
        &mut self,
        old: &ConditionNetwork,
        unchanged_ids: &std::collections::HashSet<i64>,
    ) {
        for &id in unchanged_ids {
            let (Some(ni), Some(oi)) = (self.index_of(id), old.index_of(id)) else {
                continue;
            };
            self.states[ni] = old.states[oi];
            if let (ConditionTracker::Simple(new_s), ConditionTracker::Simple(old_s)) =
                (&mut self.trackers[ni], &old.trackers[oi])
            {
                new_s.sliced = old_s.sliced.clone();
                new_s.unsliced_count = old_s.unsliced_count;
            }
        }

        for &i in &self.eval_order.clone() {
            if let ConditionTracker::Combination(c) = &self.trackers[i] {
                self.states[i] = combine(c.operation, &c.children, &self.states);
            }
        }
    }

    /// Updates every tracker for one event, children before parents.
    pub fn on_event(&mut self, event: &Event, matched: &MatcherResults) -> ConditionResults {
        let mut results = ConditionResults {
            changed: vec![false; self.trackers.len()],
            sliced_changes: Vec::new(),
        };

        let order = self.eval_order.clone();
        for &i in &order {
            let old = self.states[i];
            let new = match &mut self.trackers[i] {
                ConditionTracker::Simple(s) => {
                    evaluate_simple(i, s, old, event, matched, &mut results.sliced_changes)
                }
                ConditionTracker::Combination(c) => combine(c.operation, &c.children, &self.states),
            };
            if new != old {
                self.states[i] = new;
                results.changed[i] = true;
            } else if results
                .sliced_changes
                .iter()
                .any(|sc| sc.condition == i)
            {
                // Per-key transitions count as a change even when the
                // overall any-key view is stable.
                results.changed[i] = true;
            }
        }

        results
    }
}

fn evaluate_simple(
    index: usize,
    s: &mut SimpleCondition,
    old: ConditionState,
    event: &Event,
    matched: &MatcherResults,
    sliced_changes: &mut Vec<SlicedChange>,
) -> ConditionState {
    let start_fired = matched.matched[s.start];
    let stop_fired = s.stop.map(|m| matched.matched[m]).unwrap_or(false);
    let stop_all_fired = s.stop_all.map(|m| matched.matched[m]).unwrap_or(false);

    if !start_fired && !stop_fired && !stop_all_fired {
        return old;
    }

    if !s.is_sliced() {
        if stop_all_fired {
            s.unsliced_count = 0;
        }
        if stop_fired {
            SimpleCondition::drop_one(&mut s.unsliced_count, s.count_nesting);
        }
        if start_fired {
            if s.count_nesting {
                s.unsliced_count = s.unsliced_count.saturating_add(1);
            } else {
                s.unsliced_count = 1;
            }
        }
        return if s.unsliced_count > 0 {
            ConditionState::True
        } else {
            ConditionState::False
        };
    }

    if stop_all_fired {
        for key in s.sliced.keys() {
            sliced_changes.push(SlicedChange {
                condition: index,
                key: key.clone(),
                met: false,
            });
        }
        s.sliced.clear();
    }

    if stop_fired {
        for key in extract_keys(event, &s.dimensions) {
            if let Some(count) = s.sliced.get_mut(&key) {
                if SimpleCondition::drop_one(count, s.count_nesting) {
                    s.sliced.remove(&key);
                    sliced_changes.push(SlicedChange {
                        condition: index,
                        key,
                        met: false,
                    });
                }
            }
        }
    }

    if start_fired {
        for key in extract_keys(event, &s.dimensions) {
            let count = s.sliced.entry(key.clone()).or_insert(0);
            let was_zero = *count == 0;
            if s.count_nesting {
                *count = count.saturating_add(1);
            } else {
                *count = 1;
            }
            if was_zero {
                sliced_changes.push(SlicedChange {
                    condition: index,
                    key,
                    met: true,
                });
            }
        }
    }

    if s.sliced.is_empty() {
        ConditionState::False
    } else {
        ConditionState::True
    }
}

fn combine(op: LogicalOperation, children: &[usize], states: &[ConditionState]) -> ConditionState {
    let child_states: Vec<ConditionState> = children.iter().map(|&c| states[c]).collect();
    combine_values(op, &child_states)
}

/// Combines child truth values. The empty-combination identities are
/// deliberate: AND of nothing is true, OR of nothing is false.
fn combine_values(op: LogicalOperation, children: &[ConditionState]) -> ConditionState {
    match op {
        LogicalOperation::And => {
            if children.iter().any(|&c| c == ConditionState::False) {
                ConditionState::False
            } else if children.iter().any(|&c| c == ConditionState::Unknown) {
                ConditionState::Unknown
            } else {
                ConditionState::True
            }
        }
        LogicalOperation::Or => {
            if children.iter().any(|&c| c == ConditionState::True) {
                ConditionState::True
            } else if children.iter().any(|&c| c == ConditionState::Unknown) {
                ConditionState::Unknown
            } else {
                ConditionState::False
            }
        }
        LogicalOperation::Not => match children.first() {
            Some(ConditionState::True) => ConditionState::False,
            Some(ConditionState::False) => ConditionState::True,
            _ => ConditionState::Unknown,
        },
    }
}
