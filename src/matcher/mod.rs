//! Matcher network: classifies each incoming event against the config's
//! named matchers, producing the per-event set of matched tracker indices.
//!
//! Matchers form a DAG evaluated bottom-up in a topological order resolved
//! once at build time; each matcher's result is computed exactly once per
//! event. Events whose tag is in no simple matcher's interest set are
//! rejected by an O(1) set lookup before any evaluation.

use std::collections::{HashMap, HashSet};

use crate::config::{
    ConfigError, FieldPredicate, FieldValueMatcherConfig, LogicalOperation, MatcherConfig,
    MatcherKind,
};
use crate::dimension::Position;
use crate::event::{Event, FieldValue, TagId, CHAIN_FIELD_TAG, CHAIN_FIELD_UID};

/// One matcher, with combination children resolved to arena indices.
#[derive(Debug, Clone)]
enum MatcherTracker {
    Simple {
        tag_id: TagId,
        constraints: Vec<FieldValueMatcherConfig>,
    },
    Combination {
        operation: LogicalOperation,
        children: Vec<usize>,
    },
}

/// Per-event matcher results, indexed like the matcher arena.
#[derive(Debug, Clone)]
pub struct MatcherResults {
    pub matched: Vec<bool>,
}

impl MatcherResults {
    fn none(len: usize) -> Self {
        Self {
            matched: vec![false; len],
        }
    }

    pub fn any(&self) -> bool {
        self.matched.iter().any(|m| *m)
    }
}

/// The built matcher network for one config.
#[derive(Debug, Clone)]
pub struct MatcherNetwork {
    ids: Vec<i64>,
    trackers: Vec<MatcherTracker>,
    id_to_index: HashMap<i64, usize>,
    /// Topological order, children before parents.
    eval_order: Vec<usize>,
    interested_tags: HashSet<TagId>,
}

impl MatcherNetwork {
    /// Builds the network, resolving references and ordering evaluation.
    /// Dangling ids and cycles are config errors; dispatch never fails due
    /// to network structure.
    pub fn build(configs: &[MatcherConfig]) -> Result<Self, ConfigError> {
        let mut id_to_index = HashMap::with_capacity(configs.len());
        for (i, c) in configs.iter().enumerate() {
            if id_to_index.insert(c.id, i).is_some() {
                return Err(ConfigError::DuplicateId {
                    kind: "matcher",
                    id: c.id,
                });
            }
        }

        let mut trackers = Vec::with_capacity(configs.len());
        let mut interested_tags = HashSet::new();
        for c in configs {
            match &c.kind {
                MatcherKind::Simple {
                    tag_id,
                    field_matchers,
                } => {
                    interested_tags.insert(*tag_id);
                    trackers.push(MatcherTracker::Simple {
                        tag_id: *tag_id,
                        constraints: field_matchers.clone(),
                    });
                }
                MatcherKind::Combination {
                    operation,
                    matcher_ids,
                } => {
                    let mut children = Vec::with_capacity(matcher_ids.len());
                    for r in matcher_ids {
                        let idx = *id_to_index.get(r).ok_or(ConfigError::DanglingReference {
                            kind: "matcher",
                            from: c.id,
                            target_kind: "matcher",
                            to: *r,
                        })?;
                        children.push(idx);
                    }
                    trackers.push(MatcherTracker::Combination {
                        operation: *operation,
                        children,
                    });
                }
            }
        }

        let children: Vec<Vec<usize>> = trackers
            .iter()
            .map(|t| match t {
                MatcherTracker::Simple { .. } => Vec::new(),
                MatcherTracker::Combination { children, .. } => children.clone(),
            })
            .collect();
        let eval_order = crate::graph::topo_order(&children).map_err(|node| ConfigError::Cycle {
            kind: "matcher",
            id: configs[node].id,
        })?;

        Ok(Self {
            ids: configs.iter().map(|c| c.id).collect(),
            trackers,
            id_to_index,
            eval_order,
            interested_tags,
        })
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

    /// Whether any simple matcher is interested in this tag.
    pub fn interested_in(&self, tag_id: TagId) -> bool {
        self.interested_tags.contains(&tag_id)
    }

    /// Evaluates every matcher against one event. Each matcher is evaluated
    /// at most once; combination matchers read their children's cached
    /// results.
    pub fn matches(&self, event: &Event) -> MatcherResults {
        if !self.interested_in(event.tag_id) {
            return MatcherResults::none(self.trackers.len());
        }

        let mut matched = vec![false; self.trackers.len()];
        for &i in &self.eval_order {
            matched[i] = match &self.trackers[i] {
                MatcherTracker::Simple {
                    tag_id,
                    constraints,
                } => {
                    event.tag_id == *tag_id
                        && constraints.iter().all(|c| match_field(event, c))
                }
                MatcherTracker::Combination {
                    operation,
                    children,
                } => match operation {
                    LogicalOperation::And => children.iter().all(|&c| matched[c]),
                    LogicalOperation::Or => children.iter().any(|&c| matched[c]),
                    LogicalOperation::Not => !matched[children[0]],
                },
            };
        }

        MatcherResults { matched }
    }
}

/// Evaluates one field constraint against an event.
fn match_field(event: &Event, constraint: &FieldValueMatcherConfig) -> bool {
    let Some(value) = event.field(constraint.field) else {
        return false;
    };

    match (&constraint.predicate, value) {
        (FieldPredicate::Chain(subs), FieldValue::Chain(nodes)) => {
            if nodes.is_empty() {
                return false;
            }
            match constraint.position.unwrap_or(Position::Any) {
                Position::First => chain_node_matches(&nodes[0], subs),
                Position::Last => chain_node_matches(&nodes[nodes.len() - 1], subs),
                Position::Any => nodes.iter().any(|n| chain_node_matches(n, subs)),
                Position::All => nodes.iter().all(|n| chain_node_matches(n, subs)),
            }
        }
        (FieldPredicate::Chain(_), _) => false,
        (predicate, value) => match_scalar(predicate, value),
    }
}

fn chain_node_matches(
    node: &crate::event::AttributionNode,
    subs: &[FieldValueMatcherConfig],
) -> bool {
    subs.iter().all(|sub| {
        let value = match sub.field {
            CHAIN_FIELD_UID => FieldValue::Int(node.uid),
            CHAIN_FIELD_TAG => FieldValue::Str(node.tag.clone()),
            _ => return false,
        };
        match_scalar(&sub.predicate, &value)
    })
}

fn match_scalar(predicate: &FieldPredicate, value: &FieldValue) -> bool {
    match predicate {
        FieldPredicate::EqInt(want) => value.as_long() == Some(*want),
        FieldPredicate::EqAnyInt(wants) => value
            .as_long()
            .map(|v| wants.contains(&v))
            .unwrap_or(false),
        FieldPredicate::EqString(want) => matches!(value, FieldValue::Str(s) if s == want),
        FieldPredicate::EqBool(want) => matches!(value, FieldValue::Bool(b) if b == want),
        FieldPredicate::Lt(bound) => value.as_long().map(|v| v < *bound).unwrap_or(false),
        FieldPredicate::Gt(bound) => value.as_long().map(|v| v > *bound).unwrap_or(false),
        FieldPredicate::Lte(bound) => value.as_long().map(|v| v <= *bound).unwrap_or(false),
        FieldPredicate::Gte(bound) => value.as_long().map(|v| v >= *bound).unwrap_or(false),
        FieldPredicate::Chain(_) => false,
    }
}
