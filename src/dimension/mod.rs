//! Dimension extraction: field-matcher trees pull typed values out of events
//! to form the keys that slice condition and metric state.

use serde::{Deserialize, Serialize};

use crate::event::{Event, FieldId, FieldValue, CHAIN_FIELD_UID};

/// Selector over a repeated attribution-chain field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    First,
    Last,
    /// Expands into one extracted key instance per chain node.
    Any,
    /// Expands into one extracted key instance per chain node.
    All,
}

/// One node of an extraction tree. A leaf extracts the value at `field`;
/// a node over an attribution chain selects node(s) by `position` and
/// extracts the sub-fields named by `children` (uid when none are given).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMatcher {
    pub field: FieldId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FieldMatcher>,
}

impl FieldMatcher {
    pub fn leaf(field: FieldId) -> Self {
        Self {
            field,
            position: None,
            children: Vec::new(),
        }
    }
}

/// Fully-resolved path of one extracted value. `chain_index` is the concrete
/// node index once a position selector has been applied.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct FieldPath {
    pub field: FieldId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_field: Option<FieldId>,
}

impl FieldPath {
    pub fn top(field: FieldId) -> Self {
        Self {
            field,
            chain_index: None,
            sub_field: None,
        }
    }
}

/// One (path, value) pair of a dimension key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DimensionEntry {
    pub path: FieldPath,
    pub value: FieldValue,
}

/// An ordered tuple of extracted (path, value) pairs, used as a map key.
/// Two keys are equal iff every path and value match, in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct DimensionKey(pub Vec<DimensionEntry>);

impl DimensionKey {
    /// The key of unsliced state.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Value extracted at the given top-level field, if present.
    pub fn value_at(&self, field: FieldId, sub_field: Option<FieldId>) -> Option<&FieldValue> {
        self.0
            .iter()
            .find(|e| e.path.field == field && e.path.sub_field == sub_field)
            .map(|e| &e.value)
    }
}

/// Extracts dimension keys from an event per a list of extraction trees.
///
/// ANY/ALL positions expand into one key instance per chain node, so the
/// result is the cartesian product of each tree's alternatives. A tree that
/// extracts nothing (missing field, empty chain) excludes the event: the
/// result is empty, and the caller treats the event as non-matching for this
/// metric or condition only.
pub fn extract_keys(event: &Event, matchers: &[FieldMatcher]) -> Vec<DimensionKey> {
    let mut keys: Vec<Vec<DimensionEntry>> = vec![Vec::new()];

    for matcher in matchers {
        let alternatives = extract_one(event, matcher);
        if alternatives.is_empty() {
            return Vec::new();
        }

        let mut next = Vec::with_capacity(keys.len() * alternatives.len());
        for key in &keys {
            for alt in &alternatives {
                let mut merged = key.clone();
                merged.extend(alt.iter().cloned());
                next.push(merged);
            }
        }
        keys = next;
    }

    keys.into_iter().map(DimensionKey).collect()
}

/// Extracts the alternatives produced by a single tree: each alternative is
/// the list of entries one key instance receives from this tree.
fn extract_one(event: &Event, matcher: &FieldMatcher) -> Vec<Vec<DimensionEntry>> {
    let Some(value) = event.field(matcher.field) else {
        return Vec::new();
    };

    match value {
        FieldValue::Chain(nodes) => {
            if nodes.is_empty() {
                return Vec::new();
            }
            let indices: Vec<usize> = match matcher.position.unwrap_or(Position::First) {
                Position::First => vec![0],
                Position::Last => vec![nodes.len() - 1],
                Position::Any | Position::All => (0..nodes.len()).collect(),
            };

            indices
                .into_iter()
                .map(|i| chain_entries(matcher, i, &nodes[i]))
                .collect()
        }
        other => vec![vec![DimensionEntry {
            path: FieldPath::top(matcher.field),
            value: other.clone(),
        }]],
    }
}

fn chain_entries(
    matcher: &FieldMatcher,
    index: usize,
    node: &crate::event::AttributionNode,
) -> Vec<DimensionEntry> {
    let sub_fields: Vec<FieldId> = if matcher.children.is_empty() {
        vec![CHAIN_FIELD_UID]
    } else {
        matcher.children.iter().map(|c| c.field).collect()
    };

    sub_fields
        .into_iter()
        .filter_map(|sub| {
            let value = match sub {
                CHAIN_FIELD_UID => FieldValue::Int(node.uid),
                crate::event::CHAIN_FIELD_TAG => FieldValue::Str(node.tag.clone()),
                _ => return None,
            };
            Some(DimensionEntry {
                path: FieldPath {
                    field: matcher.field,
                    chain_index: Some(index as u32),
                    sub_field: Some(sub),
                },
                value,
            })
        })
        .collect()
}

/// Leaf of a flattened extraction tree; used to pair up the two sides of a
/// metric-to-condition dimension link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafPath {
    pub field: FieldId,
    pub sub_field: Option<FieldId>,
}

/// Flattens extraction trees into their leaves, in tree order.
pub fn flatten_leaves(matchers: &[FieldMatcher]) -> Vec<LeafPath> {
    let mut leaves = Vec::new();
    for m in matchers {
        if m.children.is_empty() {
            leaves.push(LeafPath {
                field: m.field,
                sub_field: None,
            });
        } else {
            for c in &m.children {
                leaves.push(LeafPath {
                    field: m.field,
                    sub_field: Some(c.field),
                });
            }
        }
    }
    leaves
}

/// Projects a key extracted on one side of a link onto the other side's
/// paths: for each (from, to) leaf pair, the value found at `from` in `key`
/// reappears under `to` in the result. Leaves with no matching entry are
/// skipped.
pub fn project_key(key: &DimensionKey, from: &[LeafPath], to: &[LeafPath]) -> DimensionKey {
    let mut entries = Vec::with_capacity(to.len());
    for (f, t) in from.iter().zip(to.iter()) {
        let found = key
            .0
            .iter()
            .find(|e| e.path.field == f.field && e.path.sub_field == f.sub_field);
        if let Some(entry) = found {
            entries.push(DimensionEntry {
                path: FieldPath {
                    field: t.field,
                    chain_index: entry.path.chain_index,
                    sub_field: t.sub_field,
                },
                value: entry.value.clone(),
            });
        }
    }
    DimensionKey(entries)
}
