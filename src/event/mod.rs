use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Numeric tag identifying the kind of a log event.
pub type TagId = u32;

/// Field position within a tag's field list, 1-based to match configs.
pub type FieldId = u32;

/// Sub-field position inside an attribution node: 1 = uid, 2 = tag.
pub const CHAIN_FIELD_UID: FieldId = 1;
/// Sub-field position inside an attribution node: 1 = uid, 2 = tag.
pub const CHAIN_FIELD_TAG: FieldId = 2;

/// One node of an attribution chain: the uid responsible for a piece of
/// work plus a free-form tag (e.g. a wakelock name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributionNode {
    pub uid: i32,
    pub tag: String,
}

/// A typed field value carried by an event.
///
/// `Float` is compared and hashed by bit pattern so values can participate
/// in dimension keys (map keys require `Eq` + `Hash` + `Ord`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FieldValue {
    Int(i32),
    Long(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Chain(Vec<AttributionNode>),
}

impl FieldValue {
    /// Returns the value as an i64 if it is numeric.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(i64::from(*v)),
            Self::Long(v) => Some(*v),
            Self::Float(v) => Some(*v as i64),
            Self::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Discriminant used for ordering across variants.
    fn variant_rank(&self) -> u8 {
        match self {
            Self::Int(_) => 0,
            Self::Long(_) => 1,
            Self::Float(_) => 2,
            Self::Bool(_) => 3,
            Self::Str(_) => 4,
            Self::Chain(_) => 5,
        }
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Long(a), Self::Long(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Chain(a), Self::Chain(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for FieldValue {}

impl Hash for FieldValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.variant_rank().hash(state);
        match self {
            Self::Int(v) => v.hash(state),
            Self::Long(v) => v.hash(state),
            Self::Float(v) => v.to_bits().hash(state),
            Self::Bool(v) => v.hash(state),
            Self::Str(v) => v.hash(state),
            Self::Chain(v) => v.hash(state),
        }
    }
}

impl PartialOrd for FieldValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Long(a), Self::Long(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            (Self::Chain(a), Self::Chain(b)) => a.cmp(b),
            _ => self.variant_rank().cmp(&other.variant_rank()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(v),
            Self::Chain(nodes) => write!(f, "chain[{}]", nodes.len()),
        }
    }
}

/// A typed, timestamped log event.
///
/// Immutable once constructed. The pipeline holds only borrowed references
/// to an event during a single dispatch pass; producers retain derived
/// aggregates, never the event itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Kind of event.
    pub tag_id: TagId,
    /// Uid of the process that logged the event, used for source filtering.
    pub source_uid: u32,
    /// Monotonic timestamp in nanoseconds; the bucketing clock.
    pub elapsed_ns: i64,
    /// Wall-clock timestamp in nanoseconds since the epoch.
    pub wall_clock_ns: i64,
    /// Ordered typed field values, addressed by 1-based position.
    fields: Vec<FieldValue>,
}

impl Event {
    pub fn new(
        tag_id: TagId,
        source_uid: u32,
        elapsed_ns: i64,
        wall_clock_ns: i64,
        fields: Vec<FieldValue>,
    ) -> Self {
        Self {
            tag_id,
            source_uid,
            elapsed_ns,
            wall_clock_ns,
            fields,
        }
    }

    /// Returns the field at the given 1-based position.
    pub fn field(&self, position: FieldId) -> Option<&FieldValue> {
        if position == 0 {
            return None;
        }
        self.fields.get(position as usize - 1)
    }

    /// Number of fields carried by the event.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// All fields in order, paired with their 1-based positions.
    pub fn fields(&self) -> impl Iterator<Item = (FieldId, &FieldValue)> {
        self.fields
            .iter()
            .enumerate()
            .map(|(i, v)| (i as FieldId + 1, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_field_lookup_is_one_based() {
        let event = Event::new(
            42,
            1000,
            5,
            10,
            vec![FieldValue::Int(7), FieldValue::Str("a".into())],
        );
        assert_eq!(event.field(1), Some(&FieldValue::Int(7)));
        assert_eq!(event.field(2), Some(&FieldValue::Str("a".into())));
        assert_eq!(event.field(0), None);
        assert_eq!(event.field(3), None);
    }

    #[test]
    fn test_field_value_as_map_key() {
        let mut map: HashMap<FieldValue, u32> = HashMap::new();
        map.insert(FieldValue::Long(99), 1);
        map.insert(FieldValue::Str("screen".into()), 2);
        assert_eq!(map.get(&FieldValue::Long(99)), Some(&1));
        assert_eq!(map.get(&FieldValue::Str("screen".into())), Some(&2));
    }

    #[test]
    fn test_float_equality_by_bits() {
        assert_eq!(FieldValue::Float(1.5), FieldValue::Float(1.5));
        assert_ne!(FieldValue::Float(1.5), FieldValue::Float(1.5000001));
        // NaN equals itself under bit comparison, so keys stay stable.
        assert_eq!(FieldValue::Float(f64::NAN), FieldValue::Float(f64::NAN));
    }

    #[test]
    fn test_cross_variant_ordering_is_total() {
        let mut values = vec![
            FieldValue::Str("b".into()),
            FieldValue::Int(3),
            FieldValue::Long(-1),
            FieldValue::Bool(true),
        ];
        values.sort();
        assert_eq!(values[0], FieldValue::Int(3));
        assert_eq!(values[1], FieldValue::Long(-1));
    }

    #[test]
    fn test_as_long_conversions() {
        assert_eq!(FieldValue::Int(4).as_long(), Some(4));
        assert_eq!(FieldValue::Bool(true).as_long(), Some(1));
        assert_eq!(FieldValue::Str("x".into()).as_long(), None);
    }
}
