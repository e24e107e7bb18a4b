use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};
use crate::firestore::value::{array_contains, compare_values, type_order, FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self {
            FilterOperator::LessThan => ordering == Ordering::Less,
            FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
            FilterOperator::Equal => ordering == Ordering::Equal,
            FilterOperator::NotEqual => ordering != Ordering::Equal,
            FilterOperator::GreaterThan => ordering == Ordering::Greater,
            FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    field: FieldPath,
    op: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: FilterOperator, value: FirestoreValue) -> Self {
        Self { field, op, value }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn op(&self) -> FilterOperator {
        self.op
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn is_inequality(&self) -> bool {
        self.op.is_inequality()
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        if self.field.is_key_field() {
            return self.matches_key(document.key());
        }
        let other = document.field(&self.field);
        match self.op {
            FilterOperator::ArrayContains => {
                other.map(|value| array_contains(value, &self.value)).unwrap_or(false)
            }
            FilterOperator::ArrayContainsAny => match other.and_then(FirestoreValue::as_array) {
                Some(array) => array
                    .values()
                    .iter()
                    .any(|candidate| array_contains(&self.value, candidate)),
                None => false,
            },
            FilterOperator::In => other
                .map(|value| array_contains(&self.value, value))
                .unwrap_or(false),
            FilterOperator::NotIn => {
                if array_contains(&self.value, &FirestoreValue::null()) {
                    return false;
                }
                match other {
                    Some(value) => !value.is_null() && !array_contains(&self.value, value),
                    None => false,
                }
            }
            FilterOperator::NotEqual => match other {
                Some(value) => {
                    !value.is_null()
                        && self
                            .op
                            .matches_comparison(compare_values(value, &self.value))
                }
                None => false,
            },
            _ => match other {
                Some(value) => {
                    type_order(value) == type_order(&self.value)
                        && self
                            .op
                            .matches_comparison(compare_values(value, &self.value))
                }
                None => false,
            },
        }
    }

    fn matches_key(&self, key: &DocumentKey) -> bool {
        let path = key.path().canonical_string();
        let as_reference = |value: &FirestoreValue| match value.kind() {
            ValueKind::Reference(reference) => Some(reference.clone()),
            _ => None,
        };
        match self.op {
            FilterOperator::In | FilterOperator::NotIn => {
                let found = self
                    .value
                    .as_array()
                    .map(|array| {
                        array
                            .values()
                            .iter()
                            .filter_map(as_reference)
                            .any(|reference| reference == path)
                    })
                    .unwrap_or(false);
                (self.op == FilterOperator::In) == found
            }
            _ => match as_reference(&self.value) {
                Some(reference) => {
                    let ordering = key
                        .path()
                        .iter()
                        .map(String::as_str)
                        .cmp(reference.split('/'));
                    self.op.matches_comparison(ordering)
                }
                None => false,
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op.as_str(),
            self.value.canonical_string()
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: FieldPath,
    pub direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn ascending(field: FieldPath) -> Self {
        Self::new(field, Direction::Ascending)
    }

    pub fn flipped(&self) -> Self {
        let direction = match self.direction {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        };
        Self::new(self.field.clone(), direction)
    }

    /// Compares two documents on this ordering's field.
    pub fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            let null = FirestoreValue::null();
            let l = left.field(&self.field).unwrap_or(&null);
            let r = right.field(&self.field).unwrap_or(&null);
            compare_values(l, r)
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }

    fn canonical_id(&self) -> String {
        let direction = match self.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        format!("{}{}", self.field.canonical_string(), direction)
    }
}

/// Query cursor: a position in order-by value space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub position: Vec<FirestoreValue>,
    pub inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    fn compare_to_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> Ordering {
        for (component, order) in self.position.iter().zip(order_by) {
            let ordering = if order.field.is_key_field() {
                match component.kind() {
                    ValueKind::Reference(reference) => reference
                        .split('/')
                        .cmp(document.key().path().iter().map(String::as_str)),
                    _ => Ordering::Equal,
                }
            } else {
                let null = FirestoreValue::null();
                compare_values(component, document.field(&order.field).unwrap_or(&null))
            };
            let ordering = match order.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    pub fn sorts_before_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    pub fn sorts_after_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }

    fn canonical_id(&self) -> String {
        let parts: Vec<String> = self
            .position
            .iter()
            .map(FirestoreValue::canonical_string)
            .collect();
        format!("{}:{}", if self.inclusive { "b" } else { "a" }, parts.join(","))
    }
}

/// Normalized, executable form of a query as sent to the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub filters: Vec<FieldFilter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u32>,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Target {
    /// Target listening to exactly one document.
    pub fn for_document(key: &DocumentKey) -> Self {
        Self {
            path: key.path().clone(),
            collection_group: None,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            start_at: None,
            end_at: None,
        }
    }

    pub fn is_document_target(&self) -> bool {
        self.path.is_document_path() && self.collection_group.is_none() && self.filters.is_empty()
    }

    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_id());
        }
        id.push_str("|ob:");
        for order in &self.order_by {
            id.push_str(&order.canonical_id());
        }
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{limit}"));
        }
        if let Some(bound) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(&bound.canonical_id());
        }
        if let Some(bound) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(&bound.canonical_id());
        }
        id
    }

    /// Fields a query over this target constrains or orders by, excluding
    /// the document key.
    pub fn constrained_fields(&self) -> Vec<FieldPath> {
        let mut fields: Vec<FieldPath> = Vec::new();
        for path in self
            .filters
            .iter()
            .map(FieldFilter::field)
            .chain(self.order_by.iter().map(|order| &order.field))
        {
            if !path.is_key_field() && !fields.contains(path) {
                fields.push(path.clone());
            }
        }
        fields
    }

    /// Whether `document` belongs to the result set of this target, ignoring
    /// the limit.
    pub fn matches(&self, document: &MutableDocument) -> bool {
        if !document.is_found_document() {
            return false;
        }
        let document_path = document.key().path();
        let path_matches = match &self.collection_group {
            Some(group) => document.key().has_collection_id(group) && self.path.is_prefix_of(document_path),
            None if self.path.is_document_path() => &self.path == document_path,
            None => self.path.is_immediate_parent_of(document_path),
        };
        path_matches
            && self
                .order_by
                .iter()
                .all(|order| order.field.is_key_field() || document.field(&order.field).is_some())
            && self.filters.iter().all(|filter| filter.matches(document))
            && self
                .start_at
                .as_ref()
                .map_or(true, |bound| bound.sorts_before_document(&self.order_by, document))
            && self
                .end_at
                .as_ref()
                .map_or(true, |bound| bound.sorts_after_document(&self.order_by, document))
    }

    /// Orders documents by this target's order-by clauses.
    pub fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        self.order_by
            .iter()
            .map(|order| order.compare(left, right))
            .find(|ordering| *ordering != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}
