use std::cmp::Ordering;

use crate::firestore::core::target::{Bound, Direction, FieldFilter, OrderBy, Target};
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitType {
    First,
    Last,
}

/// A user query: what a listener or a one-shot read asks for.
///
/// Queries that differ only in their limit share one [`listen
/// target`](Query::listen_target); the limit is applied by the view.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    explicit_order_by: Vec<OrderBy>,
    filters: Vec<FieldFilter>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// Query over the collection or single document at `path`.
    pub fn new(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            explicit_order_by: Vec::new(),
            filters: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    /// Query over every collection named `collection_id`.
    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        let mut query = Self::new(ResourcePath::root());
        query.collection_group = Some(collection_id.into());
        query
    }

    /// Query whose target is `target`. Only used for targets another client
    /// started, where the original query is not known.
    pub fn from_target(target: &Target) -> Self {
        Self {
            path: target.path.clone(),
            collection_group: target.collection_group.clone(),
            explicit_order_by: target.order_by.clone(),
            filters: target.filters.clone(),
            limit: target.limit,
            limit_type: LimitType::First,
            start_at: target.start_at.clone(),
            end_at: target.end_at.clone(),
        }
    }

    pub fn for_document(key: &DocumentKey) -> Self {
        Self::new(key.path().clone())
    }

    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.explicit_order_by.push(order_by);
        self
    }

    pub fn with_limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn with_limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn starting_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn ending_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn without_limit(&self) -> Self {
        let mut query = self.clone();
        query.limit = None;
        query.limit_type = LimitType::First;
        query
    }

    pub fn is_document_query(&self) -> bool {
        self.path.is_document_path() && self.collection_group.is_none() && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// Same query restricted to the collection at `path`. Used to fan a
    /// collection group query out over its parent collections.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        let mut query = self.clone();
        query.path = path;
        query.collection_group = None;
        query
    }

    /// True when every document in the collection matches, so a full scan
    /// is as cheap as anything else.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field.is_key_field()))
    }

    /// Explicit orderings, then implicit ones for inequality fields, ending
    /// with the document key in the direction of the last explicit ordering.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut order_by = self.explicit_order_by.clone();
        let mut seen: Vec<FieldPath> = order_by.iter().map(|o| o.field.clone()).collect();
        let mut inequality_fields: Vec<FieldPath> = self
            .filters
            .iter()
            .filter(|filter| filter.is_inequality())
            .map(|filter| filter.field().clone())
            .collect();
        inequality_fields.sort();
        inequality_fields.dedup();

        let last_direction = self
            .explicit_order_by
            .last()
            .map(|order| order.direction)
            .unwrap_or(Direction::Ascending);

        for field in inequality_fields {
            if !seen.contains(&field) && !field.is_key_field() {
                order_by.push(OrderBy::new(field.clone(), last_direction));
                seen.push(field);
            }
        }
        if !seen.iter().any(FieldPath::is_key_field) {
            order_by.push(OrderBy::new(FieldPath::key_field(), last_direction));
        }
        order_by
    }

    /// Target the backend executes for this exact query. `limitToLast`
    /// queries run with reversed orderings and swapped cursors.
    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by,
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            },
            LimitType::Last => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by: order_by.iter().map(OrderBy::flipped).collect(),
                limit: self.limit,
                start_at: self.end_at.clone(),
                end_at: self.start_at.clone(),
            },
        }
    }

    /// Target used to listen for this query. The limit is dropped so queries
    /// differing only in limit share one target.
    pub fn listen_target(&self) -> Target {
        self.without_limit().to_target()
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "F",
            LimitType::Last => "L",
        };
        format!("{}|lt:{limit_type}", self.to_target().canonical_id())
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        document.is_found_document()
            && self.matches_path_and_collection_group(document)
            && self.matches_order_by(document)
            && self.filters.iter().all(|filter| filter.matches(document))
            && self.matches_bounds(document)
    }

    fn matches_path_and_collection_group(&self, document: &MutableDocument) -> bool {
        let document_path = document.key().path();
        if let Some(group) = &self.collection_group {
            document.key().has_collection_id(group) && self.path.is_prefix_of(document_path)
        } else if self.path.is_document_path() {
            &self.path == document_path
        } else {
            self.path.is_immediate_parent_of(document_path)
        }
    }

    fn matches_order_by(&self, document: &MutableDocument) -> bool {
        self.explicit_order_by
            .iter()
            .all(|order| order.field.is_key_field() || document.field(&order.field).is_some())
    }

    fn matches_bounds(&self, document: &MutableDocument) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, document) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if !end.sorts_after_document(&order_by, document) {
                return false;
            }
        }
        true
    }

    /// Orders documents the way results of this query are presented.
    pub fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        for order in self.normalized_order_by() {
            let ordering = order.compare(left, right);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Returns a comparator closure owning the normalized ordering.
    pub fn comparator(&self) -> impl Fn(&MutableDocument, &MutableDocument) -> Ordering {
        let order_by = self.normalized_order_by();
        move |left, right| {
            for order in &order_by {
                let ordering = order.compare(left, right);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::target::FilterOperator;
    use crate::firestore::model::SnapshotVersion;
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn collection(path: &str) -> Query {
        Query::new(ResourcePath::from_string(path).unwrap())
    }

    fn doc(path: &str, size: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("size").unwrap(), size.into());
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::min(),
            data,
        )
    }

    fn size_filter(op: FilterOperator, value: i64) -> FieldFilter {
        FieldFilter::new(FieldPath::from_dot_separated("size").unwrap(), op, value.into())
    }

    #[test]
    fn limit_queries_share_listen_target() {
        let base = collection("rooms").with_filter(size_filter(FilterOperator::GreaterThan, 1));
        let a = base.clone().with_limit_to_first(2);
        let b = base.clone().with_limit_to_first(5);
        assert_ne!(a.canonical_id(), b.canonical_id());
        assert_eq!(a.listen_target(), b.listen_target());
        assert_eq!(a.listen_target().limit, None);
    }

    #[test]
    fn inequality_adds_implicit_ordering() {
        let query = collection("rooms").with_filter(size_filter(FilterOperator::LessThan, 10));
        let order_by = query.normalized_order_by();
        assert_eq!(order_by.len(), 2);
        assert_eq!(order_by[0].field.canonical_string(), "size");
        assert!(order_by[1].field.is_key_field());
    }

    #[test]
    fn limit_to_last_flips_ordering() {
        let query = collection("rooms")
            .with_order_by(OrderBy::ascending(FieldPath::from_dot_separated("size").unwrap()))
            .with_limit_to_last(1);
        let target = query.to_target();
        assert!(target
            .order_by
            .iter()
            .all(|order| order.direction == Direction::Descending));
    }

    #[test]
    fn matches_only_immediate_children() {
        let query = collection("rooms");
        assert!(query.matches(&doc("rooms/a", 1)));
        assert!(!query.matches(&doc("rooms/a/messages/m", 1)));
        let group = Query::collection_group("messages");
        assert!(group.matches(&doc("rooms/a/messages/m", 1)));
        assert!(!group.matches(&doc("rooms/a", 1)));
    }

    #[test]
    fn bounds_and_comparator() {
        let query = collection("rooms")
            .with_order_by(OrderBy::ascending(FieldPath::from_dot_separated("size").unwrap()))
            .starting_at(crate::firestore::core::target::Bound::new(
                vec![FirestoreValue::from_integer(2)],
                true,
            ));
        assert!(!query.matches(&doc("rooms/a", 1)));
        assert!(query.matches(&doc("rooms/b", 2)));
        assert_eq!(query.compare(&doc("rooms/z", 1), &doc("rooms/a", 2)), Ordering::Less);
        assert_eq!(query.compare(&doc("rooms/a", 1), &doc("rooms/b", 1)), Ordering::Less);
    }
}
