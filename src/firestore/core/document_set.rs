use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

use crate::firestore::core::query::Query;
use crate::firestore::model::{DocumentKey, MutableDocument};

pub type DocumentComparator = Arc<dyn Fn(&MutableDocument, &MutableDocument) -> Ordering + Send + Sync>;

/// Documents of a view, ordered by the query's comparator with key lookup.
///
/// Cloning shares the comparator and copies the contents; views keep the
/// previous set around to build snapshots.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    by_key: BTreeMap<DocumentKey, MutableDocument>,
    sorted: Vec<MutableDocument>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    /// Empty set ordered the way `query` presents results.
    pub fn for_query(query: &Query) -> Self {
        let compare = query.comparator();
        Self::new(Arc::new(move |left, right| {
            compare(left, right).then_with(|| left.key().cmp(right.key()))
        }))
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&MutableDocument> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&MutableDocument> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&MutableDocument> {
        self.sorted.last()
    }

    /// Position of `key` in sort order.
    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.by_key.get(key)?;
        self.search(document).ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MutableDocument> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(MutableDocument::key)
    }

    pub fn comparator(&self) -> &DocumentComparator {
        &self.comparator
    }

    /// Inserts `document`, replacing any entry with the same key.
    pub fn insert(&mut self, document: MutableDocument) {
        self.remove(document.key());
        let position = match self.search(&document) {
            Ok(position) | Err(position) => position,
        };
        self.sorted.insert(position, document.clone());
        self.by_key.insert(document.key().clone(), document);
    }

    pub fn remove(&mut self, key: &DocumentKey) -> Option<MutableDocument> {
        let existing = self.by_key.remove(key)?;
        if let Ok(position) = self.search(&existing) {
            self.sorted.remove(position);
        }
        Some(existing)
    }

    fn search(&self, document: &MutableDocument) -> Result<usize, usize> {
        self.sorted
            .binary_search_by(|probe| (self.comparator)(probe, document))
    }
}

impl Debug for DocumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}
