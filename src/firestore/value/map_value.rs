use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{FieldMask, FieldPath};
use crate::firestore::value::{FirestoreValue, ValueKind};

/// Document contents: a map of field names to values with path-based access
/// into nested maps.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Value at `path`, descending through nested maps.
    pub fn get(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let mut current = &self.fields;
        let segments = path.segments();
        for (index, segment) in segments.iter().enumerate() {
            let value = current.get(segment)?;
            if index + 1 == segments.len() {
                return Some(value);
            }
            match value.kind() {
                ValueKind::Map(child) => current = &child.fields,
                _ => return None,
            }
        }
        None
    }

    /// Writes `value` at `path`, replacing any non-map value on the way.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        set_at_segments(&mut self.fields, path.segments(), value);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        delete_at_segments(&mut self.fields, path.segments());
    }

    /// Applies `set` for `Some` entries and `delete` for `None` entries.
    pub fn set_all(&mut self, entries: BTreeMap<FieldPath, Option<FirestoreValue>>) {
        for (path, value) in entries {
            match value {
                Some(value) => self.set(&path, value),
                None => self.delete(&path),
            }
        }
    }

    /// Leaf field paths of this map. Empty nested maps count as leaves.
    pub fn field_mask(&self) -> FieldMask {
        let mut paths = Vec::new();
        collect_leaf_paths(&self.fields, None, &mut paths);
        FieldMask::new(paths)
    }

    pub fn estimate_byte_size(&self) -> usize {
        self.fields
            .iter()
            .map(|(key, value)| key.len() * 2 + value.estimate_byte_size())
            .sum()
    }
}

fn set_at_segments(
    fields: &mut BTreeMap<String, FirestoreValue>,
    segments: &[String],
    value: FirestoreValue,
) {
    let (first, rest) = match segments.split_first() {
        Some(split) => split,
        None => return,
    };
    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }
    let mut child = match fields.get(first).map(FirestoreValue::kind) {
        Some(ValueKind::Map(map)) => map.fields.clone(),
        _ => BTreeMap::new(),
    };
    set_at_segments(&mut child, rest, value);
    fields.insert(first.clone(), FirestoreValue::from_map(child));
}

fn delete_at_segments(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let (first, rest) = match segments.split_first() {
        Some(split) => split,
        None => return,
    };
    if rest.is_empty() {
        fields.remove(first);
        return;
    }
    let mut child = match fields.get(first).map(FirestoreValue::kind) {
        Some(ValueKind::Map(map)) => map.fields.clone(),
        _ => return,
    };
    delete_at_segments(&mut child, rest);
    fields.insert(first.clone(), FirestoreValue::from_map(child));
}

fn collect_leaf_paths(
    fields: &BTreeMap<String, FirestoreValue>,
    prefix: Option<&FieldPath>,
    out: &mut Vec<FieldPath>,
) {
    for (key, value) in fields {
        let path = match prefix {
            Some(prefix) => prefix.child(key.clone()),
            None => FieldPath::from_segment(key.clone()),
        };
        match value.kind() {
            ValueKind::Map(child) if !child.fields.is_empty() => {
                collect_leaf_paths(&child.fields, Some(&path), out)
            }
            _ => out.push(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(raw: &str) -> FieldPath {
        FieldPath::from_dot_separated(raw).unwrap()
    }

    #[test]
    fn nested_set_get_and_delete() {
        let mut map = MapValue::empty();
        map.set(&path("a.b"), FirestoreValue::from_integer(1));
        map.set(&path("a.c"), FirestoreValue::from_integer(2));
        map.set(&path("top"), FirestoreValue::from_bool(true));
        assert_eq!(map.get(&path("a.b")), Some(&FirestoreValue::from_integer(1)));

        map.delete(&path("a.b"));
        assert!(map.get(&path("a.b")).is_none());
        assert_eq!(map.get(&path("a.c")), Some(&FirestoreValue::from_integer(2)));

        // Setting through a scalar replaces it with a map.
        map.set(&path("top.inner"), FirestoreValue::null());
        assert!(map.get(&path("top")).unwrap().as_map().is_some());
    }

    #[test]
    fn field_mask_lists_leaves() {
        let mut map = MapValue::empty();
        map.set(&path("a.b"), FirestoreValue::from_integer(1));
        map.set(&path("c"), FirestoreValue::from_map(BTreeMap::new()));
        let mask = map.field_mask();
        let rendered: Vec<String> = mask.iter().map(FieldPath::canonical_string).collect();
        assert_eq!(rendered, vec!["a.b".to_string(), "c".to_string()]);
    }
}
