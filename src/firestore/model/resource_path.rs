use std::fmt::{Display, Formatter};
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Slash-separated path to a collection or document.
///
/// Paths order segment-wise, with a shorter path ordering before any path it
/// is a prefix of.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    pub fn new(segments: Vec<String>) -> Self {
        Self { segments }
    }

    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments = segments.into_iter().map(Into::into).collect();
        Self::new(segments)
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        if path.trim().is_empty() {
            return Ok(Self::root());
        }

        if path.contains("//") {
            return Err(invalid_argument("Found empty segment in resource path"));
        }

        Ok(Self::from_segments(
            path.split('/')
                .filter(|segment| !segment.is_empty())
                .map(|segment| segment.to_string()),
        ))
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segment(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(|s| s.as_str())
    }

    pub fn child<I, S>(&self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut new_segments = self.segments.clone();
        new_segments.extend(segments.into_iter().map(Into::into));
        Self::new(new_segments)
    }

    pub fn without_last(&self) -> Self {
        let mut segments = self.segments.clone();
        segments.pop();
        Self::new(segments)
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(|s| s.as_str())
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join("/")
    }

    /// Documents live at even-length paths, collections at odd-length ones.
    pub fn is_document_path(&self) -> bool {
        !self.segments.is_empty() && self.segments.len() % 2 == 0
    }

    pub fn is_prefix_of(&self, other: &Self) -> bool {
        if self.len() > other.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(other.segments.iter())
            .all(|(l, r)| l == r)
    }

    pub fn is_immediate_parent_of(&self, other: &Self) -> bool {
        self.len() + 1 == other.len() && self.is_prefix_of(other)
    }
}

impl Display for ResourcePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}

impl Deref for ResourcePath {
    type Target = [String];

    fn deref(&self) -> &Self::Target {
        &self.segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn survives_a_json_record() {
        let path = ResourcePath::from_string("rooms/eros/messages").unwrap();
        let json = serde_json::to_string(&path).unwrap();
        let restored: ResourcePath = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, path);
    }

    #[test]
    fn parse_and_render_path() {
        let path = ResourcePath::from_string("cities/sf/neighborhoods/downtown").unwrap();
        assert_eq!(path.len(), 4);
        assert_eq!(path.last_segment(), Some("downtown"));
        assert_eq!(path.canonical_string(), "cities/sf/neighborhoods/downtown");
        assert!(path.is_document_path());
    }

    #[test]
    fn handles_root_path() {
        let path = ResourcePath::from_string("").unwrap();
        assert!(path.is_empty());
        assert!(!path.is_document_path());
    }

    #[test]
    fn rejects_empty_segments() {
        let err = ResourcePath::from_string("cities//sf").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn orders_segment_wise_with_prefix_first() {
        let a = ResourcePath::from_string("rooms").unwrap();
        let b = ResourcePath::from_string("rooms/a").unwrap();
        let c = ResourcePath::from_string("rooms/b").unwrap();
        let d = ResourcePath::from_string("roomsX").unwrap();
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
        assert!(a.is_immediate_parent_of(&b));
        assert!(!a.is_immediate_parent_of(&a));
    }
}
