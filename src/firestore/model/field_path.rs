use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::firestore::error::{invalid_argument, FirestoreResult};

pub const DOCUMENT_KEY_FIELD: &str = "__name__";

/// Dot-separated path to a field inside a document.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn new<S, I>(segments: I) -> FirestoreResult<Self>
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(invalid_argument(
                "FieldPath must contain at least one segment",
            ));
        }
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(invalid_argument("FieldPath segments cannot be empty"));
        }
        Ok(Self { segments })
    }

    pub fn from_dot_separated(path: &str) -> FirestoreResult<Self> {
        if path.trim().is_empty() {
            return Err(invalid_argument("FieldPath string cannot be empty"));
        }
        FieldPath::new(path.split('.'))
    }

    /// Single-segment path. The segment is taken verbatim, dots included.
    pub fn from_segment(segment: impl Into<String>) -> Self {
        Self {
            segments: vec![segment.into()],
        }
    }

    /// The special `__name__` path that orders by document key.
    pub fn key_field() -> Self {
        Self {
            segments: vec![DOCUMENT_KEY_FIELD.to_string()],
        }
    }

    pub fn is_key_field(&self) -> bool {
        self.segments.len() == 1 && self.segments[0] == DOCUMENT_KEY_FIELD
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn first_segment(&self) -> &str {
        &self.segments[0]
    }

    pub fn last_segment(&self) -> &str {
        &self.segments[self.segments.len() - 1]
    }

    /// Parent path, or `None` for a top-level field.
    pub fn parent(&self) -> Option<Self> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    pub fn is_prefix_of(&self, other: &Self) -> bool {
        self.segments.len() <= other.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(l, r)| l == r)
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join(".")
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}

/// Trait that converts common user inputs into a validated [`FieldPath`].
pub trait IntoFieldPath {
    fn into_field_path(self) -> FirestoreResult<FieldPath>;
}

impl IntoFieldPath for FieldPath {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        Ok(self)
    }
}

impl<'a> IntoFieldPath for &'a FieldPath {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        Ok(self.clone())
    }
}

impl IntoFieldPath for String {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        FieldPath::from_dot_separated(&self)
    }
}

impl<'a> IntoFieldPath for &'a str {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        FieldPath::from_dot_separated(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_dot_path() {
        let field = FieldPath::from_dot_separated("foo.bar").unwrap();
        assert_eq!(field.segments(), &["foo", "bar"]);
        assert_eq!(field.parent().unwrap().canonical_string(), "foo");
        assert!(field.parent().unwrap().is_prefix_of(&field));
    }

    #[test]
    fn rejects_empty() {
        let err = FieldPath::from_dot_separated("").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
        assert!(FieldPath::from_dot_separated("a..b").is_err());
    }

    #[test]
    fn key_field_is_recognized() {
        assert!(FieldPath::key_field().is_key_field());
        assert!(!"name".into_field_path().unwrap().is_key_field());
    }
}
