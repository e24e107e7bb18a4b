use serde::{Deserialize, Serialize};

use crate::firestore::value::FirestoreValue;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn contains(&self, value: &FirestoreValue) -> bool {
        self.values.iter().any(|candidate| candidate == value)
    }

    /// Appends each element not already present.
    pub fn union(&self, elements: &[FirestoreValue]) -> ArrayValue {
        let mut values = self.values.clone();
        for element in elements {
            if !values.iter().any(|candidate| candidate == element) {
                values.push(element.clone());
            }
        }
        ArrayValue::new(values)
    }

    /// Drops every occurrence of each element.
    pub fn remove_all(&self, elements: &[FirestoreValue]) -> ArrayValue {
        ArrayValue::new(
            self.values
                .iter()
                .filter(|candidate| !elements.iter().any(|needle| needle == *candidate))
                .cloned()
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_and_remove() {
        let array = ArrayValue::new(vec![
            FirestoreValue::from_integer(1),
            FirestoreValue::from_integer(2),
            FirestoreValue::from_integer(1),
        ]);
        let unioned = array.union(&[FirestoreValue::from_integer(2), FirestoreValue::from_integer(3)]);
        assert_eq!(unioned.values().len(), 4);
        let removed = unioned.remove_all(&[FirestoreValue::from_integer(1)]);
        assert_eq!(
            removed.values(),
            &[FirestoreValue::from_integer(2), FirestoreValue::from_integer(3)]
        );
    }
}
