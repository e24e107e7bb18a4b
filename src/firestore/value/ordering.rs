use std::cmp::Ordering;

use crate::firestore::value::{FirestoreValue, ValueKind};

/// Position of a value's type in Firestore's cross-type ordering.
pub fn type_order(value: &FirestoreValue) -> u8 {
    match value.kind() {
        ValueKind::Null => 0,
        ValueKind::Boolean(_) => 1,
        ValueKind::Integer(_) | ValueKind::Double(_) => 2,
        ValueKind::Timestamp(_) => 3,
        ValueKind::ServerTimestamp { .. } => 4,
        ValueKind::String(_) => 5,
        ValueKind::Bytes(_) => 6,
        ValueKind::Reference(_) => 7,
        ValueKind::GeoPoint(_) => 8,
        ValueKind::Array(_) => 9,
        ValueKind::Map(_) => 10,
    }
}

/// Total order over field values.
///
/// Values of different types order by [`type_order`]. Integers and doubles
/// compare numerically with `NaN` before every other number. References
/// compare segment-wise.
pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let by_type = type_order(left).cmp(&type_order(right));
    if by_type != Ordering::Equal {
        return by_type;
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Double(b)) => compare_mixed(*a, *b),
        (ValueKind::Double(a), ValueKind::Integer(b)) => compare_mixed(*b, *a).reverse(),
        (ValueKind::Double(a), ValueKind::Double(b)) => compare_doubles(*a, *b),
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
        (
            ValueKind::ServerTimestamp {
                local_write_time: a,
                ..
            },
            ValueKind::ServerTimestamp {
                local_write_time: b,
                ..
            },
        ) => a.cmp(b),
        (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.as_slice().cmp(b.as_slice()),
        (ValueKind::Reference(a), ValueKind::Reference(b)) => a.split('/').cmp(b.split('/')),
        (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => a.compare(b),
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            for (l, r) in a.values().iter().zip(b.values()) {
                let ordering = compare_values(l, r);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.values().len().cmp(&b.values().len())
        }
        (ValueKind::Map(a), ValueKind::Map(b)) => {
            // BTreeMap iterates keys in sorted order.
            for ((lk, lv), (rk, rv)) in a.fields().iter().zip(b.fields()) {
                let ordering = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.fields().len().cmp(&b.fields().len())
        }
        _ => Ordering::Equal,
    }
}

fn compare_doubles(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        // -0.0 and 0.0 are equal here.
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn compare_mixed(integer: i64, double: f64) -> Ordering {
    if double.is_nan() {
        return Ordering::Greater;
    }
    compare_doubles(integer as f64, double)
}

/// Whether `value` is an array containing `needle`.
pub fn array_contains(value: &FirestoreValue, needle: &FirestoreValue) -> bool {
    value
        .as_array()
        .map(|array| array.contains(needle))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;
    use std::collections::BTreeMap;

    #[test]
    fn orders_across_types() {
        let ordered = vec![
            FirestoreValue::null(),
            FirestoreValue::from_bool(false),
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_integer(-1),
            FirestoreValue::from_double(0.5),
            FirestoreValue::from_integer(1),
            FirestoreValue::from_timestamp(Timestamp::new(1, 0)),
            FirestoreValue::server_timestamp(Timestamp::new(0, 0), None),
            FirestoreValue::from_string("a"),
            FirestoreValue::from_array(vec![]),
            FirestoreValue::from_map(BTreeMap::new()),
        ];
        for window in ordered.windows(2) {
            assert_eq!(
                compare_values(&window[0], &window[1]),
                Ordering::Less,
                "{:?} < {:?}",
                window[0],
                window[1]
            );
        }
    }

    #[test]
    fn integers_and_doubles_compare_numerically() {
        assert_eq!(
            compare_values(&FirestoreValue::from_integer(1), &FirestoreValue::from_double(1.0)),
            Ordering::Equal
        );
        assert_eq!(
            compare_values(&FirestoreValue::from_double(-0.0), &FirestoreValue::from_double(0.0)),
            Ordering::Equal
        );
    }

    #[test]
    fn arrays_compare_elementwise_then_by_length() {
        let short = FirestoreValue::from_array(vec![FirestoreValue::from_integer(1)]);
        let long = FirestoreValue::from_array(vec![
            FirestoreValue::from_integer(1),
            FirestoreValue::from_integer(0),
        ]);
        assert_eq!(compare_values(&short, &long), Ordering::Less);
        assert!(array_contains(&long, &FirestoreValue::from_integer(0)));
    }
}
