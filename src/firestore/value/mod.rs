mod array_value;
mod bytes_value;
mod map_value;
mod ordering;
mod value;

pub use array_value::ArrayValue;
pub use bytes_value::BytesValue;
pub use map_value::MapValue;
pub use ordering::{array_contains, compare_values, type_order};
pub use value::{FirestoreValue, ValueKind};
