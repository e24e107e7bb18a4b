/// Panic with a Firestore-styled internal assertion message when the condition is false.
///
/// Used for invariants whose violation means the persisted state or the
/// in-memory bookkeeping is corrupt; these are never surfaced as
/// `FirestoreError`s.
#[track_caller]
pub fn hard_assert(condition: bool, message: impl AsRef<str>) {
    if !condition {
        fail(message);
    }
}

/// Unconditionally panics with an internal assertion message.
#[track_caller]
pub fn fail(message: impl AsRef<str>) -> ! {
    panic!("{}", assertion_error(message));
}

/// Build the string used when raising assertion failures.
pub fn assertion_error(message: impl AsRef<str>) -> String {
    format!(
        "FIRESTORE ({}) INTERNAL ASSERT FAILED: {}",
        env!("CARGO_PKG_VERSION"),
        message.as_ref()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "INTERNAL ASSERT FAILED")]
    fn assert_panics_on_false() {
        hard_assert(false, "should panic");
    }

    #[test]
    fn assertion_error_formats_message() {
        let err = assertion_error("boom");
        assert!(err.contains("FIRESTORE"));
        assert!(err.contains("boom"));
    }
}
