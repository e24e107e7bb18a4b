pub mod assert;
pub mod backoff;

pub use assert::{assertion_error, fail, hard_assert};
pub use backoff::{BackoffConfig, ExponentialBackoff};
