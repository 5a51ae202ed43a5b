//! Result type definition and extension traits.
//!
//! Provides tap-style combinators so call sites can log failures without
//! unwrapping or re-matching the Result.

use crate::error::Error;

/// The standard Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Generic extension trait for any Result type (not just `oya_core::Result`).
pub trait GenericResultExt<T, E> {
    /// Perform a side effect on Ok value without consuming the Result.
    fn tap_ok<F: FnOnce(&T)>(self, f: F) -> Self;

    /// Perform a side effect on Err value without consuming the Result.
    fn tap_err<F: FnOnce(&E)>(self, f: F) -> Self;
}

impl<T, E> GenericResultExt<T, E> for std::result::Result<T, E> {
    fn tap_ok<F: FnOnce(&T)>(self, f: F) -> Self {
        if let Ok(ref v) = self {
            f(v);
        }
        self
    }

    fn tap_err<F: FnOnce(&E)>(self, f: F) -> Self {
        if let Err(ref e) = self {
            f(e);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_err_sees_error_and_preserves_result() {
        let mut seen = None;
        let result: std::result::Result<u8, String> = Err("boom".to_string());
        let result = result.tap_err(|e| seen = Some(e.clone()));
        assert_eq!(seen.as_deref(), Some("boom"));
        assert_eq!(result, Err("boom".to_string()));
    }

    #[test]
    fn tap_ok_is_skipped_on_error() {
        let mut called = false;
        let result: std::result::Result<u8, String> = Err("boom".to_string());
        let _ = result.tap_ok(|_| called = true);
        assert!(!called);
    }
}
