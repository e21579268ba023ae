//! Error handling foundation for braid.
//!
//! This module provides only the `Result` type alias using rootcause.
//! Each module of the workflow crate defines its own error enum; the
//! process-level boundary wraps them in a `Report`.

use rootcause::Report;

/// A Result type alias using rootcause's Report for error handling.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_type_works() {
        let ok: Result<i32> = Ok(42);
        assert_eq!(ok.expect("should be ok"), 42);
    }
}
