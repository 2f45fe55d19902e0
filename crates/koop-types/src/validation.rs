//! Explicit validation settings.
//!
//! Shape checks always run. The toggle only controls the data-dependent scans
//! (finite values, episode lengths) that dominate hot inner loops such as
//! trajectory prediction inside cross-validation.

use std::cell::Cell;

use nalgebra::DMatrix;

use crate::errors::KoopResult;
use crate::validation_error;

#[derive(Debug, Default)]
pub struct ValidationConfig {
    skip_validation: Cell<bool>,
}

impl ValidationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_skip_validation(skip: bool) -> Self {
        Self {
            skip_validation: Cell::new(skip),
        }
    }

    pub fn skip_validation(&self) -> bool {
        self.skip_validation.get()
    }

    /// Temporarily set `skip_validation`; the previous value comes back when
    /// the returned scope is dropped.
    pub fn scoped(&self, skip: bool) -> ValidationScope<'_> {
        let previous = self.skip_validation.replace(skip);
        ValidationScope {
            config: self,
            previous,
        }
    }

    /// Shorthand for `scoped(true)`.
    pub fn relaxed(&self) -> ValidationScope<'_> {
        self.scoped(true)
    }

    /// Reject NaN or infinite entries unless validation is skipped.
    pub fn check_finite(&self, m: &DMatrix<f64>, what: &str) -> KoopResult<()> {
        if self.skip_validation() {
            return Ok(());
        }
        match m.iter().position(|v| !v.is_finite()) {
            Some(pos) => Err(validation_error!(
                "{what} contains a non-finite value at row {}, column {}",
                pos % m.nrows().max(1),
                pos / m.nrows().max(1)
            )),
            None => Ok(()),
        }
    }
}

impl Clone for ValidationConfig {
    fn clone(&self) -> Self {
        Self::with_skip_validation(self.skip_validation())
    }
}

/// Guard returned by [`ValidationConfig::scoped`].
#[must_use = "validation is restored as soon as the scope is dropped"]
#[derive(Debug)]
pub struct ValidationScope<'a> {
    config: &'a ValidationConfig,
    previous: bool,
}

impl Drop for ValidationScope<'_> {
    fn drop(&mut self) {
        self.config.skip_validation.set(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_restores_previous_setting() {
        let config = ValidationConfig::new();
        assert!(!config.skip_validation());
        {
            let _scope = config.relaxed();
            assert!(config.skip_validation());
            {
                let _inner = config.scoped(false);
                assert!(!config.skip_validation());
            }
            assert!(config.skip_validation());
        }
        assert!(!config.skip_validation());
    }

    #[test]
    fn finite_check_honours_toggle() {
        let config = ValidationConfig::new();
        let bad = DMatrix::from_row_slice(2, 2, &[1.0, f64::NAN, 0.0, 1.0]);
        let err = config.check_finite(&bad, "X_train").unwrap_err();
        assert!(err.to_string().contains("row 0, column 1"));

        let _scope = config.relaxed();
        assert!(config.check_finite(&bad, "X_train").is_ok());
    }
}
