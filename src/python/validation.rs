//! Validation helpers for Python boundary.
//!
//! Converts crate errors into Python exceptions and checks scalar arguments
//! before they reach the augmentation core.

use crate::error::Error as WarpaugError;
use pyo3::exceptions::{PyIOError, PyRuntimeError, PyValueError};

/// Convert a warpaug Error to the appropriate Python exception.
pub fn to_py_err(e: WarpaugError, context: &str) -> pyo3::PyErr {
    match &e {
        WarpaugError::Io(io_err) => PyIOError::new_err(format!("{}: {}", context, io_err)),
        WarpaugError::Configuration(msg)
        | WarpaugError::InvalidDimensions(msg)
        | WarpaugError::ShapeMismatch(msg)
        | WarpaugError::InvalidAffine(msg)
        | WarpaugError::Serialization(msg) => {
            PyValueError::new_err(format!("{}: {}", context, msg))
        }
        WarpaugError::Executor { operation, reason } => PyRuntimeError::new_err(format!(
            "{}: executor {} failed: {}",
            context, operation, reason
        )),
    }
}

/// Validate probability value (0.0 to 1.0).
pub fn validate_probability(p: f64, param_name: &str) -> pyo3::PyResult<()> {
    if !p.is_finite() {
        return Err(PyValueError::new_err(format!(
            "{}: probability must be finite (got {})",
            param_name, p
        )));
    }
    if !(0.0..=1.0).contains(&p) {
        return Err(PyValueError::new_err(format!(
            "{}: probability must be between 0.0 and 1.0 (got {})",
            param_name, p
        )));
    }
    Ok(())
}

/// Validate an optional `(low, high)` sampling range.
pub fn validate_range(range: Option<(f64, f64)>, param_name: &str) -> pyo3::PyResult<()> {
    let Some((low, high)) = range else {
        return Ok(());
    };
    if !low.is_finite() || !high.is_finite() {
        return Err(PyValueError::new_err(format!(
            "{}: range bounds must be finite (got ({}, {}))",
            param_name, low, high
        )));
    }
    if low > high {
        return Err(PyValueError::new_err(format!(
            "{}: low ({}) cannot be greater than high ({})",
            param_name, low, high
        )));
    }
    Ok(())
}
