//! Python module definition.

use pyo3::prelude::*;

use super::augmentation;

#[pymodule]
fn _warpaug(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(augmentation::affine_augment3d, m)?)?;
    m.add_function(wrap_pyfunction!(augmentation::jitter_mask, m)?)?;
    Ok(())
}
