//! Python bindings for warpaug.

pub mod augmentation;
pub mod module;
pub mod validation;
