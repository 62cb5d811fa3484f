//! Protocol bindings shipped with the runtime

pub mod file;

pub use file::{FileBinding, FileBindingConfig, ProcessingMode};
