//! # strongbox-core
//! Foundation types, error taxonomy and collaborator traits for Strongbox.

pub mod constants;
pub mod error;
pub mod traits;
pub mod types;
