//! Integration and property tests for the Strongbox wallet core.
//!
//! Scenarios run a real `PayloadManager` against the in-memory remote store,
//! a scripted chain indexer and the production cipher and key derivation.

pub mod helpers;
