//! Shared helpers for the Pyrite sync integration test suites.

pub mod helpers;
