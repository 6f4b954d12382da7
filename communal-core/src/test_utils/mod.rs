//! Fixtures and in-memory collaborators shared by unit tests

pub mod fakes;
pub mod fixtures;

pub use fakes::*;
pub use fixtures::*;
