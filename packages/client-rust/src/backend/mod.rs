//! [`crate::DocumentBackend`] implementations.

pub mod memory;
pub mod rest;

pub use memory::{Call, InMemoryBackend, Op};
pub use rest::RestBackend;
