//! Application services
//!
//! The admission controller orchestrates metering around the external
//! generation backend; `generation` holds the backend client itself.

pub mod admission;
pub mod generation;

pub use admission::{AdmissionController, AdmissionPolicy};
pub use generation::{GenerationBackend, HttpGenerationBackend};
