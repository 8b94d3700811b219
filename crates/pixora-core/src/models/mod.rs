//! Data models for the application
//!
//! This module contains all data structures used throughout the application,
//! organized by domain. Each sub-module represents a specific feature area.

mod activity;
mod credit;
mod generation;
mod identity;
mod subscription;

// Re-export all models for convenient imports
pub use activity::*;
pub use credit::*;
pub use generation::*;
pub use identity::*;
pub use subscription::*;
