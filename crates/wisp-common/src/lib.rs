//! WISP Platform Common
//!
//! Shared types for the module marketplace: the module model, the read-only
//! registry collaborator, and the injectable clock used by every
//! time-dependent component.

#![warn(missing_docs)]

pub mod clock;
pub mod module;

pub use clock::{Clock, ManualClock, SystemClock};
pub use module::{ExecutionMode, Module, ModuleRegistry, PrimitiveRef, StaticRegistry};

/// Platform user identifier.
pub type UserId = uuid::Uuid;

/// Module identifier (stable marketplace slug, e.g. `"network-audit"`).
pub type ModuleId = String;
