//! Workflow recorder for browser sessions
//!
//! This crate turns raw interaction events reported by a host (clicks, field
//! input, key presses, scrolling and location changes) into an ordered
//! [`autopilot::Workflow`] that the executor can replay.

pub mod error;
pub mod events;
pub mod recorder;
pub mod validation;

pub use error::*;
pub use events::{events_from_values, InteractionEvent, RecordedEvent};
pub use recorder::*;
pub use validation::{improve_selector, sanitize_input, validate_step};
