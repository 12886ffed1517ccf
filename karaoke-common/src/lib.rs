//! # karaoke-common
//!
//! Shared code for the karaoke pipeline service:
//! - Error types
//! - Job event types and broadcast bus

pub mod error;
pub mod events;

pub use error::{Error, Result};
pub use events::{EventBus, JobEvent};
