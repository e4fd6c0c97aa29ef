//! Common utilities and types shared across the offline sync core.
//!
//! This module provides foundational types that are used throughout the codebase,
//! ensuring consistency and type safety.

pub mod clock;
pub mod error;
pub mod events;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DeliveryError, Error, Result};
pub use events::{EventBus, Subscription};
pub use types::{ActionId, HttpMethod, Priority};
