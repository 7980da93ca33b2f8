//! In-memory adapters for the `EventView` projection engine
//!
//! [`InMemoryBackend`] implements the transactional store projections write
//! to, [`InMemoryEventSource`] an append-only event log. Both are meant for
//! tests and development where persistence is not required.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

mod backend;
mod eval;
mod source;

pub use backend::{InMemoryBackend, InMemoryTransaction};
pub use eval::Row;
pub use source::{InMemoryEventSource, PendingEvent};
