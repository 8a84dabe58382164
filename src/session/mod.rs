//! Durable session storage.

pub mod store;

pub use store::{CorruptionType, IntegrityReport, SessionStore};
