//! Domain models for grants-service.

pub mod grant;

pub use grant::{Grant, GrantState, GrantUse};
