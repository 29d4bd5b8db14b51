//! Profile-query client
//!
//! Looks up the application id registered for an instrumentation key and
//! exposes it to the resolver as a correlation identity.

pub mod client;
pub mod error;

pub use client::ProfileClient;
pub use error::{ProfileError, ProfileResult};
