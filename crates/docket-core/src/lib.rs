//! Core types for the Docket caseload read model.
//!
//! This crate owns the subscription lifecycle, the entity models decoded from
//! raw documents, the opportunity registry and the stores that reconcile
//! caseload selection against live subscriptions. Concrete document stores
//! live in backend crates that implement [`source::DocumentSource`].

pub mod cache;
pub mod config;
pub mod error;
pub mod opportunity;
pub mod person;
pub mod registry;
pub mod search;
pub mod source;
pub mod subscription;
pub mod workflows;

#[cfg(test)]
mod testing;

pub use error::{Error, Result, SubscriptionError, ValidationError};
