//! In-process document store for the Docket caseload engine.
//!
//! [`MemorySource`] implements [`docket_core::source::DocumentSource`] over a
//! map of collections. Writes notify every open listener whose query they
//! affect, so it behaves like a live store for tests, demos and the CLI.

mod source;

pub mod error;

pub use error::{Error, Result};
pub use source::MemorySource;
