//! restash-core: key codec and shared types for the restash response cache
//!
//! This crate holds everything that does not need a Redis connection: the
//! four-family key codec, the request/response types exchanged with the
//! store, `Vary` matching, and the error taxonomy.

mod error;
pub mod keys;
mod types;

pub use error::{CacheError, Result};
pub use types::*;
