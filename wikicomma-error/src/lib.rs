//! # wikicomma-error
//!
//! Unified error handling for the wikicomma crawler — following OpenDAL's
//! error handling practices.
//!
//! ## Design philosophy
//!
//! - **ErrorKind**: know what happened (e.g. `TokenInvalidated`, `VoteFetch`)
//! - **ErrorStatus**: decide how to handle it (Temporary, Permanent, Persistent)
//! - **Error context**: helps locate the cause with rich key/value context
//! - **Error source**: wraps underlying errors without leaking raw types
//!
//! ## Usage
//!
//! ```rust
//! use wikicomma_error::{Error, ErrorKind};
//!
//! fn example() -> Result<(), Error> {
//!     Err(Error::new(ErrorKind::MetaMissing, "pages/hello.json not found")
//!         .with_operation("engine::scan_pages")
//!         .with_context("page", "hello"))
//! }
//! ```
//!
//! ## Principles
//!
//! - Every fallible function in the workspace returns `wikicomma_error::Result<T>`
//! - External errors are wrapped with `set_source(err)`, never re-exported raw
//! - An error is classified once at the point it's raised; callers downstream
//!   only add context or call `.persist()` when a retry budget is exhausted

mod error;
mod kind;
mod status;

pub use error::Error;
pub use kind::ErrorKind;
pub use status::ErrorStatus;

/// Result type alias using the wikicomma Error
pub type Result<T> = std::result::Result<T, Error>;
