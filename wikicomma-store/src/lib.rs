//! # wikicomma-store
//!
//! Durable, content-addressed persistence for the wikicomma crawler: the
//! data model for pages/revisions/forums/users, a generic atomically-written
//! JSON document, a bucketed user-profile resolver, a name-normalization
//! layer for safe on-disk paths, and a `7z`-backed archive adapter for
//! compacting per-page/per-thread history.

pub mod archive;
pub mod document;
pub mod model;
pub mod naming;
pub mod store;
pub mod users;

pub use archive::{AddOptions, ArchiveAdapter, ArchiveEntry};
pub use document::Document;
pub use store::SiteStore;
pub use users::UserResolver;
