//! Error kinds for wikicomma operations

use std::fmt;

/// The kind of error that occurred.
///
/// This enum categorizes errors so callers can match on them instead of
/// parsing message strings. It mirrors the remote platform's own
/// `errorKind` taxonomy (spec §6 telemetry) where one exists, and adds the
/// general-purpose kinds every crate in the workspace needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // =========================================================================
    // General errors
    // =========================================================================
    /// An unexpected error occurred - catch-all for unhandled cases
    Unexpected,

    /// The requested feature or operation is not supported
    Unsupported,

    /// Invalid or missing configuration
    ConfigInvalid,

    // =========================================================================
    // Network / HTTP errors
    // =========================================================================
    /// Connection to the remote could not be established or was reset
    NetworkFailed,

    /// A request timed out (slot watchdog, stuck stream, or activity timeout)
    Timeout,

    /// The remote responded with a non-success HTTP status
    HttpStatus,

    /// The remote's form token (`wikidot_token7`) was rejected
    TokenInvalidated,

    /// Client believed itself offline / unreachable upstream
    ClientOffline,

    // =========================================================================
    // Parsing errors
    // =========================================================================
    /// A DOM node or JSON field expected by a parser was missing
    ParseFailed,

    /// `sitemap.xml` (or a sub-sitemap) was malformed
    MalformedSitemap,

    // =========================================================================
    // Storage errors
    // =========================================================================
    /// A durable document or archive could not be read or written
    StorageFailed,

    /// Serialization/deserialization of a persisted document failed
    SerializationFailed,

    /// A document's on-disk schema version is older than expected
    SchemaMismatch,

    /// Expected metadata file was missing on disk
    MetaMissing,

    // =========================================================================
    // IO errors
    // =========================================================================
    /// File not found
    FileNotFound,

    /// Permission denied
    PermissionDenied,

    /// Generic IO failure
    IoFailed,

    /// Deleting a file during archival/cleanup failed
    FileUnlink,

    // =========================================================================
    // Crawl-specific errors (spec §6 errorKind)
    // =========================================================================
    /// Fetching a page's voters failed
    VoteFetch,

    /// Fetching a file's bytes failed
    FileFetch,

    /// Fetching a file's metadata failed
    FileMetaFetch,

    /// Fetching a page's lock status failed
    LockStatusFetch,

    /// Fetching the forum category listing failed
    ForumListFetch,

    /// Fetching forum posts/revisions failed
    ForumPostFetch,

    /// A thread's persisted post count disagreed with the remote
    ForumCountMismatch,

    /// The remote responded with an internal error status
    WikidotInternal,

    /// A response shape nothing in the contract predicted
    WhatTheFuck,

    /// A bounded retry budget was exhausted
    GivingUp,

    // =========================================================================
    // User resolver errors
    // =========================================================================
    /// The requested user does not exist on the remote (terminal)
    UserNotFound,

    /// The remote rate-limited this client
    RateLimited,
}

impl ErrorKind {
    /// Returns the error kind as a static string
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unexpected => "Unexpected",
            ErrorKind::Unsupported => "Unsupported",
            ErrorKind::ConfigInvalid => "ConfigInvalid",

            ErrorKind::NetworkFailed => "NetworkFailed",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::HttpStatus => "HttpStatus",
            ErrorKind::TokenInvalidated => "TokenInvalidated",
            ErrorKind::ClientOffline => "ClientOffline",

            ErrorKind::ParseFailed => "ParseFailed",
            ErrorKind::MalformedSitemap => "MalformedSitemap",

            ErrorKind::StorageFailed => "StorageFailed",
            ErrorKind::SerializationFailed => "SerializationFailed",
            ErrorKind::SchemaMismatch => "SchemaMismatch",
            ErrorKind::MetaMissing => "MetaMissing",

            ErrorKind::FileNotFound => "FileNotFound",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::IoFailed => "IoFailed",
            ErrorKind::FileUnlink => "FileUnlink",

            ErrorKind::VoteFetch => "VoteFetch",
            ErrorKind::FileFetch => "FileFetch",
            ErrorKind::FileMetaFetch => "FileMetaFetch",
            ErrorKind::LockStatusFetch => "LockStatusFetch",
            ErrorKind::ForumListFetch => "ForumListFetch",
            ErrorKind::ForumPostFetch => "ForumPostFetch",
            ErrorKind::ForumCountMismatch => "ForumCountMismatch",
            ErrorKind::WikidotInternal => "WikidotInternal",
            ErrorKind::WhatTheFuck => "WhatTheFuck",
            ErrorKind::GivingUp => "GivingUp",

            ErrorKind::UserNotFound => "UserNotFound",
            ErrorKind::RateLimited => "RateLimited",
        }
    }

    /// Check if this error kind is retryable by default.
    ///
    /// Matches the transient-fault list in spec §7: network/HTTP faults,
    /// token invalidation, and rate limiting are retried; everything else
    /// defaults to permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkFailed
                | ErrorKind::Timeout
                | ErrorKind::HttpStatus
                | ErrorKind::TokenInvalidated
                | ErrorKind::ClientOffline
                | ErrorKind::RateLimited
                | ErrorKind::VoteFetch
                | ErrorKind::FileFetch
                | ErrorKind::FileMetaFetch
                | ErrorKind::LockStatusFetch
                | ErrorKind::ForumListFetch
                | ErrorKind::ForumPostFetch
                | ErrorKind::WikidotInternal
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::MetaMissing.to_string(), "MetaMissing");
        assert_eq!(ErrorKind::NetworkFailed.to_string(), "NetworkFailed");
    }

    #[test]
    fn test_is_retryable() {
        assert!(ErrorKind::NetworkFailed.is_retryable());
        assert!(ErrorKind::TokenInvalidated.is_retryable());
        assert!(!ErrorKind::UserNotFound.is_retryable());
        assert!(!ErrorKind::ConfigInvalid.is_retryable());
    }
}
