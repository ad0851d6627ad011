//! Retry status for wikicomma errors

use std::fmt;

/// Whether an error is worth retrying, and if not, why.
///
/// - `Temporary`: a transient fault (network, HTTP 5xx, timeout, token
///   invalidation). The caller should retry within its bounded-attempt
///   budget (spec §7).
/// - `Permanent`: retrying would never help (bad config, user does not
///   exist, malformed input). Terminal for the process lifetime.
/// - `Persistent`: a `Temporary` fault whose retry budget was exhausted.
///   The work item is recorded in a pending store and will be retried on
///   a later run, but is not retried again in this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorStatus {
    Temporary,
    Permanent,
    Persistent,
}

impl ErrorStatus {
    /// Whether this status still permits an immediate retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorStatus::Temporary)
    }

    /// Transition into the terminal "retries exhausted, now pending" state.
    ///
    /// A `Permanent` error stays `Permanent` — persisting only ever
    /// downgrades a retryable fault, it never upgrades a terminal one.
    pub fn persist(self) -> Self {
        match self {
            ErrorStatus::Temporary => ErrorStatus::Persistent,
            other => other,
        }
    }
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorStatus::Temporary => "temporary",
            ErrorStatus::Permanent => "permanent",
            ErrorStatus::Persistent => "persistent",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persist_from_temporary() {
        assert_eq!(ErrorStatus::Temporary.persist(), ErrorStatus::Persistent);
    }

    #[test]
    fn test_persist_keeps_permanent() {
        assert_eq!(ErrorStatus::Permanent.persist(), ErrorStatus::Permanent);
    }

    #[test]
    fn test_display() {
        assert_eq!(ErrorStatus::Temporary.to_string(), "temporary");
        assert_eq!(ErrorStatus::Persistent.to_string(), "persistent");
    }
}
