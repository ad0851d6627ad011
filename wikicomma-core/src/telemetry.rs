//! # Telemetry sink
//!
//! One-way progress/error messages the engine emits (spec §6). Every
//! message is a JSON object of shape `{tag, type, ...fields}`; `tag` is
//! constant per process (the site name) and `type` plus the remaining
//! fields are carried by [`Event`]. The sink itself is a trait so a CLI can
//! wire it to stdout, a file, or nothing at all.

use std::sync::Arc;

use serde::Serialize;
use wikicomma_error::ErrorKind;

/// Progress phases reported by `Progress` events (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProgressStatus {
    BuildingSitemap,
    PagesMain,
    ForumsMain,
    PagesPending,
    FilesPending,
    Compressing,
    FatalError,
    Other,
}

/// One telemetry message body. Flattened into `Message` alongside the
/// constant `tag` field; `#[serde(tag = "type")]` gives each variant the
/// `type` discriminant the spec's wire format expects.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    Handshake,
    FinishSuccess,
    PageDone,
    PagePostponed,
    Preflight {
        total: u64,
    },
    Progress {
        status: ProgressStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        done: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        postponed: Option<u64>,
    },
    ErrorFatal {
        #[serde(rename = "errorKind")]
        error_kind: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(rename = "errorStr", skip_serializing_if = "Option::is_none")]
        error_str: Option<String>,
    },
    ErrorNonfatal {
        #[serde(rename = "errorKind")]
        error_kind: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(rename = "errorStr", skip_serializing_if = "Option::is_none")]
        error_str: Option<String>,
    },
}

impl Event {
    pub fn error_nonfatal(kind: ErrorKind, name: Option<String>, error_str: impl Into<String>) -> Self {
        Event::ErrorNonfatal {
            error_kind: kind.as_str(),
            name,
            error_str: Some(error_str.into()),
        }
    }

    pub fn error_fatal(kind: ErrorKind, name: Option<String>, error_str: impl Into<String>) -> Self {
        Event::ErrorFatal {
            error_kind: kind.as_str(),
            name,
            error_str: Some(error_str.into()),
        }
    }
}

/// The wire message: constant `tag` plus a flattened [`Event`].
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub tag: String,
    #[serde(flatten)]
    pub event: Event,
}

/// One-way telemetry sink. `emit` takes `&self`, not `&mut self` — sinks
/// are shared across every concurrent job in a site's worker pool.
pub trait Telemetry: Send + Sync {
    fn emit(&self, message: Message);
}

/// A sink bound to one site's `tag`, handed down into engine code so call
/// sites never have to repeat the site name. Holds the inner sink behind
/// `Arc<dyn Telemetry>` so a `Sink` can be cloned and shared across the
/// worker pool's concurrent jobs without a generic parameter on every
/// struct that stores one.
#[derive(Clone)]
pub struct Sink {
    tag: String,
    inner: Arc<dyn Telemetry>,
}

impl Sink {
    pub fn new(tag: impl Into<String>, inner: Arc<dyn Telemetry>) -> Self {
        Self { tag: tag.into(), inner }
    }

    pub fn emit(&self, event: Event) {
        self.inner.emit(Message { tag: self.tag.clone(), event });
    }
}

/// Discards every message; the default when no telemetry sink is
/// configured (spec §6: telemetry is optional).
pub struct NullTelemetry;

impl Telemetry for NullTelemetry {
    fn emit(&self, _message: Message) {}
}

/// Routes every message through `tracing` at a level derived from its
/// variant, for the common case of "just log it" (modeled on
/// `WoodyTheCat-phs_backend`'s structured-logging setup).
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn emit(&self, message: Message) {
        let json = serde_json::to_string(&message).unwrap_or_default();
        match &message.event {
            Event::ErrorFatal { .. } => tracing::error!(target: "wikicomma::telemetry", "{json}"),
            Event::ErrorNonfatal { .. } => tracing::warn!(target: "wikicomma::telemetry", "{json}"),
            _ => tracing::info!(target: "wikicomma::telemetry", "{json}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_serializes_tag_and_type_flattened() {
        let msg = Message {
            tag: "my-site".to_string(),
            event: Event::Preflight { total: 42 },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["tag"], "my-site");
        assert_eq!(json["type"], "Preflight");
        assert_eq!(json["total"], 42);
    }

    #[test]
    fn error_nonfatal_carries_error_kind_string() {
        let msg = Message {
            tag: "x".to_string(),
            event: Event::error_nonfatal(ErrorKind::MalformedSitemap, None, "bad xml"),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "ErrorNonfatal");
        assert_eq!(json["errorKind"], "MalformedSitemap");
        assert_eq!(json["errorStr"], "bad xml");
    }

    #[test]
    fn unit_variants_serialize_without_extra_fields() {
        let msg = Message {
            tag: "x".to_string(),
            event: Event::PageDone,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json.as_object().unwrap().len(), 2);
    }
}
