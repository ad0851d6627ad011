//! # wikicomma-core
//!
//! The crawl state machine and scheduling substrate: the worker pool, the
//! remote ajax-module-connector wire protocol, page/forum/sitemap parsing,
//! telemetry events, and the `SiteEngine` that drives one wiki's run
//! through sitemap diff, page scan, forum scan, pending-queue drains, and
//! compaction.

pub mod engine;
pub mod forum;
pub mod pages;
pub mod pool;
pub mod remote;
pub mod sitemap;
pub mod telemetry;

pub use engine::{SiteEngine, SiteEngineConfig};
pub use pool::{JobQueue, WorkerPool};
pub use telemetry::{Event, NullTelemetry, ProgressStatus, Sink, Telemetry, TracingTelemetry};
