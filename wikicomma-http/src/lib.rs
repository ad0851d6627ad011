//! # wikicomma-http
//!
//! The crawler's HTTP substrate: a token-bucket rate limiter, a cookie jar,
//! connection slots with a watchdog backstop, and a `reqwest`-backed client
//! that ties them together with manual redirect handling, bounded
//! transport retries, and http/socks proxy selection.

pub mod client;
pub mod cookies;
pub mod ratelimit;
pub mod slots;

pub use client::{HttpClient, HttpResponse, ProxyConfig, RequestOptions};
pub use cookies::{Cookie, CookieJar};
pub use ratelimit::RateLimiter;
pub use slots::{SlotGuard, SlotPool};
