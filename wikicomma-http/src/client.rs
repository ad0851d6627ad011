//! # HTTP client
//!
//! Wraps [`reqwest::Client`] with the orchestration spec §4.3 requires on
//! top of it: a rate-limit wait, a connection slot, cookie handling, manual
//! redirect following (so we can release the slot between hops), bounded
//! retries on transport errors, and http/socks proxy selection. Automatic
//! response decompression (`br`, `gzip`, `deflate`) and per-request/total
//! timeouts are left to `reqwest` itself (spec §9: prefer transport
//! timeouts over out-of-band watchdogs where the transport supports them).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use tracing::{debug, warn};
use wikicomma_error::{Error, ErrorKind, Result};

use crate::cookies::CookieJar;
use crate::ratelimit::RateLimiter;
use crate::slots::SlotPool;

const STREAM_STALL_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_TRANSPORT_RETRIES: usize = 2;
const DEFAULT_USER_AGENT: &str = "wikicomma-archiver/1.0";

/// Forward-proxy configuration (spec §6 `http_proxy`/`socks_proxy`).
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    pub http_proxy: Option<(String, u16)>,
    pub socks_proxy: Option<(String, u16)>,
}

/// Per-request overrides.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: HashMap<String, String>,
    /// Form-encoded body fields, sent as `application/x-www-form-urlencoded`.
    pub form: Vec<(String, String)>,
    pub follow_redirects: bool,
    /// When true, a non-2xx/non-success `status` field in a JSON body is
    /// returned to the caller instead of raised as an `Error`.
    pub soft: bool,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self {
            follow_redirects: true,
            ..Default::default()
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn form_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.form.push((key.into(), value.into()));
        self
    }

    pub fn soft(mut self) -> Self {
        self.soft = true;
        self
    }
}

/// A successfully completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Result<serde_json::Value> {
        serde_json::from_slice(&self.body).map_err(|e| {
            Error::new(ErrorKind::ParseFailed, e.to_string()).with_operation("http::json")
        })
    }

    pub fn is_success(&self) -> bool {
        self.status == 200 || self.status == 206
    }
}

/// The crawler's HTTP client: rate-limited, connection-sloted, cookie-aware.
pub struct HttpClient {
    direct: reqwest::Client,
    http_proxy_client: Option<reqwest::Client>,
    socks_client: Option<reqwest::Client>,
    proxy: ProxyConfig,
    pub cookies: Arc<CookieJar>,
    ratelimit: Arc<RateLimiter>,
    slots: Arc<SlotPool>,
    user_agent: String,
}

impl HttpClient {
    pub fn new(
        slot_count: usize,
        ratelimit: Arc<RateLimiter>,
        proxy: ProxyConfig,
    ) -> Result<Self> {
        let base = || {
            reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .timeout(STREAM_STALL_TIMEOUT * 3)
                .gzip(true)
                .brotli(true)
                .deflate(true)
        };

        let direct = base()
            .build()
            .map_err(|e| Error::network(e.to_string()).with_operation("http::build_client"))?;

        let http_proxy_client = match &proxy.http_proxy {
            Some((host, port)) => {
                let proxy_url = format!("http://{host}:{port}");
                let p = reqwest::Proxy::http(&proxy_url)
                    .map_err(|e| Error::config_invalid(e.to_string()))?;
                Some(
                    base()
                        .proxy(p)
                        .build()
                        .map_err(|e| Error::network(e.to_string()))?,
                )
            }
            None => None,
        };

        let socks_client = match &proxy.socks_proxy {
            Some((host, port)) => {
                let proxy_url = format!("socks5://{host}:{port}");
                let p = reqwest::Proxy::all(&proxy_url)
                    .map_err(|e| Error::config_invalid(e.to_string()))?;
                Some(
                    base()
                        .proxy(p)
                        .build()
                        .map_err(|e| Error::network(e.to_string()))?,
                )
            }
            None => None,
        };

        Ok(Self {
            direct,
            http_proxy_client,
            socks_client,
            proxy,
            cookies: Arc::new(CookieJar::new()),
            ratelimit,
            slots: SlotPool::new(slot_count),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        })
    }

    fn pick_client(&self, url: &url::Url) -> &reqwest::Client {
        if url.scheme() == "http" {
            if let Some(c) = &self.http_proxy_client {
                return c;
            }
        } else if url.scheme() == "https" {
            if let Some(c) = &self.socks_client {
                return c;
            }
        }
        &self.direct
    }

    /// Rewrite the request target when routing through a plain HTTP forward
    /// proxy (spec §4.3: "rewrite target to proxy host and set Host header").
    fn proxy_target(&self, url: &url::Url) -> (String, Option<String>) {
        if url.scheme() == "http" {
            if let Some((host, port)) = &self.proxy.http_proxy {
                let host_header = url.host_str().map(|h| h.to_string());
                let mut proxied = url.clone();
                let _ = proxied.set_host(Some(host));
                let _ = proxied.set_port(Some(*port));
                return (proxied.to_string(), host_header);
            }
        }
        (url.to_string(), None)
    }

    pub async fn get(&self, url: &str, opts: RequestOptions) -> Result<HttpResponse> {
        self.execute(Method::GET, url, opts).await
    }

    pub async fn post(&self, url: &str, opts: RequestOptions) -> Result<HttpResponse> {
        self.execute(Method::POST, url, opts).await
    }

    async fn execute(&self, method: Method, url: &str, opts: RequestOptions) -> Result<HttpResponse> {
        let mut current_url = url.to_string();
        let mut hops = 0usize;

        loop {
            let response = self.execute_once(method.clone(), &current_url, &opts).await?;

            if opts.follow_redirects && matches!(response.status, 301 | 302) {
                if let Some(location) = response
                    .headers
                    .get("location")
                    .or_else(|| response.headers.get("Location"))
                {
                    hops += 1;
                    if hops > 10 {
                        return Err(Error::new(ErrorKind::WhatTheFuck, "too many redirects")
                            .with_operation("http::execute"));
                    }
                    current_url = resolve_redirect(&current_url, location);
                    continue;
                }
            }

            if !response.is_success() && !opts.soft {
                return Err(
                    Error::http_status(response.status, String::from_utf8_lossy(&response.body))
                        .with_operation("http::execute"),
                );
            }

            return Ok(HttpResponse {
                status: response.status,
                body: response.body,
            });
        }
    }

    async fn execute_once(
        &self,
        method: Method,
        url: &str,
        opts: &RequestOptions,
    ) -> Result<RawResponse> {
        let mut last_err = None;
        for attempt in 0..=MAX_TRANSPORT_RETRIES {
            match self.try_once(method.clone(), url, opts).await {
                Ok(resp) => return Ok(resp),
                Err(err) if attempt < MAX_TRANSPORT_RETRIES => {
                    warn!(attempt, %url, "transport error, retrying: {err}");
                    last_err = Some(err);
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::network("exhausted retries").with_operation("http::execute_once")))
    }

    async fn try_once(&self, method: Method, url: &str, opts: &RequestOptions) -> Result<RawResponse> {
        self.ratelimit.acquire().await;
        let slot = self.slots.acquire().await;

        let parsed = url::Url::parse(url)
            .map_err(|e| Error::new(ErrorKind::ParseFailed, e.to_string()).with_operation("http::parse_url"))?;
        let host = parsed.host_str().unwrap_or_default().to_string();
        let path = parsed.path().to_string();
        let secure = parsed.scheme() == "https";

        let (target, host_header) = self.proxy_target(&parsed);
        let client = self.pick_client(&parsed);

        let mut req = client.request(method, &target);
        req = req.header("User-Agent", &self.user_agent);
        req = req.header("Accept-Encoding", "br, gzip, deflate");

        if let Some(cookie_header) = self.cookies.header_for(&host, &path, secure) {
            req = req.header("Cookie", cookie_header);
        }
        if let Some(host_header) = host_header {
            req = req.header("Host", host_header);
        }
        for (k, v) in &opts.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if !opts.form.is_empty() {
            req = req.form(&opts.form);
        }

        let send_fut = req.send();
        let forced = slot.forced_unlock();
        tokio::pin!(send_fut);
        tokio::pin!(forced);

        let response = tokio::select! {
            result = &mut send_fut => result.map_err(|e| {
                Error::network(e.to_string()).with_operation("http::send")
            })?,
            _ = &mut forced => {
                return Err(Error::timeout("connection slot watchdog forced unlock")
                    .with_operation("http::send"));
            }
        };

        slot.heartbeat();

        for cookie_header in response.headers().get_all("set-cookie") {
            if let Ok(s) = cookie_header.to_str() {
                self.cookies.put(s, &host);
            }
        }

        let status = response.status();
        let mut headers = HashMap::new();
        if let Some(loc) = response.headers().get("location") {
            if let Ok(s) = loc.to_str() {
                headers.insert("location".to_string(), s.to_string());
            }
        }

        let body = self.collect_body(response, &slot).await?;

        Ok(RawResponse {
            status: status.as_u16(),
            body,
            headers,
        })
    }

    async fn collect_body(
        &self,
        response: reqwest::Response,
        slot: &crate::slots::SlotGuard,
    ) -> Result<Vec<u8>> {
        use futures_util::StreamExt;

        let mut buf = Vec::new();
        let mut stream = response.bytes_stream();

        loop {
            let chunk = tokio::time::timeout(STREAM_STALL_TIMEOUT, stream.next()).await;
            match chunk {
                Ok(Some(Ok(bytes))) => {
                    buf.extend_from_slice(&bytes);
                    slot.heartbeat();
                }
                Ok(Some(Err(e))) => {
                    if buf.is_empty() {
                        return Err(Error::network(e.to_string()).with_operation("http::stream"));
                    }
                    debug!("stream error after partial read, returning {} bytes collected", buf.len());
                    return Ok(buf);
                }
                Ok(None) => return Ok(buf),
                Err(_elapsed) => {
                    if buf.is_empty() {
                        return Err(Error::timeout("too slow download stream")
                            .with_operation("http::stream"));
                    }
                    // fallback: decode what accumulated instead of losing it
                    debug!("stream stalled, falling back to {} partial bytes", buf.len());
                    return Ok(buf);
                }
            }
        }
    }

    pub fn slot_lockups(&self) -> usize {
        self.slots.lockups()
    }

    pub fn status_is_success(status: StatusCode) -> bool {
        status == StatusCode::OK || status.as_u16() == 206
    }
}

struct RawResponse {
    status: u16,
    body: Vec<u8>,
    headers: HashMap<String, String>,
}

impl RawResponse {
    fn is_success(&self) -> bool {
        self.status == 200 || self.status == 206
    }
}

/// Resolve a redirect `Location` header per spec §4.3: protocol-relative
/// (`//host/…`), absolute-path (`/…`), or fully-qualified URLs.
fn resolve_redirect(current: &str, location: &str) -> String {
    if location.starts_with("//") {
        let scheme = url::Url::parse(current).map(|u| u.scheme().to_string()).unwrap_or_else(|_| "https".to_string());
        format!("{scheme}:{location}")
    } else if location.starts_with('/') {
        match url::Url::parse(current) {
            Ok(base) => format!(
                "{}://{}{}",
                base.scheme(),
                base.host_str().unwrap_or_default(),
                location
            ),
            Err(_) => location.to_string(),
        }
    } else {
        location.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_protocol_relative_redirect() {
        let next = resolve_redirect("https://example.wikidot.com/a", "//other.wikidot.com/b");
        assert_eq!(next, "https://other.wikidot.com/b");
    }

    #[test]
    fn resolve_absolute_path_redirect() {
        let next = resolve_redirect("https://example.wikidot.com/a/b", "/c");
        assert_eq!(next, "https://example.wikidot.com/c");
    }

    #[test]
    fn resolve_fully_qualified_redirect() {
        let next = resolve_redirect("https://example.wikidot.com/a", "https://other.com/c");
        assert_eq!(next, "https://other.com/c");
    }
}
