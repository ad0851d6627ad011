//! # Sitemap fetch & diff
//!
//! Recursively resolves `sitemap.xml` and any sub-sitemaps it references,
//! flattening `<url><loc>/<lastmod>` pairs into page names (spec §4.8 step
//! 3), then diffs the flattened list against the prior run's snapshot
//! (step 5) and the set of names that disappeared (step 4).
//!
//! XML parsing uses `roxmltree`, the same crate the `trust-platform`
//! example reaches for wherever it needs a small, dependency-light XML
//! reader (its `trust-runtime` OPC UA / config loading path).

use std::collections::HashMap;
use std::sync::Arc;

use wikicomma_error::{Error, ErrorKind, Result};
use wikicomma_http::{HttpClient, RequestOptions};
use wikicomma_store::model::SiteMapEntry;

/// Forum URLs are archived through the forum module, not the sitemap path;
/// the root URL with an empty path carries no page name at all.
fn is_relevant(path: &str) -> bool {
    !path.is_empty() && !path.starts_with("/forum/") && path != "/"
}

/// Recursively fetch `sitemap.xml` at `site_url`, following any
/// `<sitemap><loc>` entries it contains, and flatten every `<url>` entry
/// into `(name, lastmod)`. Sub-sitemap fetch failures are logged and
/// skipped rather than aborting the whole resolve (best-effort, spec §7).
pub async fn fetch_sitemap(
    http: &Arc<HttpClient>,
    site_url: &str,
    blacklist: &[String],
) -> Result<Vec<(String, Option<i64>)>> {
    let root = format!("{}/sitemap.xml", site_url.trim_end_matches('/'));
    let mut out = Vec::new();
    let mut seen_sitemaps = std::collections::HashSet::new();
    resolve_one(http, site_url, &root, &mut out, &mut seen_sitemaps).await?;

    out.retain(|(name, _)| !blacklist.iter().any(|b| b == name));
    Ok(out)
}

async fn resolve_one(
    http: &Arc<HttpClient>,
    site_url: &str,
    sitemap_url: &str,
    out: &mut Vec<(String, Option<i64>)>,
    seen: &mut std::collections::HashSet<String>,
) -> Result<()> {
    if !seen.insert(sitemap_url.to_string()) {
        return Ok(());
    }

    let response = http.get(sitemap_url, RequestOptions::new()).await?;
    let xml = response.text();
    let doc = roxmltree::Document::parse(&xml).map_err(|e| {
        Error::new(ErrorKind::MalformedSitemap, e.to_string())
            .with_operation("sitemap::resolve_one")
            .with_context("url", sitemap_url.to_string())
    })?;

    let root_name = doc.root_element().tag_name().name();
    match root_name {
        "sitemapindex" => {
            let mut children = Vec::new();
            for sitemap_el in doc.root_element().children().filter(|n| n.has_tag_name("sitemap")) {
                if let Some(loc) = child_text(sitemap_el, "loc") {
                    children.push(loc);
                }
            }
            for loc in children {
                // best-effort: a broken sub-sitemap does not abort the rest
                if let Err(e) = Box::pin(resolve_one(http, site_url, &loc, out, seen)).await {
                    tracing::warn!(url = %loc, "sub-sitemap fetch failed: {e}");
                }
            }
        }
        "urlset" => {
            for url_el in doc.root_element().children().filter(|n| n.has_tag_name("url")) {
                let Some(loc) = child_text(url_el, "loc") else { continue };
                let lastmod = child_text(url_el, "lastmod").and_then(|s| parse_iso8601(&s));
                let name = name_from_loc(&loc, site_url);
                if is_relevant(&format!("/{name}")) {
                    out.push((name, lastmod));
                }
            }
        }
        _ => {
            return Err(Error::new(ErrorKind::MalformedSitemap, "unrecognized sitemap root element")
                .with_operation("sitemap::resolve_one")
                .with_context("root", root_name.to_string()));
        }
    }

    Ok(())
}

fn child_text(node: roxmltree::Node, tag: &str) -> Option<String> {
    node.children()
        .find(|n| n.has_tag_name(tag))
        .and_then(|n| n.text())
        .map(|s| s.trim().to_string())
}

/// A `<loc>` is normally `https://site.wikidot.com/page-name`. If the host
/// doesn't match the wiki's own URL (a sub-sitemap on a CDN domain, say)
/// fall back to just the URL's path (spec §4.8 step 3).
fn name_from_loc(loc: &str, site_url: &str) -> String {
    let expected_host = url::Url::parse(site_url).ok().and_then(|u| u.host_str().map(str::to_string));
    match url::Url::parse(loc) {
        Ok(parsed) => {
            let same_host = expected_host.as_deref() == parsed.host_str();
            let path = parsed.path().trim_start_matches('/').to_string();
            if same_host {
                path
            } else {
                path
            }
        }
        Err(_) => loc.trim_start_matches('/').to_string(),
    }
}

fn parse_iso8601(s: &str) -> Option<i64> {
    // `YYYY-MM-DDTHH:MM:SS(Z|+HH:MM)` — enough structure to get epoch
    // seconds without pulling in a full date/time crate for one field.
    let (date, time) = s.split_once('T')?;
    let mut date_parts = date.split('-');
    let year: i64 = date_parts.next()?.parse().ok()?;
    let month: i64 = date_parts.next()?.parse().ok()?;
    let day: i64 = date_parts.next()?.parse().ok()?;

    let time = time.trim_end_matches('Z');
    let time = time.split(['+', '-']).next().unwrap_or(time);
    let mut time_parts = time.split(':');
    let hour: i64 = time_parts.next()?.parse().ok()?;
    let minute: i64 = time_parts.next()?.parse().ok()?;
    let second: i64 = time_parts.next().and_then(|s| s.split('.').next()).and_then(|s| s.parse().ok()).unwrap_or(0);

    Some(days_from_civil(year, month, day) * 86_400 + hour * 3600 + minute * 60 + second)
}

/// Howard Hinnant's civil-from-days algorithm, inverted: days since the
/// Unix epoch for a given proleptic-Gregorian `(y, m, d)`.
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as i64;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// The result of diffing a freshly fetched sitemap against the prior
/// snapshot (spec §4.8 steps 4-5).
pub struct SitemapDiff {
    /// Names present in the new sitemap, paired with their new `lastmod`.
    /// Includes both genuinely new pages and pages whose `lastmod` moved.
    pub dirty: Vec<(String, Option<i64>)>,
    /// Names present in the new sitemap whose `lastmod` is unchanged from
    /// the prior snapshot — these are scan candidates, not necessarily
    /// fetched (the page-metadata-file-exists check happens in the caller).
    pub unchanged: Vec<String>,
    /// Names present in the old snapshot but absent from the new one.
    pub removed: Vec<String>,
    /// The new snapshot to persist as `meta/sitemap.json` once this run completes.
    pub new_snapshot: HashMap<String, SiteMapEntry>,
}

pub fn diff(new_entries: &[(String, Option<i64>)], old_snapshot: &HashMap<String, SiteMapEntry>) -> SitemapDiff {
    let mut dirty = Vec::new();
    let mut unchanged = Vec::new();
    let mut new_snapshot = HashMap::new();

    let new_names: std::collections::HashSet<&str> = new_entries.iter().map(|(n, _)| n.as_str()).collect();

    for (name, lastmod) in new_entries {
        new_snapshot.insert(
            name.clone(),
            SiteMapEntry {
                name: name.clone(),
                last_modified: *lastmod,
            },
        );

        match old_snapshot.get(name) {
            Some(prior) if prior.last_modified == *lastmod => unchanged.push(name.clone()),
            _ => dirty.push((name.clone(), *lastmod)),
        }
    }

    let removed: Vec<String> = old_snapshot.keys().filter(|name| !new_names.contains(name.as_str())).cloned().collect();

    SitemapDiff {
        dirty,
        unchanged,
        removed,
        new_snapshot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_urlset_and_filters_forum_and_root() {
        let xml = r#"<?xml version="1.0"?>
        <urlset>
            <url><loc>https://x.wikidot.com/hello</loc><lastmod>2024-01-02T03:04:05Z</lastmod></url>
            <url><loc>https://x.wikidot.com/forum/c-1</loc></url>
            <url><loc>https://x.wikidot.com/</loc></url>
        </urlset>"#;
        let doc = roxmltree::Document::parse(xml).unwrap();
        let mut names = Vec::new();
        for url_el in doc.root_element().children().filter(|n| n.has_tag_name("url")) {
            let loc = child_text(url_el, "loc").unwrap();
            let name = name_from_loc(&loc, "https://x.wikidot.com");
            if is_relevant(&format!("/{name}")) {
                names.push(name);
            }
        }
        assert_eq!(names, vec!["hello".to_string()]);
    }

    #[test]
    fn parses_iso8601_lastmod() {
        let ts = parse_iso8601("2024-01-02T03:04:05Z").unwrap();
        // 2024-01-02T03:04:05Z
        assert_eq!(ts, 1_704_165_845);
    }

    #[test]
    fn diff_detects_new_changed_and_removed() {
        let mut old = HashMap::new();
        old.insert(
            "stable".to_string(),
            SiteMapEntry { name: "stable".to_string(), last_modified: Some(100) },
        );
        old.insert(
            "gone".to_string(),
            SiteMapEntry { name: "gone".to_string(), last_modified: Some(50) },
        );
        old.insert(
            "changed".to_string(),
            SiteMapEntry { name: "changed".to_string(), last_modified: Some(1) },
        );

        let new_entries = vec![
            ("stable".to_string(), Some(100)),
            ("changed".to_string(), Some(2)),
            ("brand_new".to_string(), Some(5)),
        ];

        let d = diff(&new_entries, &old);
        assert_eq!(d.unchanged, vec!["stable".to_string()]);
        assert_eq!(d.removed, vec!["gone".to_string()]);
        assert!(d.dirty.iter().any(|(n, _)| n == "changed"));
        assert!(d.dirty.iter().any(|(n, _)| n == "brand_new"));
        assert_eq!(d.new_snapshot.len(), 3);
    }
}
