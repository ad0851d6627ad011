//! # Page info, voters, files, lock status, and revision list parsing
//!
//! Everything needed to refresh one [`PageMeta`](wikicomma_store::model::PageMeta)
//! from the remote (spec §4.8 step 5): the page info page's embedded
//! `WIKIREQUEST` script block and rating widget, the `WhoRatedPageModule`
//! voter list, the `PageFilesModule` attachment list, and the paginated
//! `PageRevisionListModule` history.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use wikicomma_error::{Error, ErrorKind, Result};
use wikicomma_http::{HttpClient, RequestOptions};
use wikicomma_store::model::{FileMeta, PageRevision, Voting};

use crate::remote::{self, module, TokenGuard};

/// Revisions returned per `PageRevisionListModule` page; pagination
/// continues until a page returns zero entries, never on a short page
/// (spec §4.8 tie-break, §8 boundary behavior).
pub const REVISIONS_PER_PAGE: usize = 20;

static PAGE_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"WIKIREQUEST\.info\.pageId\s*=\s*(\d+)").unwrap());
static FORUM_THREAD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"discuss\.php\?t=(\d+)"#).unwrap());
static ONCLICK_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)").unwrap());

/// Everything extracted from the page info page in one parse pass.
#[derive(Debug, Clone, Default)]
pub struct PageInfo {
    pub page_id: u64,
    pub rating: Option<i64>,
    pub tags: Vec<String>,
    pub title: Option<String>,
    pub parent: Option<String>,
    pub forum_thread: Option<u64>,
}

/// Fetch and parse `/<page-name>/noredirect/true?_ts=<ms>` (spec §6).
pub async fn fetch_page_info(http: &Arc<HttpClient>, site_url: &str, page_name: &str, now_ms: i64) -> Result<PageInfo> {
    let url = format!("{}/{page_name}/noredirect/true?_ts={now_ms}", site_url.trim_end_matches('/'));
    let response = http.get(&url, RequestOptions::new()).await?;
    parse_page_info(&response.text())
}

pub fn parse_page_info(html: &str) -> Result<PageInfo> {
    let page_id = PAGE_ID_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| Error::new(ErrorKind::ParseFailed, "could not locate WIKIREQUEST.info.pageId").with_operation("pages::parse_page_info"))?;

    let doc = Html::parse_document(html);

    let title_sel = Selector::parse("#page-title").unwrap();
    let title = doc.select(&title_sel).next().map(|e| e.text().collect::<String>().trim().to_string()).filter(|s| !s.is_empty());

    let tags_sel = Selector::parse(".page-tags a").unwrap();
    let tags: Vec<String> = doc.select(&tags_sel).map(|e| e.text().collect::<String>().trim().to_string()).filter(|s| !s.is_empty()).collect();

    let rating_sel = Selector::parse(".rate-points, .number.prw54353").unwrap();
    let rating = doc
        .select(&rating_sel)
        .next()
        .and_then(|e| e.text().collect::<String>().trim().replace('+', "").parse::<i64>().ok());

    let parent_sel = Selector::parse("#breadcrumbs a").unwrap();
    let parent = doc.select(&parent_sel).last().and_then(|e| e.value().attr("href")).map(|href| href.trim_start_matches('/').to_string());

    let forum_thread = FORUM_THREAD_RE.captures(html).and_then(|c| c.get(1)).and_then(|m| m.as_str().parse().ok());

    Ok(PageInfo {
        page_id,
        rating,
        tags,
        title,
        parent,
        forum_thread,
    })
}

/// Fetch the lock status of a page via `PageEditModule` (requesting the
/// edit form is the cheapest way the remote surfaces `is_locked`, per the
/// site's own edit-conflict UI).
pub async fn fetch_lock_status(
    http: &Arc<HttpClient>,
    site_url: &str,
    guard: &TokenGuard,
    page_id: u64,
) -> Result<bool> {
    let resp = remote::call_module_with_token(
        http,
        site_url,
        guard,
        module::PAGE_EDIT,
        vec![("page_id".to_string(), page_id.to_string()), ("mode".to_string(), "page".to_string())],
        true,
    )
    .await?;

    let status = resp.field("status").and_then(|v| v.as_str()).unwrap_or("");
    Ok(status == "page_locked" || resp.field("locked").and_then(|v| v.as_bool()).unwrap_or(false))
}

/// Parse `WhoRatedPageModule`'s body into `(username, vote)` pairs. The
/// username, not a numeric id, is the unit of identity here — the caller
/// resolves usernames to ids via [`wikicomma_store::users::UserResolver`]
/// (spec §3: `votings[(user_id|null, bool)]`, §9 open question: `None`
/// votes are kept, not dropped).
pub fn parse_voters(html: &str) -> Vec<(Option<String>, bool)> {
    let doc = Html::parse_document(html);
    let row_sel = Selector::parse(".who-rated-page-area span, .printuser").unwrap();
    let mut out = Vec::new();

    for el in doc.select(&row_sel) {
        let username = el.text().collect::<String>().trim().to_string();
        let username = if username.is_empty() { None } else { Some(username) };
        let classes = el.value().attr("class").unwrap_or("");
        let value = !classes.contains("minus") && !el.text().collect::<String>().contains('-');
        out.push((username, value));
    }
    out
}

/// Resolve parsed voter rows into [`Voting`] entries once usernames have
/// been mapped to user ids (`None` preserved verbatim per spec §9).
pub fn voters_to_votings(voters: &[(Option<String>, bool)], resolve: impl Fn(&str) -> Option<u64>) -> Vec<Voting> {
    voters
        .iter()
        .map(|(username, value)| Voting {
            user_id: username.as_deref().and_then(&resolve),
            value: *value,
        })
        .collect()
}

/// Parse `PageFilesModule`'s body into [`FileMeta`] entries. Fields the
/// listing doesn't carry (`mime`, `internal_version`) are filled in by a
/// follow-up `FileInformationWinModule` call in the engine.
pub fn parse_files(html: &str) -> Vec<FileMeta> {
    let doc = Html::parse_document(html);
    let row_sel = Selector::parse("tr.file-row, .files-pages-box tr").unwrap();
    let mut out = Vec::new();

    for row in doc.select(&row_sel) {
        let link_sel = Selector::parse("a").unwrap();
        let Some(link) = row.select(&link_sel).next() else { continue };
        let Some(href) = link.value().attr("href") else { continue };
        let name = href.rsplit('/').next().unwrap_or(href).to_string();
        let file_id = ONCLICK_ID_RE
            .captures(row.value().attr("id").unwrap_or(""))
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);

        out.push(FileMeta {
            file_id,
            name: name.clone(),
            url: href.to_string(),
            size: String::new(),
            size_bytes: 0,
            mime: String::new(),
            content_type: String::new(),
            author: None,
            stamp: 0,
            internal_version: 0,
        });
    }
    out
}

/// Extra attributes `PageFilesModule`'s listing doesn't carry, fetched
/// per-file via `FileInformationWinModule` (spec §3 `FileMeta`: mime,
/// content-type, size_bytes, internal_version, author, stamp).
#[derive(Debug, Clone, Default)]
pub struct FileInfo {
    pub size_bytes: u64,
    pub mime: String,
    pub content_type: String,
    pub author: Option<String>,
    pub stamp: i64,
    pub internal_version: u64,
}

pub async fn fetch_file_info(http: &Arc<HttpClient>, site_url: &str, guard: &TokenGuard, file_id: u64) -> Result<FileInfo> {
    let resp = remote::call_module_with_token(
        http,
        site_url,
        guard,
        module::FILE_INFORMATION,
        vec![("fileId".to_string(), file_id.to_string())],
        false,
    )
    .await?;
    Ok(parse_file_info(resp.body()))
}

pub fn parse_file_info(html: &str) -> FileInfo {
    let doc = Html::parse_fragment(html);

    let size_sel = Selector::parse(".size").unwrap();
    let size_bytes = doc
        .select(&size_sel)
        .next()
        .map(|e| e.text().collect::<String>())
        .and_then(|s| s.chars().filter(|c| c.is_ascii_digit()).collect::<String>().parse().ok())
        .unwrap_or(0);

    let mime_sel = Selector::parse(".mime-type, .content-type").unwrap();
    let mime = doc.select(&mime_sel).next().map(|e| e.text().collect::<String>().trim().to_string()).unwrap_or_default();

    let author_sel = Selector::parse(".printuser").unwrap();
    let author = doc.select(&author_sel).next().map(|e| e.text().collect::<String>().trim().to_string()).filter(|s| !s.is_empty());

    let version_sel = Selector::parse(".version, .revision-no").unwrap();
    let internal_version = doc
        .select(&version_sel)
        .next()
        .map(|e| e.text().collect::<String>())
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0);

    FileInfo {
        size_bytes,
        mime: mime.clone(),
        content_type: mime,
        author,
        stamp: 0,
        internal_version,
    }
}

/// One page of `PageRevisionListModule`, parsed into [`PageRevision`]
/// entries. `global_revision` is read from each row's `id="revision-row-N"`
/// attribute, the one globally unique identifier the listing exposes.
pub fn parse_revision_page(html: &str, resolve_author: impl Fn(&str) -> Option<u64>) -> Vec<PageRevision> {
    let doc = Html::parse_document(html);
    let row_sel = Selector::parse("tr.revision-row, tr[id^='revision-row-']").unwrap();
    let mut out = Vec::new();

    for row in doc.select(&row_sel) {
        let id_attr = row.value().attr("id").unwrap_or("");
        let Some(global_revision) = id_attr.rsplit('-').next().and_then(|s| s.parse::<u64>().ok()) else { continue };

        let rev_no_sel = Selector::parse(".rev-no, td.revision-no").unwrap();
        let revision = row
            .select(&rev_no_sel)
            .next()
            .map(|e| e.text().collect::<String>())
            .and_then(|s| s.trim().trim_start_matches('.').parse::<u64>().ok())
            .unwrap_or(global_revision);

        let author_sel = Selector::parse(".printuser").unwrap();
        let author = row.select(&author_sel).next().map(|e| e.text().collect::<String>().trim().to_string()).and_then(|u| resolve_author(&u));

        let commentary_sel = Selector::parse(".comments, .commentary").unwrap();
        let commentary = row.select(&commentary_sel).next().map(|e| e.text().collect::<String>().trim().to_string()).filter(|s| !s.is_empty());

        let flags_sel = Selector::parse(".revision-flags, .flags").unwrap();
        let flags = row.select(&flags_sel).next().map(|e| e.text().collect::<String>().trim().to_string()).filter(|s| !s.is_empty());

        out.push(PageRevision {
            revision,
            global_revision,
            author,
            stamp: None,
            flags,
            commentary,
        });
    }
    out
}

/// Fetch every revision history page starting at `from_page`, stopping on
/// the first zero-length page (spec §4.8 tie-break; §8 boundary case: a
/// last page exactly [`REVISIONS_PER_PAGE`] long must not be mistaken for
/// the final page).
pub async fn fetch_all_revisions(
    http: &Arc<HttpClient>,
    site_url: &str,
    guard: &TokenGuard,
    page_id: u64,
) -> Result<Vec<PageRevision>> {
    let mut out = Vec::new();
    let mut page = 1u32;
    loop {
        let resp = remote::call_module_with_token(
            http,
            site_url,
            guard,
            module::PAGE_REVISION_LIST,
            vec![
                ("page_id".to_string(), page_id.to_string()),
                ("page".to_string(), page.to_string()),
                ("perpage".to_string(), REVISIONS_PER_PAGE.to_string()),
            ],
            false,
        )
        .await?;

        let parsed = parse_revision_page(resp.body(), |_| None);
        if parsed.is_empty() {
            break;
        }
        out.extend(parsed);
        page += 1;
    }
    Ok(out)
}

/// Fetch only revisions newer than `local_max` (spec §4.8 step 5
/// incremental fetch), again terminating on a zero-length page.
pub async fn fetch_new_revisions(
    http: &Arc<HttpClient>,
    site_url: &str,
    guard: &TokenGuard,
    page_id: u64,
    local_max: u64,
) -> Result<Vec<PageRevision>> {
    let mut out = Vec::new();
    let mut page = 1u32;
    'outer: loop {
        let resp = remote::call_module_with_token(
            http,
            site_url,
            guard,
            module::PAGE_REVISION_LIST,
            vec![
                ("page_id".to_string(), page_id.to_string()),
                ("page".to_string(), page.to_string()),
                ("perpage".to_string(), REVISIONS_PER_PAGE.to_string()),
            ],
            false,
        )
        .await?;

        let parsed = parse_revision_page(resp.body(), |_| None);
        if parsed.is_empty() {
            break;
        }
        for rev in parsed {
            if rev.revision <= local_max {
                break 'outer;
            }
            out.push(rev);
        }
        page += 1;
    }
    Ok(out)
}

/// Fetch one revision's source text via `PageSourceModule`. `&nbsp;` is the
/// only HTML entity this archiver normalizes (spec §4.8 tie-break: the
/// rest of the source is preserved byte-for-byte).
pub async fn fetch_revision_source(
    http: &Arc<HttpClient>,
    site_url: &str,
    guard: &TokenGuard,
    revision_id: u64,
) -> Result<String> {
    let resp = remote::call_module_with_token(
        http,
        site_url,
        guard,
        module::PAGE_SOURCE,
        vec![("revision_id".to_string(), revision_id.to_string())],
        false,
    )
    .await?;

    let doc = Html::parse_fragment(resp.body());
    let sel = Selector::parse("div.page-source").unwrap();
    let source = doc
        .select(&sel)
        .next()
        .map(|e| e.inner_html())
        .unwrap_or_else(|| resp.body().to_string());

    Ok(source.replace("&nbsp;", " "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_page_info_extracts_id_tags_title() {
        let html = r#"
        <html><head><script>
        WIKIREQUEST.info.pageId = 42;
        </script></head>
        <body>
        <div id="page-title">Hello World</div>
        <div class="page-tags"><a href="#">scp</a><a href="#">tale</a></div>
        </body></html>"#;
        let info = parse_page_info(html).unwrap();
        assert_eq!(info.page_id, 42);
        assert_eq!(info.title.as_deref(), Some("Hello World"));
        assert_eq!(info.tags, vec!["scp", "tale"]);
    }

    #[test]
    fn parse_page_info_missing_id_is_parse_error() {
        let err = parse_page_info("<html></html>").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseFailed);
    }

    #[test]
    fn parse_revision_page_extracts_global_revision_from_row_id() {
        let html = r#"
        <table>
        <tr id="revision-row-1001"><td class="revision-no">.5</td><td class="printuser">alice</td></tr>
        <tr id="revision-row-1000"><td class="revision-no">.4</td><td class="printuser">bob</td></tr>
        </table>"#;
        let revs = parse_revision_page(html, |_| None);
        assert_eq!(revs.len(), 2);
        assert_eq!(revs[0].global_revision, 1001);
        assert_eq!(revs[0].revision, 5);
        assert_eq!(revs[1].global_revision, 1000);
    }

    #[test]
    fn parse_revision_page_empty_html_terminates() {
        let revs = parse_revision_page("<table></table>", |_| None);
        assert!(revs.is_empty());
    }

    #[test]
    fn parse_file_info_extracts_size_and_mime() {
        let html = r#"<div><span class="size">1024 bytes</span><span class="mime-type">application/pdf</span><span class="printuser">alice</span></div>"#;
        let info = parse_file_info(html);
        assert_eq!(info.size_bytes, 1024);
        assert_eq!(info.mime, "application/pdf");
        assert_eq!(info.content_type, "application/pdf");
        assert_eq!(info.author.as_deref(), Some("alice"));
    }

    #[test]
    fn parse_files_extracts_name_and_url() {
        let html = r#"<table><tr class="file-row" id="file-row-7"><td><a href="/local--files/hello/doc.pdf">doc.pdf</a></td></tr></table>"#;
        let files = parse_files(html);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_id, 7);
        assert_eq!(files[0].name, "doc.pdf");
    }
}
