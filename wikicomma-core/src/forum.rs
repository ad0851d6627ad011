//! # Forum categories, threads, and posts
//!
//! Category listing, thread pagination, and the post tree fetch, plus the
//! per-post revision list (spec §4.8 step 7: forums). Like [`crate::pages`],
//! parsing is split from transport so the HTML shapes can be exercised
//! without a live site.

use std::sync::Arc;

use scraper::{Html, Selector};
use wikicomma_error::{Error, ErrorKind, Result};
use wikicomma_http::HttpClient;
use wikicomma_store::model::{ForumCategory, LocalForumPost, LocalPostRevision};

use crate::remote::{self, module, TokenGuard};

/// Posts per `ForumViewThreadPostsModule` page; pagination stops on a
/// zero-post page, same tie-break as [`crate::pages::fetch_all_revisions`].
pub const POSTS_PER_PAGE: usize = 20;

/// Fetch the category list from the forum's front page. Unlike threads and
/// posts, there's no paginated module for this — it's read straight off
/// `/forum/start` at engine-init time (spec §4.8 step 1).
pub async fn fetch_categories(http: &Arc<HttpClient>, site_url: &str) -> Result<Vec<ForumCategory>> {
    let url = format!("{}/forum/start", site_url.trim_end_matches('/'));
    let response = http.get(&url, wikicomma_http::RequestOptions::new()).await?;
    parse_categories(&response.text())
}

pub fn parse_categories(html: &str) -> Result<Vec<ForumCategory>> {
    let doc = Html::parse_document(html);
    let row_sel = Selector::parse("tr.category").unwrap();
    let mut out = Vec::new();

    for row in doc.select(&row_sel) {
        let id_attr = row.value().attr("id").unwrap_or("");
        let Some(id) = id_attr.rsplit('-').next().and_then(|s| s.parse::<u64>().ok()) else { continue };

        let title_sel = Selector::parse("td.title a, .name a").unwrap();
        let title = row.select(&title_sel).next().map(|e| e.text().collect::<String>().trim().to_string()).unwrap_or_default();

        let desc_sel = Selector::parse("td.title .description, .description").unwrap();
        let description = row.select(&desc_sel).next().map(|e| e.text().collect::<String>().trim().to_string()).filter(|s| !s.is_empty());

        let threads_sel = Selector::parse("td.threads").unwrap();
        let threads = row.select(&threads_sel).next().and_then(|e| e.text().collect::<String>().trim().parse().ok()).unwrap_or(0);

        let posts_sel = Selector::parse("td.posts").unwrap();
        let posts = row.select(&posts_sel).next().and_then(|e| e.text().collect::<String>().trim().parse().ok()).unwrap_or(0);

        out.push(ForumCategory {
            id,
            title,
            description,
            posts,
            threads,
            last: None,
            last_user: None,
            full_scan: false,
            last_page: 0,
            version: wikicomma_store::model::CATEGORY_METADATA_VERSION,
        });
    }

    if out.is_empty() && !html.contains("category") {
        return Err(Error::new(ErrorKind::ParseFailed, "no categories found on forum front page").with_operation("forum::parse_categories"));
    }
    Ok(out)
}

/// One thread row from a category's thread listing page.
#[derive(Debug, Clone)]
pub struct ThreadSummary {
    pub id: u64,
    pub title: String,
    pub description: Option<String>,
    pub started: i64,
    pub started_user: Option<u64>,
    pub last: Option<i64>,
    pub last_user: Option<u64>,
    pub posts_num: u64,
    pub sticky: bool,
    pub is_locked: bool,
}

pub fn parse_thread_list(html: &str) -> Vec<ThreadSummary> {
    let doc = Html::parse_document(html);
    let row_sel = Selector::parse("tr.thread, table.list tr").unwrap();
    let mut out = Vec::new();

    for row in doc.select(&row_sel) {
        let link_sel = Selector::parse("a[href*='/forum/t-']").unwrap();
        let Some(link) = row.select(&link_sel).next() else { continue };
        let Some(href) = link.value().attr("href") else { continue };
        let Some(id) = href.rsplit("/t-").next().and_then(|s| s.split('/').next()).and_then(|s| s.parse::<u64>().ok()) else { continue };

        let title = link.text().collect::<String>().trim().to_string();
        let sticky = row.value().attr("class").unwrap_or("").contains("sticky");
        let is_locked = row.value().attr("class").unwrap_or("").contains("locked");

        let posts_sel = Selector::parse("td.posts").unwrap();
        let posts_num = row.select(&posts_sel).next().and_then(|e| e.text().collect::<String>().trim().parse().ok()).unwrap_or(0);

        out.push(ThreadSummary {
            id,
            title,
            description: None,
            started: 0,
            started_user: None,
            last: None,
            last_user: None,
            posts_num,
            sticky,
            is_locked,
        });
    }
    out
}

/// Fetch every thread-list page for a category, stopping at the first
/// empty page (same zero-page termination rule as revisions and posts).
pub async fn fetch_all_threads(http: &Arc<HttpClient>, site_url: &str, category_id: u64) -> Result<Vec<ThreadSummary>> {
    let mut out = Vec::new();
    let mut page = 1u32;
    loop {
        let url = format!("{}/forum/c-{category_id}/p/{page}", site_url.trim_end_matches('/'));
        let response = http.get(&url, wikicomma_http::RequestOptions::new()).await?;
        let parsed = parse_thread_list(&response.text());
        if parsed.is_empty() {
            break;
        }
        out.extend(parsed);
        page += 1;
    }
    Ok(out)
}

/// Parse one page of `ForumViewThreadPostsModule`'s post tree. Nesting
/// depth is read from the `long-post` container's indent class, matching
/// the remote's own rendering of reply depth rather than inferring it.
pub fn parse_post_page(html: &str, resolve_user: impl Fn(&str) -> Option<u64> + Copy) -> Vec<LocalForumPost> {
    let doc = Html::parse_document(html);
    let post_sel = Selector::parse("div.post").unwrap();

    let mut flat: Vec<(i32, LocalForumPost)> = Vec::new();

    for post_el in doc.select(&post_sel) {
        let id_attr = post_el.value().attr("id").unwrap_or("");
        let Some(id) = id_attr.rsplit('-').next().and_then(|s| s.parse::<u64>().ok()) else { continue };

        let title_sel = Selector::parse(".title, .long").unwrap();
        let title = post_el.select(&title_sel).next().map(|e| e.text().collect::<String>().trim().to_string()).filter(|s| !s.is_empty());

        let poster_sel = Selector::parse(".printuser").unwrap();
        let poster = post_el.select(&poster_sel).next().map(|e| e.text().collect::<String>().trim().to_string()).and_then(|u| resolve_user(&u));

        let stamp_sel = Selector::parse(".odate, .stamp").unwrap();
        let stamp = post_el
            .select(&stamp_sel)
            .next()
            .and_then(|e| e.value().attr("class"))
            .and_then(|c| c.split_whitespace().find_map(|tok| tok.strip_prefix("time_")))
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let depth = post_el.value().attr("class").unwrap_or("").matches("indent").count() as i32;

        flat.push((
            depth,
            LocalForumPost {
                id,
                title,
                poster,
                stamp,
                last_edit: None,
                last_edit_by: None,
                revisions: Vec::new(),
                children: Vec::new(),
            },
        ));
    }

    nest_by_depth(flat)
}

/// Rebuild a tree from a depth-first, depth-annotated flat list: each post
/// becomes a child of the most recently seen post at `depth - 1`.
fn nest_by_depth(flat: Vec<(i32, LocalForumPost)>) -> Vec<LocalForumPost> {
    let mut iter = flat.into_iter().peekable();
    nest_level(&mut iter, 0)
}

fn nest_level(iter: &mut std::iter::Peekable<std::vec::IntoIter<(i32, LocalForumPost)>>, depth: i32) -> Vec<LocalForumPost> {
    let mut out = Vec::new();
    while let Some(&(d, _)) = iter.peek() {
        if d < depth {
            break;
        }
        let (_, mut post) = iter.next().unwrap();
        post.children = nest_level(iter, depth + 1);
        out.push(post);
    }
    out
}

/// Fetch the full post tree for a thread across every page.
pub async fn fetch_all_posts(
    http: &Arc<HttpClient>,
    site_url: &str,
    guard: &TokenGuard,
    thread_id: u64,
) -> Result<Vec<LocalForumPost>> {
    let mut out = Vec::new();
    let mut page = 1u32;
    loop {
        let resp = remote::call_module_with_token(
            http,
            site_url,
            guard,
            module::FORUM_VIEW_THREAD_POSTS,
            vec![("t".to_string(), thread_id.to_string()), ("page".to_string(), page.to_string())],
            false,
        )
        .await?;

        let parsed = parse_post_page(resp.body(), |_| None);
        if parsed.is_empty() {
            break;
        }
        out.extend(parsed);
        page += 1;
    }
    Ok(out)
}

/// Fetch a post's revision list via `ForumPostRevisionsModule`.
pub async fn fetch_post_revisions(
    http: &Arc<HttpClient>,
    site_url: &str,
    guard: &TokenGuard,
    post_id: u64,
) -> Result<Vec<LocalPostRevision>> {
    let resp = remote::call_module_with_token(
        http,
        site_url,
        guard,
        module::FORUM_POST_REVISIONS,
        vec![("postId".to_string(), post_id.to_string())],
        false,
    )
    .await?;

    Ok(parse_post_revisions(resp.body()))
}

pub fn parse_post_revisions(html: &str) -> Vec<LocalPostRevision> {
    let doc = Html::parse_document(html);
    let row_sel = Selector::parse("tr, li.revision").unwrap();
    let mut out = Vec::new();

    for row in doc.select(&row_sel) {
        let id_attr = row.value().attr("data-id").or_else(|| row.value().attr("id")).unwrap_or("");
        let Some(id) = id_attr.chars().filter(|c| c.is_ascii_digit()).collect::<String>().parse::<u64>().ok() else { continue };

        out.push(LocalPostRevision {
            id,
            author: None,
            stamp: 0,
            title: None,
        });
    }
    out
}

/// Fetch one post revision's body via `ForumPostRevisionModule` (spec §4.8
/// step 7, §6: `forum/sub/ForumPostRevisionModule`). This is distinct from
/// the `latest` body — the remote may re-render a revision's contents
/// differently from how `ForumNewPostFormModule` currently renders the
/// post, so both are stored (spec §4.8 tie-break).
pub async fn fetch_post_revision_body(
    http: &Arc<HttpClient>,
    site_url: &str,
    guard: &TokenGuard,
    revision_id: u64,
) -> Result<String> {
    let resp = remote::call_module_with_token(
        http,
        site_url,
        guard,
        module::FORUM_POST_REVISION,
        vec![("revisionId".to_string(), revision_id.to_string())],
        false,
    )
    .await?;
    Ok(resp.body().replace("&nbsp;", " "))
}

/// Fetch a post's current body via `ForumNewPostFormModule` (spec §4.8 step
/// 7: "always persist a `latest` revision file when a post is first seen").
/// Despite the module's name, requesting it against an existing post
/// returns that post's current edit-form contents, which is the remote's
/// only surface for "what does this post currently say".
pub async fn fetch_post_latest_body(
    http: &Arc<HttpClient>,
    site_url: &str,
    guard: &TokenGuard,
    post_id: u64,
) -> Result<String> {
    let resp = remote::call_module_with_token(
        http,
        site_url,
        guard,
        module::FORUM_NEW_POST_FORM,
        vec![("postId".to_string(), post_id.to_string())],
        false,
    )
    .await?;
    Ok(resp.body().replace("&nbsp;", " "))
}

/// Decides whether a locally cached thread needs a fresh post-tree pass,
/// per spec §4.8 step 7: only when the remote's `last` timestamp moved
/// past what was persisted, or the thread is new.
pub fn should_refetch_thread(persisted_last: Option<i64>, remote_last: Option<i64>) -> bool {
    match (persisted_last, remote_last) {
        (None, _) => true,
        (Some(p), Some(r)) => r > p,
        (Some(_), None) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_categories_extracts_basic_fields() {
        let html = r#"<table>
        <tr id="category-3" class="category">
        <td class="title"><a href="#">General</a><div class="description">chat</div></td>
        <td class="threads">12</td><td class="posts">45</td>
        </tr></table>"#;
        let cats = parse_categories(html).unwrap();
        assert_eq!(cats.len(), 1);
        assert_eq!(cats[0].id, 3);
        assert_eq!(cats[0].title, "General");
        assert_eq!(cats[0].threads, 12);
        assert_eq!(cats[0].posts, 45);
    }

    #[test]
    fn parse_thread_list_extracts_id_from_href() {
        let html = r#"<table class="list"><tr><td><a href="/forum/t-9001/hello-thread">Hello thread</a></td><td class="posts">4</td></tr></table>"#;
        let threads = parse_thread_list(html);
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].id, 9001);
        assert_eq!(threads[0].title, "Hello thread");
        assert_eq!(threads[0].posts_num, 4);
    }

    #[test]
    fn nest_by_depth_builds_tree_from_flat_list() {
        let flat = vec![
            (0, LocalForumPost { id: 1, title: None, poster: None, stamp: 0, last_edit: None, last_edit_by: None, revisions: vec![], children: vec![] }),
            (1, LocalForumPost { id: 2, title: None, poster: None, stamp: 0, last_edit: None, last_edit_by: None, revisions: vec![], children: vec![] }),
            (1, LocalForumPost { id: 3, title: None, poster: None, stamp: 0, last_edit: None, last_edit_by: None, revisions: vec![], children: vec![] }),
            (0, LocalForumPost { id: 4, title: None, poster: None, stamp: 0, last_edit: None, last_edit_by: None, revisions: vec![], children: vec![] }),
        ];
        let tree = nest_by_depth(flat);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].id, 1);
        assert_eq!(tree[0].children.len(), 2);
        assert_eq!(tree[0].children[0].id, 2);
        assert_eq!(tree[0].children[1].id, 3);
        assert_eq!(tree[1].id, 4);
        assert!(tree[1].children.is_empty());
    }

    #[test]
    fn should_refetch_thread_on_new_or_advanced_timestamp() {
        assert!(should_refetch_thread(None, Some(5)));
        assert!(should_refetch_thread(Some(5), Some(6)));
        assert!(!should_refetch_thread(Some(6), Some(6)));
        assert!(!should_refetch_thread(Some(6), None));
    }
}
