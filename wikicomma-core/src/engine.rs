//! # Site engine
//!
//! The crawl state machine for one wiki (spec §4.8). Owns the site's
//! [`SiteStore`], [`HttpClient`], and [`UserResolver`], and drives the ten
//! steps of a single run: init, page-id-map rebuild, sitemap fetch,
//! deletions, per-page scan, revision bodies, forums, postponed files,
//! postponed revisions, and a final compaction sweep.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use wikicomma_error::{Error, ErrorKind, Result};
use wikicomma_http::{CookieJar, HttpClient, ProxyConfig, RateLimiter, RequestOptions};
use wikicomma_store::archive::{AddOptions, ArchiveAdapter};
use wikicomma_store::model::{FileMapEntry, ForumThread, LocalForumPost, PageMeta};
use wikicomma_store::naming;
use wikicomma_store::store::SiteStore;
use wikicomma_store::users::UserResolver;

use crate::forum;
use crate::pages;
use crate::pool::{JobQueue, WorkerPool};
use crate::remote::{self, TokenGuard};
use crate::sitemap;
use crate::telemetry::{Event, ProgressStatus, Sink};

/// Transient-fault retry budget and sleep (spec §4.8/§7).
const RETRY_ATTEMPTS: usize = 3;
const RETRY_DELAY: Duration = Duration::from_secs(5);
/// Revisions fetched concurrently per page (spec §4.8 step 6).
const REVISION_FETCH_CONCURRENCY: usize = 8;
/// Namespaces treated as predicted-ephemeral: repeated failures there drop
/// the item from PendingRevisions rather than retry forever (spec §4.8 step 9).
const EPHEMERAL_NAMESPACES: [&str; 2] = ["nav:", "tech:"];

/// Retry `f` up to `attempts` times with a fixed delay between attempts,
/// stopping early on a non-retryable error (spec §4.8: "wrapped in up to 3
/// retries").
async fn retry<T, F, Fut>(attempts: usize, delay: Duration, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err: Option<Error> = None;
    for attempt in 0..attempts {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt + 1 < attempts && e.kind().is_retryable() => {
                tracing::warn!(attempt, error = %e, "retrying after transient error");
                tokio::time::sleep(delay).await;
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| Error::new(ErrorKind::GivingUp, "retry budget exhausted with no recorded error")))
}

/// Everything a [`SiteEngine`] needs that the top-level process runner
/// reads out of configuration (spec §6).
#[derive(Debug, Clone)]
pub struct SiteEngineConfig {
    pub name: String,
    pub url: String,
    pub blacklist: Vec<String>,
    pub slot_count: usize,
    pub ratelimit_bucket_size: Option<u32>,
    pub ratelimit_refill_seconds: Option<u64>,
    pub delay_ms: u64,
    pub maximum_jobs: Option<usize>,
    pub http_proxy: Option<(String, u16)>,
    pub socks_proxy: Option<(String, u16)>,
    pub user_list_cache_freshness_secs: u64,
}

impl Default for SiteEngineConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            url: String::new(),
            blacklist: Vec::new(),
            slot_count: 4,
            ratelimit_bucket_size: None,
            ratelimit_refill_seconds: None,
            delay_ms: 0,
            maximum_jobs: None,
            http_proxy: None,
            socks_proxy: None,
            user_list_cache_freshness_secs: 86_400,
        }
    }
}

/// Owns one wiki's durable state and drives one run of the state machine.
pub struct SiteEngine {
    config: SiteEngineConfig,
    http: Arc<HttpClient>,
    store: Arc<SiteStore>,
    users: Arc<UserResolver>,
    archive: ArchiveAdapter,
    telemetry: Sink,
}

impl SiteEngine {
    pub fn new(config: SiteEngineConfig, base_directory: impl AsRef<Path>, telemetry: Sink) -> Result<Self> {
        let ratelimit = match (config.ratelimit_bucket_size, config.ratelimit_refill_seconds) {
            (Some(capacity), Some(refill)) => RateLimiter::new(capacity, Duration::from_secs(refill)),
            _ => RateLimiter::unlimited(),
        };
        ratelimit.start();

        let proxy = ProxyConfig {
            http_proxy: config.http_proxy.clone(),
            socks_proxy: config.socks_proxy.clone(),
        };
        let http = Arc::new(HttpClient::new(config.slot_count, ratelimit, proxy)?);

        let root = base_directory.as_ref().join(&config.name);
        let store = Arc::new(SiteStore::new(root.clone()));
        let users = Arc::new(UserResolver::new(
            root.join("_users"),
            Arc::clone(&http),
            Duration::from_secs(config.user_list_cache_freshness_secs),
        ));

        Ok(Self {
            config,
            http,
            store,
            users,
            archive: ArchiveAdapter::default(),
            telemetry,
        })
    }

    /// Run one full pass of the state machine. `sitemap_lock` is shared
    /// across every site's engine so step 3's burst never overlaps with
    /// another site's (spec §5).
    pub async fn run(&self, sitemap_lock: Arc<AsyncMutex<()>>) -> Result<()> {
        self.telemetry.emit(Event::Handshake);

        // --- step 1: init --------------------------------------------
        self.load_cookies().await;
        let guard = Arc::new(TokenGuard::new(self.init_token().await?));
        self.users.init().await?;

        // --- step 2: page-id-map rebuild ------------------------------
        let empty_map = self.store.page_id_map.read(|m| m.pages.is_empty()).await;
        if empty_map {
            let rebuilt = self.store.scan_existing_pages().await?;
            self.store
                .page_id_map
                .modify(|m| {
                    for (name, id) in rebuilt {
                        m.pages.insert(id, name);
                    }
                })
                .await;
        }

        // --- step 3: sitemap fetch ------------------------------------
        self.telemetry.emit(Event::Progress {
            status: ProgressStatus::BuildingSitemap,
            done: None,
            postponed: None,
        });
        let new_entries = {
            let _held = sitemap_lock.lock().await;
            sitemap::fetch_sitemap(&self.http, &self.config.url, &self.config.blacklist).await?
        };
        let old_snapshot = self.store.sitemap.read(|m| m.clone()).await;
        let diff = sitemap::diff(&new_entries, &old_snapshot);

        self.telemetry.emit(Event::Preflight {
            total: diff.dirty.len() as u64,
        });

        // --- step 4: deletions -----------------------------------------
        for name in &diff.removed {
            self.store.remove_page(name).await?;
            let page_id = self.store.page_id_map.read(|m| m.pages.iter().find(|(_, n)| *n == name).map(|(id, _)| *id)).await;
            let _ = &page_id;
            if let Some(id) = page_id {
                self.store.page_id_map.modify(|m| m.pages.remove(&id)).await;
            }
        }

        // --- step 5+6: per-page scan and revision bodies ---------------
        self.telemetry.emit(Event::Progress {
            status: ProgressStatus::PagesMain,
            done: Some(0),
            postponed: None,
        });
        let queue = JobQueue::new();
        let pool = WorkerPool::new(Duration::from_millis(self.config.delay_ms), self.config.maximum_jobs);
        let total_dirty = diff.dirty.len();
        for (name, lastmod) in diff.dirty {
            let this = self.self_arc_parts();
            let guard = Arc::clone(&guard);
            queue.push(async move {
                if let Err(e) = scan_one_page(&this, &guard, &name, lastmod).await {
                    tracing::warn!(page = %name, error = %e, "page scan failed, queued for retry");
                }
            });
        }
        pool.run(queue, total_dirty.max(1)).await;

        self.store.sitemap.modify(|m| *m = diff.new_snapshot).await;
        self.store.sitemap.sync().await?;

        // --- step 7: forums ---------------------------------------------
        self.telemetry.emit(Event::Progress {
            status: ProgressStatus::ForumsMain,
            done: None,
            postponed: None,
        });
        self.scan_forums(&guard).await;

        // --- step 8: postponed files -------------------------------------
        self.telemetry.emit(Event::Progress {
            status: ProgressStatus::FilesPending,
            done: None,
            postponed: None,
        });
        self.drain_pending_files().await?;

        // --- step 9: postponed revisions -----------------------------------
        self.telemetry.emit(Event::Progress {
            status: ProgressStatus::PagesPending,
            done: None,
            postponed: None,
        });
        self.drain_pending_revisions(&guard).await?;

        // --- step 10: full compaction sweep ----------------------------
        self.telemetry.emit(Event::Progress {
            status: ProgressStatus::Compressing,
            done: None,
            postponed: None,
        });
        self.compact_all().await?;

        self.store.flush_all().await?;
        self.telemetry.emit(Event::FinishSuccess);
        Ok(())
    }

    /// A cheap bundle of `Arc`-cloned handles, so page/forum jobs spawned
    /// onto the worker pool don't need a lifetime back to `&self`.
    fn self_arc_parts(&self) -> EngineHandles {
        EngineHandles {
            http: Arc::clone(&self.http),
            store: Arc::clone(&self.store),
            users: Arc::clone(&self.users),
            archive: ArchiveAdapter::default(),
            telemetry: self.telemetry.clone(),
            site_url: self.config.url.clone(),
        }
    }

    async fn load_cookies(&self) {
        let path = self.store.cookie_store_path();
        if let Ok(bytes) = tokio::fs::read(&path).await {
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) {
                let jar = CookieJar::from_json(&value);
                self.http.cookies.load(jar.snapshot());
            }
        }
    }

    async fn save_cookies(&self) -> Result<()> {
        let path = self.store.cookie_store_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = self.http.cookies.to_json();
        tokio::fs::write(&path, serde_json::to_vec_pretty(&json)?).await?;
        Ok(())
    }

    async fn init_token(&self) -> Result<String> {
        if let Some(cookie) = self.http.cookies.find("wikidot_token7") {
            return Ok(cookie.value);
        }
        let token = remote::fetch_token(&self.http, &self.config.url).await?;
        self.save_cookies().await?;
        Ok(token)
    }

    async fn scan_forums(&self, guard: &Arc<TokenGuard>) {
        let categories = match forum::fetch_categories(&self.http, &self.config.url).await {
            Ok(cats) => cats,
            Err(e) => {
                self.telemetry.emit(Event::error_nonfatal(ErrorKind::ForumListFetch, None, e.to_string()));
                Vec::new()
            }
        };

        for summary in categories {
            let doc = self.store.category_document(summary.id);
            let skip = doc
                .read(|c| c.full_scan && c.version == wikicomma_store::model::CATEGORY_METADATA_VERSION && c.last == summary.last)
                .await;
            if skip {
                continue;
            }

            let threads = match forum::fetch_all_threads(&self.http, &self.config.url, summary.id).await {
                Ok(t) => t,
                Err(e) => {
                    self.telemetry.emit(Event::error_nonfatal(ErrorKind::ForumListFetch, Some(summary.title.clone()), e.to_string()));
                    continue;
                }
            };

            for thread_summary in &threads {
                let thread_doc = self.store.thread_document(summary.id, thread_summary.id);
                let persisted_last = thread_doc.read(|t| t.last).await;
                let persisted_count = thread_doc.read(|t| t.persisted_post_count() as u64).await;
                let is_stale = thread_doc.read(|t| t.is_stale()).await;
                let count_mismatch = persisted_count != thread_summary.posts_num;
                let should_fetch = forum::should_refetch_thread(persisted_last, thread_summary.last) || count_mismatch || is_stale;
                if !should_fetch {
                    continue;
                }

                if count_mismatch {
                    self.telemetry
                        .emit(Event::error_nonfatal(ErrorKind::ForumCountMismatch, Some(thread_summary.title.clone()), "persisted post count disagreed with remote"));
                }

                match self.scan_thread(guard, summary.id, thread_summary).await {
                    Ok(wrote_new) => {
                        if wrote_new {
                            let archive_path = self.store.thread_archive_path(summary.id, thread_summary.id);
                            let raw_dir = self.store.thread_raw_dir(summary.id, thread_summary.id);
                            let _ = compact_dir(&self.archive, &raw_dir, &archive_path).await;
                        }
                    }
                    Err(e) => {
                        self.telemetry.emit(Event::error_nonfatal(ErrorKind::ForumPostFetch, Some(thread_summary.title.clone()), e.to_string()));
                    }
                }
            }

            doc.modify(|c| {
                c.full_scan = true;
                c.last = summary.last;
                c.last_user = summary.last_user;
                c.version = wikicomma_store::model::CATEGORY_METADATA_VERSION;
            })
            .await;
            doc.sync().await.ok();
        }
    }

    /// Fetch every post (and new revisions) for one thread. Returns
    /// whether any new revision/latest body was written to disk, so the
    /// caller knows whether to compact (spec §4.8 step 7).
    async fn scan_thread(&self, guard: &Arc<TokenGuard>, category_id: u64, summary: &forum::ThreadSummary) -> Result<bool> {
        let posts = forum::fetch_all_posts(&self.http, &self.config.url, guard, summary.id).await?;

        let mut wrote_any = false;
        let raw_dir = self.store.thread_raw_dir(category_id, summary.id);
        for post in posts.iter().flat_map(LocalForumPost::flatten) {
            if post.last_edit.is_some() {
                if let Ok(revisions) = forum::fetch_post_revisions(&self.http, &self.config.url, guard, post.id).await {
                    for rev in &revisions {
                        let path = raw_dir.join(post.id.to_string()).join(format!("{}.html", rev.id));
                        if path.exists() {
                            continue;
                        }
                        match forum::fetch_post_revision_body(&self.http, &self.config.url, guard, rev.id).await {
                            Ok(body) => {
                                if let Some(parent) = path.parent() {
                                    tokio::fs::create_dir_all(parent).await.ok();
                                }
                                if tokio::fs::write(&path, body.as_bytes()).await.is_ok() {
                                    wrote_any = true;
                                }
                            }
                            Err(e) => {
                                self.telemetry.emit(Event::error_nonfatal(ErrorKind::ForumPostFetch, Some(summary.title.clone()), e.to_string()));
                            }
                        }
                    }
                }
            }

            let latest_path = raw_dir.join(post.id.to_string()).join("latest.html");
            if !latest_path.exists() {
                match forum::fetch_post_latest_body(&self.http, &self.config.url, guard, post.id).await {
                    Ok(body) => {
                        if let Some(parent) = latest_path.parent() {
                            tokio::fs::create_dir_all(parent).await.ok();
                        }
                        if tokio::fs::write(&latest_path, body.as_bytes()).await.is_ok() {
                            wrote_any = true;
                        }
                    }
                    Err(e) => {
                        self.telemetry.emit(Event::error_nonfatal(ErrorKind::ForumPostFetch, Some(summary.title.clone()), e.to_string()));
                    }
                }
            }
        }

        let thread_doc = self.store.thread_document(category_id, summary.id);
        thread_doc
            .modify(|t: &mut ForumThread| {
                t.id = summary.id;
                t.title = summary.title.clone();
                t.description = summary.description.clone();
                t.started = summary.started;
                t.started_user = summary.started_user;
                t.last = summary.last;
                t.last_user = summary.last_user;
                t.posts_num = summary.posts_num;
                t.sticky = summary.sticky;
                t.is_locked = summary.is_locked;
                t.version = wikicomma_store::model::THREAD_METADATA_VERSION;
                t.posts = posts;
            })
            .await;
        thread_doc.sync().await?;

        Ok(wrote_any)
    }

    async fn drain_pending_files(&self) -> Result<()> {
        let pending = self.store.pending_files.read(|p| p.files.clone()).await;
        for file_id in pending {
            let has_map_entry = self.store.file_map.read(|m| m.files.contains_key(&file_id)).await;
            if !has_map_entry {
                // Without the owning page's url we cannot re-derive a file
                // map entry here; leave it pending for a run where the
                // owning page is rescanned and repopulates FileMap.
                continue;
            }

            let entry = self.store.file_map.read(|m| m.files.get(&file_id).cloned()).await;
            let Some(entry) = entry else { continue };
            match self.fetch_file_bytes(&entry).await {
                Ok(()) => {
                    self.store.pending_files.modify(|p| p.files.retain(|id| *id != file_id)).await;
                }
                Err(e) => {
                    self.telemetry.emit(Event::error_nonfatal(ErrorKind::FileFetch, None, e.to_string()));
                }
            }
        }
        self.store.pending_files.sync().await?;
        Ok(())
    }

    async fn fetch_file_bytes(&self, entry: &FileMapEntry) -> Result<()> {
        let response = self.http.get(&entry.url, RequestOptions::new()).await?;
        let path = self.store.root().join(&entry.relative_path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &response.body).await?;
        Ok(())
    }

    async fn drain_pending_revisions(&self, guard: &Arc<TokenGuard>) -> Result<()> {
        let pending = self.store.pending_revisions.read(|p| p.revisions.clone()).await;
        for (global_revision, page_id) in pending {
            let name = self.store.page_id_map.read(|m| m.pages.get(&page_id).cloned()).await;
            let Some(name) = name else { continue };

            if EPHEMERAL_NAMESPACES.iter().any(|ns| name.starts_with(ns)) {
                self.store.pending_revisions.modify(|p| p.revisions.remove(&global_revision)).await;
                continue;
            }

            match pages::fetch_revision_source(&self.http, &self.config.url, guard, global_revision).await {
                Ok(source) => {
                    let dir = self.store.page_raw_revisions_dir(&name);
                    tokio::fs::create_dir_all(&dir).await?;
                    tokio::fs::write(dir.join(format!("{global_revision}.txt")), source.as_bytes()).await?;
                    self.store.pending_revisions.modify(|p| p.revisions.remove(&global_revision)).await;
                }
                Err(e) => {
                    self.telemetry.emit(Event::error_nonfatal(ErrorKind::GivingUp, Some(name), e.to_string()));
                }
            }
        }
        self.store.pending_revisions.sync().await?;
        Ok(())
    }

    /// Compact every page and thread folder still holding raw, uncompacted
    /// files (spec §4.8 step 10).
    async fn compact_all(&self) -> Result<()> {
        let pages_root = self.store.root().join("pages");
        compact_tree_of_page_folders(&self.archive, &pages_root).await;

        let forum_root = self.store.root().join("forum");
        compact_tree_of_thread_folders(&self.archive, &forum_root).await;
        Ok(())
    }
}

/// Per-job handles cloned out of `SiteEngine` so worker-pool jobs own
/// their dependencies instead of borrowing `&self` across an `.await`.
struct EngineHandles {
    http: Arc<HttpClient>,
    store: Arc<SiteStore>,
    users: Arc<UserResolver>,
    archive: ArchiveAdapter,
    telemetry: Sink,
    site_url: String,
}

/// Spec §4.8 step 5: fetch everything about one dirty page and persist it,
/// then (step 6) fetch any newly discovered revision bodies.
async fn scan_one_page(engine: &EngineHandles, guard: &Arc<TokenGuard>, name: &str, lastmod: Option<i64>) -> Result<()> {
    let doc = engine.store.page_document(name);

    let skip = doc.read(|m| m.sitemap_update == lastmod && !m.name.is_empty()).await && engine.store.page_meta_exists(name);
    if skip {
        return Ok(());
    }

    let now_ms = (std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_millis()) as i64;
    let info = match retry(RETRY_ATTEMPTS, RETRY_DELAY, || pages::fetch_page_info(&engine.http, &engine.site_url, name, now_ms)).await {
        Ok(info) => info,
        Err(e) => {
            engine.store.pending_pages.modify(|p| p.pages.push(name.to_string())).await;
            engine.telemetry.emit(Event::PagePostponed);
            return Err(e);
        }
    };

    let prior_id = doc.read(|m| if m.name.is_empty() { None } else { Some(m.page_id) }).await;
    if let Some(prior_id) = prior_id {
        if prior_id != info.page_id {
            engine.store.remove_page(name).await?;
            engine.store.page_id_map.modify(|m| m.pages.remove(&prior_id)).await;
        }
    }

    let lock_status = retry(RETRY_ATTEMPTS, RETRY_DELAY, || pages::fetch_lock_status(&engine.http, &engine.site_url, guard, info.page_id))
        .await
        .ok();

    let voters_html = retry(RETRY_ATTEMPTS, RETRY_DELAY, || async {
        remote::call_module_with_token(&engine.http, &engine.site_url, guard, remote::module::WHO_RATED_PAGE, vec![("pageId".to_string(), info.page_id.to_string())], false).await
    })
    .await;
    let voters = match voters_html {
        Ok(resp) => pages::parse_voters(resp.body()),
        Err(e) => {
            engine.telemetry.emit(Event::error_nonfatal(ErrorKind::VoteFetch, Some(name.to_string()), e.to_string()));
            Vec::new()
        }
    };

    let files_html = retry(RETRY_ATTEMPTS, RETRY_DELAY, || async {
        remote::call_module_with_token(&engine.http, &engine.site_url, guard, remote::module::PAGE_FILES, vec![("pageId".to_string(), info.page_id.to_string())], false).await
    })
    .await;
    let mut files = match files_html {
        Ok(resp) => pages::parse_files(resp.body()),
        Err(e) => {
            engine.telemetry.emit(Event::error_nonfatal(ErrorKind::FileFetch, Some(name.to_string()), e.to_string()));
            Vec::new()
        }
    };

    for file in &mut files {
        match retry(RETRY_ATTEMPTS, RETRY_DELAY, || pages::fetch_file_info(&engine.http, &engine.site_url, guard, file.file_id)).await {
            Ok(info) => {
                file.size_bytes = info.size_bytes;
                file.mime = info.mime.clone();
                file.content_type = info.content_type.clone();
                file.stamp = info.stamp;
                file.internal_version = info.internal_version;
                file.author = match &info.author {
                    Some(u) => engine.users.resolve(None, u).await.ok().map(|user| user.user_id),
                    None => None,
                };
            }
            Err(e) => {
                engine.telemetry.emit(Event::error_nonfatal(ErrorKind::FileMetaFetch, Some(name.to_string()), e.to_string()));
            }
        }
    }

    for file in &files {
        engine
            .store
            .file_map
            .modify(|m| {
                m.files.insert(
                    file.file_id,
                    FileMapEntry {
                        url: file.url.clone(),
                        relative_path: format!("files/{}/{}", naming::normalize(name), file.file_id),
                    },
                );
            })
            .await;
    }

    let local_max = doc.read(|m| m.local_max_revision()).await;
    let new_revisions = match local_max {
        None => pages::fetch_all_revisions(&engine.http, &engine.site_url, guard, info.page_id).await,
        Some(max) => pages::fetch_new_revisions(&engine.http, &engine.site_url, guard, info.page_id, max).await,
    };
    let new_revisions = new_revisions.unwrap_or_default();

    let resolved_voters = resolve_voters(&engine.users, &voters).await;

    doc.modify(|m: &mut PageMeta| {
        if m.name.is_empty() {
            *m = PageMeta::new(name, info.page_id);
        }
        m.page_id = info.page_id;
        m.rating = info.rating;
        m.tags = info.tags.clone();
        m.title = info.title.clone();
        m.parent = info.parent.clone();
        m.forum_thread = info.forum_thread;
        m.is_locked = lock_status;
        m.sitemap_update = lastmod;
        m.votings = resolved_voters;
        m.files = files;
        for rev in new_revisions.iter().rev() {
            m.revisions.insert(0, rev.clone());
        }
    })
    .await;
    doc.sync().await?;

    engine.store.page_id_map.modify(|m| m.pages.insert(info.page_id, name.to_string())).await;

    if !new_revisions.is_empty() {
        fetch_revision_bodies(engine, guard, name, &new_revisions).await;
        let archive_path = engine.store.page_archive_path(name);
        let raw_dir = engine.store.page_raw_revisions_dir(name);
        let _ = compact_dir(&engine.archive, &raw_dir, &archive_path).await;
    }

    engine.telemetry.emit(Event::PageDone);
    Ok(())
}

async fn resolve_voters(users: &Arc<UserResolver>, voters: &[(Option<String>, bool)]) -> Vec<wikicomma_store::model::Voting> {
    let mut out = Vec::with_capacity(voters.len());
    for (username, value) in voters {
        let user_id = match username {
            Some(u) => users.resolve(None, u).await.ok().map(|user| user.user_id),
            None => None,
        };
        out.push(wikicomma_store::model::Voting { user_id, value: *value });
    }
    out
}

/// Fetch revision bodies concurrently, bounded to
/// [`REVISION_FETCH_CONCURRENCY`] (spec §4.8 step 6). Failures go to
/// PendingRevisions instead of failing the whole page.
async fn fetch_revision_bodies(engine: &EngineHandles, guard: &Arc<TokenGuard>, name: &str, revisions: &[wikicomma_store::model::PageRevision]) {
    let dir = engine.store.page_raw_revisions_dir(name);
    if tokio::fs::create_dir_all(&dir).await.is_err() {
        return;
    }

    let sub_queue = JobQueue::new();
    for rev in revisions {
        let http = Arc::clone(&engine.http);
        let site_url = engine.site_url.clone();
        let guard = Arc::clone(guard);
        let dir = dir.clone();
        let store = Arc::clone(&engine.store);
        let page_id = engine.store.page_id_map.read(|m| m.pages.iter().find(|(_, n)| n.as_str() == name).map(|(id, _)| *id)).await;
        let global_revision = rev.global_revision;

        sub_queue.push(async move {
            match pages::fetch_revision_source(&http, &site_url, &guard, global_revision).await {
                Ok(source) => {
                    let _ = tokio::fs::write(dir.join(format!("{global_revision}.txt")), source.as_bytes()).await;
                }
                Err(_) => {
                    if let Some(page_id) = page_id {
                        store.pending_revisions.modify(|p| p.revisions.insert(global_revision, page_id)).await;
                    }
                }
            }
        });
    }

    let pool = WorkerPool::new(Duration::from_millis(0), Some(REVISION_FETCH_CONCURRENCY));
    pool.run(sub_queue, revisions.len().max(1)).await;
}

async fn compact_dir(archive: &ArchiveAdapter, dir: &Path, archive_path: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        files.push(entry.path());
    }
    if files.is_empty() {
        return Ok(());
    }

    archive.add(archive_path, &files, AddOptions { delete_originals: true }).await?;

    if tokio::fs::read_dir(dir).await.map(|mut d| d.next_entry()).is_ok() {
        let _ = tokio::fs::remove_dir(dir).await;
    }
    Ok(())
}

async fn compact_tree_of_page_folders(archive: &ArchiveAdapter, pages_root: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(pages_root).await else { return };
    let mut dirs = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    for dir in dirs {
        let archive_path = dir.with_extension("7z");
        let _ = compact_dir(archive, &dir, &archive_path).await;
    }
}

async fn compact_tree_of_thread_folders(archive: &ArchiveAdapter, forum_root: &Path) {
    let Ok(mut cat_entries) = tokio::fs::read_dir(forum_root).await else { return };
    let mut cat_dirs = Vec::new();
    while let Ok(Some(entry)) = cat_entries.next_entry().await {
        if entry.path().is_dir() {
            cat_dirs.push(entry.path());
        }
    }
    for cat_dir in cat_dirs {
        let Ok(mut thread_entries) = tokio::fs::read_dir(&cat_dir).await else { continue };
        let mut thread_dirs = Vec::new();
        while let Ok(Some(entry)) = thread_entries.next_entry().await {
            if entry.path().is_dir() {
                thread_dirs.push(entry.path());
            }
        }
        for dir in thread_dirs {
            let archive_path = dir.with_extension("7z");
            let _ = compact_dir(archive, &dir, &archive_path).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_future_type_compiles_with_async_closure() {
        // Compile-time check that `retry`'s bounds accept a plain async
        // closure capturing no extra state.
        let _f = |attempts: usize| async move {
            retry::<(), _, _>(attempts, Duration::from_millis(0), || async { Ok(()) }).await
        };
    }
}
