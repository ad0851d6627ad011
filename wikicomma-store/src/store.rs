//! # Site store
//!
//! Owns every durable document for a single wiki: the sitemap snapshot,
//! per-page and per-thread/category metadata (each its own file, loaded
//! lazily and cached), the pending queues, and the id maps. Mirrors the
//! `Session`/`SessionManager` split in the teacher: an in-memory index
//! (the cache maps below) fronting content persisted to disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use wikicomma_error::{Error, Result};

use crate::document::Document;
use crate::model::{FileMap, ForumCategory, ForumThread, PageIdMap, PageMeta, PendingFiles, PendingPages, PendingRevisions, SiteMapEntry};
use crate::naming;

/// `meta/sitemap.json` — one mapping per site, name → last-modified.
pub type SiteMapDoc = HashMap<String, SiteMapEntry>;

/// Owns the on-disk layout for one wiki under `base_directory/<wiki>/`.
pub struct SiteStore {
    root: PathBuf,
    pub sitemap: Arc<Document<SiteMapDoc>>,
    pub pending_files: Arc<Document<PendingFiles>>,
    pub pending_pages: Arc<Document<PendingPages>>,
    pub pending_revisions: Arc<Document<PendingRevisions>>,
    pub file_map: Arc<Document<FileMap>>,
    pub page_id_map: Arc<Document<PageIdMap>>,
    pages: Mutex<HashMap<String, Arc<Document<PageMeta>>>>,
    categories: Mutex<HashMap<u64, Arc<Document<ForumCategory>>>>,
    threads: Mutex<HashMap<(u64, u64), Arc<Document<ForumThread>>>>,
}

impl SiteStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            sitemap: Document::new(root.join("meta/sitemap.json")),
            pending_files: Document::new(root.join("meta/pending_files.json")),
            pending_pages: Document::new(root.join("meta/pending_pages.json")),
            pending_revisions: Document::new(root.join("meta/pending_revisions.json")),
            file_map: Document::new(root.join("meta/file_map.json")),
            page_id_map: Document::new(root.join("meta/page_id_map.json")),
            pages: Mutex::new(HashMap::new()),
            categories: Mutex::new(HashMap::new()),
            threads: Mutex::new(HashMap::new()),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ---- paths -------------------------------------------------------

    pub fn page_meta_path(&self, name: &str) -> PathBuf {
        self.root.join("meta/pages").join(format!("{}.json", naming::normalize(name)))
    }

    pub fn page_raw_revisions_dir(&self, name: &str) -> PathBuf {
        self.root.join("pages").join(naming::normalize(name))
    }

    pub fn page_archive_path(&self, name: &str) -> PathBuf {
        self.root.join("pages").join(format!("{}.7z", naming::normalize(name)))
    }

    pub fn page_files_dir(&self, name: &str) -> PathBuf {
        self.root.join("files").join(naming::normalize(name))
    }

    pub fn category_meta_path(&self, id: u64) -> PathBuf {
        self.root.join("meta/forum/category").join(format!("{id}.json"))
    }

    pub fn thread_meta_path(&self, category_id: u64, thread_id: u64) -> PathBuf {
        self.root.join("meta/forum").join(category_id.to_string()).join(format!("{thread_id}.json"))
    }

    pub fn thread_raw_dir(&self, category_id: u64, thread_id: u64) -> PathBuf {
        self.root.join("forum").join(category_id.to_string()).join(thread_id.to_string())
    }

    pub fn thread_archive_path(&self, category_id: u64, thread_id: u64) -> PathBuf {
        self.root.join("forum").join(category_id.to_string()).join(format!("{thread_id}.7z"))
    }

    pub fn cookie_store_path(&self) -> PathBuf {
        self.root.join("http_cookies.json")
    }

    // ---- per-entity documents -----------------------------------------

    pub fn page_document(&self, name: &str) -> Arc<Document<PageMeta>> {
        let mut pages = self.pages.lock();
        pages
            .entry(name.to_string())
            .or_insert_with(|| Document::new(self.page_meta_path(name)))
            .clone()
    }

    pub fn category_document(&self, id: u64) -> Arc<Document<ForumCategory>> {
        let mut categories = self.categories.lock();
        categories
            .entry(id)
            .or_insert_with(|| Document::new(self.category_meta_path(id)))
            .clone()
    }

    pub fn thread_document(&self, category_id: u64, thread_id: u64) -> Arc<Document<ForumThread>> {
        let mut threads = self.threads.lock();
        threads
            .entry((category_id, thread_id))
            .or_insert_with(|| Document::new(self.thread_meta_path(category_id, thread_id)))
            .clone()
    }

    /// Forget cached page document handles no longer backed by a real page
    /// (spec §4.8 step 4: markPageRemoved also evicts the in-memory entry
    /// so a later fetch under the same name starts clean).
    pub fn forget_page(&self, name: &str) {
        self.pages.lock().remove(name);
    }

    /// Whether a page's metadata file currently exists on disk — used by
    /// the unchanged-page skip check (spec §4.8 step 5).
    pub fn page_meta_exists(&self, name: &str) -> bool {
        self.page_meta_path(name).exists()
    }

    /// Delete every on-disk trace of a page: metadata json, compacted
    /// archive, raw revision folder, and files folder. Filesystem errors
    /// are logged by the caller via `ErrorKind::FileUnlink`, not raised —
    /// spec §7 treats cleanup failures as non-fatal.
    pub async fn remove_page(&self, name: &str) -> Result<()> {
        self.forget_page(name);
        for path in [
            self.page_meta_path(name),
            self.page_archive_path(name),
        ] {
            remove_file_best_effort(&path).await;
        }
        for dir in [self.page_raw_revisions_dir(name), self.page_files_dir(name)] {
            remove_dir_best_effort(&dir).await;
        }
        Ok(())
    }

    pub async fn flush_all(&self) -> Result<()> {
        self.sitemap.sync().await?;
        self.pending_files.sync().await?;
        self.pending_pages.sync().await?;
        self.pending_revisions.sync().await?;
        self.file_map.sync().await?;
        self.page_id_map.sync().await?;
        for doc in self.pages.lock().values().cloned().collect::<Vec<_>>() {
            doc.sync().await?;
        }
        for doc in self.categories.lock().values().cloned().collect::<Vec<_>>() {
            doc.sync().await?;
        }
        for doc in self.threads.lock().values().cloned().collect::<Vec<_>>() {
            doc.sync().await?;
        }
        Ok(())
    }

    /// Every page name currently present in `meta/pages/`, by reading back
    /// the on-disk `page_id` of each file — used to rebuild `PageIdMap`
    /// when it's missing (spec §4.8 step 2).
    pub async fn scan_existing_pages(&self) -> Result<Vec<(String, u64)>> {
        let dir = self.root.join("meta/pages");
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(_) => return Ok(out),
        };
        while let Some(entry) = entries.next_entry().await.map_err(Error::from)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            if let Ok(meta) = serde_json::from_slice::<PageMeta>(&bytes) {
                out.push((meta.name.clone(), meta.page_id));
            }
        }
        Ok(out)
    }
}

async fn remove_file_best_effort(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), "failed to remove file: {e}");
        }
    }
}

async fn remove_dir_best_effort(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), "failed to remove directory: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn page_document_is_cached_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let store = SiteStore::new(dir.path());
        let d1 = store.page_document("hello");
        let d2 = store.page_document("hello");
        assert!(Arc::ptr_eq(&d1, &d2));
    }

    #[tokio::test]
    async fn remove_page_deletes_metadata_and_resets_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = SiteStore::new(dir.path());
        let doc = store.page_document("hello");
        doc.modify(|m| *m = PageMeta::new("hello", 42)).await;
        doc.sync().await.unwrap();
        assert!(store.page_meta_exists("hello"));

        store.remove_page("hello").await.unwrap();
        assert!(!store.page_meta_exists("hello"));

        let doc2 = store.page_document("hello");
        assert!(!Arc::ptr_eq(&doc, &doc2));
    }

    #[tokio::test]
    async fn name_with_colon_maps_to_safe_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = SiteStore::new(dir.path());
        let path = store.page_meta_path("fragment:scp-001");
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "fragment_scp-001.json");
    }
}
