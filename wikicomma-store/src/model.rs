//! # Persisted entities
//!
//! Every struct here is a `serde`-derived value stored somewhere under
//! `base_directory/<wiki>/` per spec §3/§6. Optional fields use
//! `skip_serializing_if` so re-serializing an entity that round-tripped
//! through disk stays byte-identical (spec §8 idempotence property),
//! matching the teacher's `ChatMessage` convention of keeping documents
//! minimal.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Bumped whenever an entity's on-disk schema changes incompatibly; a
/// stored document whose `version` is older than this is treated as
/// absent and the entity is fully refetched (spec §7 schema mismatch).
pub const PAGE_METADATA_VERSION: u32 = 1;
pub const THREAD_METADATA_VERSION: u32 = 1;
pub const CATEGORY_METADATA_VERSION: u32 = 1;

/// A single entry from `sitemap.xml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteMapEntry {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
}

/// One historical revision of a page's source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRevision {
    /// Per-page counter, strictly decreasing within `PageMeta::revisions`.
    pub revision: u64,
    /// Site-wide monotonically increasing id, unique across all pages.
    pub global_revision: u64,
    pub author: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commentary: Option<String>,
}

/// A file attached to a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    pub file_id: u64,
    pub name: String,
    pub url: String,
    /// Size as displayed by the remote (e.g. "1.2 MB")
    pub size: String,
    pub size_bytes: u64,
    pub mime: String,
    pub content_type: String,
    pub author: Option<u64>,
    pub stamp: i64,
    pub internal_version: u64,
}

/// A voting entry. `None` user id is preserved as-is (spec §9 open
/// question resolved: dropping anonymous votes would silently shrink the
/// rating tally on replay, so they are kept).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voting {
    pub user_id: Option<u64>,
    pub value: bool,
}

/// A wiki page's full metadata, including every known revision and file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageMeta {
    pub name: String,
    pub page_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<i64>,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forum_thread: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_locked: Option<bool>,
    /// The sitemap `lastmod` value observed the last time this page was
    /// fully scanned; used to skip unchanged pages (spec §4.8 step 5).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sitemap_update: Option<i64>,
    /// Ordered newest-first; `revision` strictly decreasing, no two
    /// entries share a `global_revision` (spec §3 invariant).
    #[serde(default)]
    pub revisions: Vec<PageRevision>,
    #[serde(default)]
    pub files: Vec<FileMeta>,
    #[serde(default)]
    pub votings: Vec<Voting>,
}

fn default_version() -> u32 {
    PAGE_METADATA_VERSION
}

impl PageMeta {
    pub fn new(name: impl Into<String>, page_id: u64) -> Self {
        Self {
            name: name.into(),
            page_id,
            rating: None,
            version: PAGE_METADATA_VERSION,
            forum_thread: None,
            tags: Vec::new(),
            title: None,
            parent: None,
            is_locked: None,
            sitemap_update: None,
            revisions: Vec::new(),
            files: Vec::new(),
            votings: Vec::new(),
        }
    }

    pub fn local_max_revision(&self) -> Option<u64> {
        self.revisions.iter().map(|r| r.revision).max()
    }

    /// Spec §3 invariant: `revision` strictly decreasing, `global_revision`
    /// unique across all entries.
    pub fn check_revision_invariant(&self) -> bool {
        let mut seen_global = std::collections::HashSet::new();
        let mut prev: Option<u64> = None;
        for rev in &self.revisions {
            if let Some(p) = prev {
                if rev.revision >= p {
                    return false;
                }
            }
            prev = Some(rev.revision);
            if !seen_global.insert(rev.global_revision) {
                return false;
            }
        }
        true
    }

    pub fn is_stale(&self) -> bool {
        self.version < PAGE_METADATA_VERSION
    }
}

/// A forum category mirrored locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForumCategory {
    pub id: u64,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub posts: u64,
    pub threads: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_user: Option<u64>,
    #[serde(default)]
    pub full_scan: bool,
    #[serde(default)]
    pub last_page: u32,
    #[serde(default = "default_category_version")]
    pub version: u32,
}

fn default_category_version() -> u32 {
    CATEGORY_METADATA_VERSION
}

impl ForumCategory {
    pub fn is_stale(&self) -> bool {
        self.version < CATEGORY_METADATA_VERSION
    }
}

/// One revision of a forum post's body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalPostRevision {
    pub id: u64,
    pub author: Option<u64>,
    pub stamp: i64,
    pub title: Option<String>,
}

/// A forum post, with its revisions and any nested replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalForumPost {
    pub id: u64,
    pub title: Option<String>,
    pub poster: Option<u64>,
    pub stamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_edit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_edit_by: Option<u64>,
    #[serde(default)]
    pub revisions: Vec<LocalPostRevision>,
    #[serde(default)]
    pub children: Vec<LocalForumPost>,
}

impl LocalForumPost {
    /// Flattens this post and its descendants depth-first, as the remote's
    /// tree-structured post listing is walked (spec §9: posts form a tree
    /// via `children`; represented here as plain nested records).
    pub fn flatten(&self) -> Vec<&LocalForumPost> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.flatten());
        }
        out
    }

    pub fn total_count(&self) -> usize {
        1 + self.children.iter().map(|c| c.total_count()).sum::<usize>()
    }
}

/// A forum thread mirrored locally, with its full post tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForumThread {
    pub id: u64,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub started: i64,
    pub started_user: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_user: Option<u64>,
    pub posts_num: u64,
    #[serde(default)]
    pub sticky: bool,
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default = "default_thread_version")]
    pub version: u32,
    #[serde(default)]
    pub posts: Vec<LocalForumPost>,
}

fn default_thread_version() -> u32 {
    THREAD_METADATA_VERSION
}

impl ForumThread {
    pub fn is_stale(&self) -> bool {
        self.version < THREAD_METADATA_VERSION
    }

    pub fn persisted_post_count(&self) -> usize {
        self.posts.iter().map(|p| p.total_count()).sum()
    }
}

/// A cached user profile (spec §4.7).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub user_id: u64,
    pub username: String,
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub real_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birthday: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wikidot_user_since: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_type: Option<String>,
    pub activity: Activity,
    pub fetched_at: i64,
}

/// Open question (spec §9): the source's `GENDER_FEMALE` constant equals
/// `GENDER_MALE` — left undecided upstream. We do not guess a fix; both
/// variants are modeled distinctly here so a future decision is a pure
/// parser change, not a schema migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Activity {
    None,
    Low,
    Medium,
    High,
    VeryHigh,
    Guru,
    Unknown,
}

impl Default for Activity {
    fn default() -> Self {
        Activity::Unknown
    }
}

/// `meta/pending_files.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingFiles {
    pub files: Vec<u64>,
}

/// `meta/pending_pages.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingPages {
    pub pages: Vec<String>,
}

/// `meta/pending_revisions.json` — maps `global_revision` to the owning
/// page id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingRevisions {
    pub revisions: HashMap<u64, u64>,
}

/// `meta/file_map.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileMapEntry {
    pub url: String,
    pub relative_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileMap {
    pub files: HashMap<u64, FileMapEntry>,
}

/// `meta/page_id_map.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageIdMap {
    pub pages: HashMap<u64, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_invariant_catches_non_decreasing() {
        let mut meta = PageMeta::new("hello", 1);
        meta.revisions.push(PageRevision {
            revision: 1,
            global_revision: 100,
            author: None,
            stamp: None,
            flags: None,
            commentary: None,
        });
        meta.revisions.push(PageRevision {
            revision: 1,
            global_revision: 101,
            author: None,
            stamp: None,
            flags: None,
            commentary: None,
        });
        assert!(!meta.check_revision_invariant());
    }

    #[test]
    fn revision_invariant_catches_duplicate_global() {
        let mut meta = PageMeta::new("hello", 1);
        meta.revisions.push(PageRevision {
            revision: 2,
            global_revision: 100,
            author: None,
            stamp: None,
            flags: None,
            commentary: None,
        });
        meta.revisions.push(PageRevision {
            revision: 1,
            global_revision: 100,
            author: None,
            stamp: None,
            flags: None,
            commentary: None,
        });
        assert!(!meta.check_revision_invariant());
    }

    #[test]
    fn revision_invariant_accepts_valid_history() {
        let mut meta = PageMeta::new("hello", 1);
        meta.revisions.push(PageRevision {
            revision: 2,
            global_revision: 101,
            author: Some(1),
            stamp: None,
            flags: None,
            commentary: None,
        });
        meta.revisions.push(PageRevision {
            revision: 1,
            global_revision: 100,
            author: Some(1),
            stamp: None,
            flags: None,
            commentary: None,
        });
        assert!(meta.check_revision_invariant());
    }

    #[test]
    fn page_meta_round_trips_through_json() {
        let meta = PageMeta::new("hello", 42);
        let json = serde_json::to_string(&meta).unwrap();
        let back: PageMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back.page_id, 42);
        assert_eq!(back.name, "hello");
    }

    #[test]
    fn flatten_walks_post_tree_depth_first() {
        let post = LocalForumPost {
            id: 1,
            title: None,
            poster: None,
            stamp: 0,
            last_edit: None,
            last_edit_by: None,
            revisions: vec![],
            children: vec![LocalForumPost {
                id: 2,
                title: None,
                poster: None,
                stamp: 0,
                last_edit: None,
                last_edit_by: None,
                revisions: vec![],
                children: vec![],
            }],
        };
        let ids: Vec<u64> = post.flatten().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(post.total_count(), 2);
    }
}
