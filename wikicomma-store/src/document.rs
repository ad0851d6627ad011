//! # Durable JSON document
//!
//! A generic `(value, path)` pair with a dirty bit, timed flush, and
//! coalesced writes, modeled on the teacher's `FileStorage` but made
//! atomic and restartable per spec §4.5: writes land via a temp file plus
//! rename so a reader on the same process never observes a partial write,
//! and the first read is lazy so constructing a `Document` never touches
//! disk until it's actually needed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;
use wikicomma_error::{Error, Result};

/// A durable, lazily-loaded JSON document.
///
/// `T` must implement `Default` so a missing or corrupt file on read
/// yields an empty, already-initialized value rather than propagating the
/// read error (spec §4.5: "On read error the document stays empty and is
/// marked initialised").
pub struct Document<T> {
    path: PathBuf,
    value: RwLock<T>,
    loaded: AtomicBool,
    dirty: AtomicBool,
    write_lock: Mutex<()>,
    timer: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<T> Document<T>
where
    T: Default + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            value: RwLock::new(T::default()),
            loaded: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            timer: SyncMutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lazily loads the file into memory on first access.
    async fn ensure_loaded(&self) {
        if self.loaded.load(Ordering::Acquire) {
            return;
        }
        let mut guard = self.value.write().await;
        if self.loaded.load(Ordering::Acquire) {
            return;
        }
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice::<T>(&bytes) {
                Ok(v) => *guard = v,
                Err(e) => {
                    warn!(path = %self.path.display(), "failed to parse document, starting empty: {e}");
                    *guard = T::default();
                }
            },
            Err(_) => {
                *guard = T::default();
            }
        }
        self.loaded.store(true, Ordering::Release);
    }

    /// Read the current value via a callback, loading first if needed.
    pub async fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.ensure_loaded().await;
        let guard = self.value.read().await;
        f(&guard)
    }

    /// Mutate the current value via a callback and mark the document
    /// dirty, loading first if needed.
    pub async fn modify<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.ensure_loaded().await;
        let mut guard = self.value.write().await;
        let result = f(&mut guard);
        self.mark_dirty();
        result
    }

    /// Idempotent: repeated calls before the next flush are a no-op.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Write the current value to disk exactly once, coalescing concurrent
    /// callers into a single write. No-op if not dirty.
    pub async fn sync(self: &Arc<Self>) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let _write_guard = self.write_lock.lock().await;
        self.ensure_loaded().await;

        let snapshot = {
            let guard = self.value.read().await;
            serde_json::to_vec_pretty(&*guard)?
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = self.path.with_extension(format!(
            "{}.tmp",
            self.path.extension().and_then(|e| e.to_str()).unwrap_or("json")
        ));
        tokio::fs::write(&tmp_path, &snapshot).await?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| Error::from(e).with_operation("document::sync"))?;

        Ok(())
    }

    /// Arrange flushes every `period`. A second call replaces the prior
    /// timer, aborting it.
    pub fn start_timer(self: &Arc<Self>, period: Duration) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(e) = this.sync().await {
                    warn!("periodic document flush failed: {e}");
                }
            }
        });

        let mut guard = self.timer.lock();
        if let Some(old) = guard.take() {
            old.abort();
        }
        *guard = Some(handle);
    }

    pub fn stop_timer(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }
}

impl<T> Drop for Document<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    struct Sample {
        counter: u32,
        names: Vec<String>,
    }

    #[tokio::test]
    async fn missing_file_starts_empty_and_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let doc = Document::<Sample>::new(dir.path().join("missing.json"));
        let value = doc.read(|v| v.counter).await;
        assert_eq!(value, 0);
    }

    #[tokio::test]
    async fn sync_writes_and_reload_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let doc = Document::<Sample>::new(&path);
        doc.modify(|v| {
            v.counter = 7;
            v.names.push("a".into());
        })
        .await;
        doc.sync().await.unwrap();

        let doc2 = Document::<Sample>::new(&path);
        let value = doc2.read(|v| v.clone()).await;
        assert_eq!(
            value,
            Sample {
                counter: 7,
                names: vec!["a".into()]
            }
        );
    }

    #[tokio::test]
    async fn sync_is_noop_when_not_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let doc = Document::<Sample>::new(&path);
        doc.sync().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let doc = Document::<Sample>::new(&path);
        let value = doc.read(|v| v.counter).await;
        assert_eq!(value, 0);
    }
}
