//! # Archive compressor adapter
//!
//! A thin wrapper around the system `7z` binary exposing `list`/`add`
//! (spec §4.6). Both operations are idempotent with respect to entries
//! already present in the archive: `add` diffs against `list` first and
//! only appends files the archive doesn't already have.

use std::collections::HashSet;
use std::path::Path;

use tokio::process::Command;
use tracing::debug;
use wikicomma_error::{Error, ErrorKind, Result};

/// One entry reported by `7z l`.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveEntry {
    pub file: String,
    pub status: String,
    pub size: Option<u64>,
    pub size_compressed: Option<u64>,
}

/// Options for [`ArchiveAdapter::add`].
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// Delete the source files after they've been added successfully.
    pub delete_originals: bool,
}

pub struct ArchiveAdapter {
    binary: String,
}

impl Default for ArchiveAdapter {
    fn default() -> Self {
        Self { binary: "7z".to_string() }
    }
}

impl ArchiveAdapter {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    /// List the entries of `archive`. An archive that doesn't exist yet
    /// yields an empty list rather than an error — `add` treats a missing
    /// archive as "create it".
    pub async fn list(&self, archive: &Path) -> Result<Vec<ArchiveEntry>> {
        if !archive.exists() {
            return Ok(Vec::new());
        }

        let output = Command::new(&self.binary)
            .arg("l")
            .arg("-slt")
            .arg(archive)
            .output()
            .await
            .map_err(|e| Error::new(ErrorKind::StorageFailed, e.to_string()).with_operation("archive::list"))?;

        if !output.status.success() {
            return Err(Error::new(
                ErrorKind::StorageFailed,
                String::from_utf8_lossy(&output.stderr).into_owned(),
            )
            .with_operation("archive::list"));
        }

        Ok(parse_slt_listing(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Append `files` into `archive`, creating it if necessary. Files whose
    /// basename is already present in the archive are skipped.
    pub async fn add(&self, archive: &Path, files: &[impl AsRef<Path>], opts: AddOptions) -> Result<usize> {
        let existing: HashSet<String> = self.list(archive).await?.into_iter().map(|e| e.file).collect();

        let to_add: Vec<&Path> = files
            .iter()
            .map(|f| f.as_ref())
            .filter(|f| {
                f.file_name()
                    .map(|n| !existing.contains(&n.to_string_lossy().into_owned()))
                    .unwrap_or(false)
            })
            .collect();

        if to_add.is_empty() {
            debug!(archive = %archive.display(), "add: nothing new to compact");
            if opts.delete_originals {
                remove_all(files).await?;
            }
            return Ok(0);
        }

        if let Some(parent) = archive.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let output = Command::new(&self.binary)
            .arg("a")
            .arg(archive)
            .args(&to_add)
            .output()
            .await
            .map_err(|e| Error::new(ErrorKind::StorageFailed, e.to_string()).with_operation("archive::add"))?;

        if !output.status.success() {
            return Err(Error::new(
                ErrorKind::StorageFailed,
                String::from_utf8_lossy(&output.stderr).into_owned(),
            )
            .with_operation("archive::add"));
        }

        if opts.delete_originals {
            remove_all(files).await?;
        }

        Ok(to_add.len())
    }
}

async fn remove_all(files: &[impl AsRef<Path>]) -> Result<()> {
    for f in files {
        if let Err(e) = tokio::fs::remove_file(f).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(Error::new(ErrorKind::FileUnlink, e.to_string()).with_operation("archive::remove_all"));
            }
        }
    }
    Ok(())
}

fn parse_slt_listing(stdout: &str) -> Vec<ArchiveEntry> {
    let mut entries = Vec::new();
    let mut path = None;
    let mut size = None;
    let mut size_compressed = None;

    for line in stdout.lines() {
        if let Some(v) = line.strip_prefix("Path = ") {
            if let Some(p) = path.take() {
                entries.push(ArchiveEntry {
                    file: p,
                    status: "present".to_string(),
                    size: size.take(),
                    size_compressed: size_compressed.take(),
                });
            }
            path = Some(v.to_string());
        } else if let Some(v) = line.strip_prefix("Size = ") {
            size = v.trim().parse().ok();
        } else if let Some(v) = line.strip_prefix("Packed Size = ") {
            size_compressed = v.trim().parse().ok();
        }
    }
    if let Some(p) = path.take() {
        entries.push(ArchiveEntry {
            file: p,
            status: "present".to_string(),
            size,
            size_compressed,
        });
    }

    // the first "Path = " in `-slt` output names the archive itself on
    // some 7z builds; callers only care about basenames so this is benign
    entries.into_iter().filter(|e| !e.file.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_slt_listing() {
        let stdout = "\
Path = 1.txt
Size = 11
Packed Size = 9

Path = 2.txt
Size = 20
Packed Size = 15
";
        let entries = parse_slt_listing(stdout);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].file, "1.txt");
        assert_eq!(entries[0].size, Some(11));
        assert_eq!(entries[1].file, "2.txt");
        assert_eq!(entries[1].size_compressed, Some(15));
    }

    #[tokio::test]
    async fn list_on_missing_archive_is_empty() {
        let adapter = ArchiveAdapter::default();
        let entries = adapter.list(Path::new("/nonexistent/archive.7z")).await.unwrap();
        assert!(entries.is_empty());
    }
}
