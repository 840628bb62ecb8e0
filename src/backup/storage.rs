//! Local backup storage
//!
//! Backups live under `<root>/<tag>/<node>/<files>`. A backup's file set is
//! streamed as a tar archive with deterministic headers, so the same file set
//! always produces the same bytes and an interrupted upload can resume from a
//! byte offset.

use crate::{Error, Result};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info, warn};

const STREAM_BUFFER: usize = 64 * 1024;
const MANIFEST_FILE: &str = "backup.json";

/// One file of a node's backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFile {
    pub node: String,
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// All files of one backup across the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupFileSet {
    tag: String,
    files: Vec<BackupFile>,
}

impl BackupFileSet {
    pub fn new(tag: impl Into<String>, mut files: Vec<BackupFile>) -> Self {
        files.sort_by(|a, b| (&a.node, &a.name).cmp(&(&b.node, &b.name)));
        Self {
            tag: tag.into(),
            files,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn files(&self) -> &[BackupFile] {
        &self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn unique_nodes(&self) -> BTreeSet<String> {
        self.files.iter().map(|f| f.node.clone()).collect()
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// A quorum of the cluster's nodes contributed files.
    pub fn is_valid(&self, total_nodes: usize) -> bool {
        !self.files.is_empty() && self.unique_nodes().len() >= total_nodes / 2 + 1
    }
}

/// Archive bytes of a file set, produced on a blocking thread
pub struct BackupStream {
    pub reader: DuplexStream,
    producer: JoinHandle<Result<u64>>,
}

impl BackupStream {
    /// Wait for the producer; returns the number of bytes emitted.
    pub async fn finish(self) -> Result<u64> {
        let BackupStream { reader, producer } = self;
        drop(reader);
        producer.await?
    }
}

/// Discards the first `skip` bytes written through it.
struct SkipWriter<W> {
    inner: W,
    skip: u64,
    written: u64,
}

impl<W: Write> SkipWriter<W> {
    fn new(inner: W, skip: u64) -> Self {
        Self {
            inner,
            skip,
            written: 0,
        }
    }
}

impl<W: Write> Write for SkipWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.skip >= buf.len() as u64 {
            self.skip -= buf.len() as u64;
            return Ok(buf.len());
        }
        let start = self.skip as usize;
        self.skip = 0;
        self.inner.write_all(&buf[start..])?;
        self.written += (buf.len() - start) as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Stream the tar archive of `files`, starting at byte `offset`.
pub fn archive_stream(files: &BackupFileSet, offset: u64) -> Result<BackupStream> {
    let handle = tokio::runtime::Handle::try_current()
        .map_err(|e| Error::Internal(format!("archive stream needs a runtime: {}", e)))?;
    let (reader, writer) = tokio::io::duplex(STREAM_BUFFER);
    let bridge = SyncIoBridge::new_with_handle(writer, handle);

    let entries: Vec<(PathBuf, String)> = files
        .files()
        .iter()
        .map(|f| (f.path.clone(), format!("{}/{}/{}", files.tag(), f.node, f.name)))
        .collect();

    let producer = tokio::task::spawn_blocking(move || -> Result<u64> {
        let mut builder = tar::Builder::new(SkipWriter::new(bridge, offset));
        builder.mode(tar::HeaderMode::Deterministic);
        for (path, name) in &entries {
            builder.append_path_with_name(path, name)?;
        }
        let mut sink = builder.into_inner()?;
        sink.flush()?;
        Ok(sink.written)
    });

    Ok(BackupStream { reader, producer })
}

/// Local backup tooling
#[async_trait]
pub trait BackupStorage: Send + Sync {
    /// Tags with a backup of the local node.
    async fn node_backup_tags(&self) -> Result<BTreeSet<String>>;

    /// Tags found on any node. A tag may belong to an unfinished backup.
    async fn cluster_backup_tags(&self, ignore_down_nodes: bool) -> Result<BTreeSet<String>>;

    async fn create_backup(&self, tag: &str) -> Result<()>;

    async fn delete_backup(&self, tag: &str) -> Result<()>;

    /// Files of `tag` on every reachable node; empty when the tag is unknown.
    async fn download_files(&self, tag: &str) -> Result<BackupFileSet>;

    async fn open_stream(&self, files: &BackupFileSet, offset: u64) -> Result<BackupStream> {
        archive_stream(files, offset)
    }
}

#[derive(Serialize)]
struct BackupManifest<'a> {
    tag: &'a str,
    node: &'a str,
    created_at: chrono::DateTime<Utc>,
    files: Vec<String>,
}

/// Backups on a filesystem shared by the cluster's nodes
pub struct FsBackupStorage {
    root: PathBuf,
    node_id: String,
    data_dir: Option<PathBuf>,
}

impl FsBackupStorage {
    /// `data_dir`, when set, is copied into every backup of this node.
    pub fn new(root: impl Into<PathBuf>, node_id: impl Into<String>, data_dir: Option<PathBuf>) -> Self {
        Self {
            root: root.into(),
            node_id: node_id.into(),
            data_dir,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tag_dir(&self, tag: &str) -> Result<PathBuf> {
        if tag.is_empty() || tag.starts_with('.') || tag.contains(['/', '\\']) {
            return Err(Error::Backup(format!("invalid backup tag '{}'", tag)));
        }
        Ok(self.root.join(tag))
    }

    async fn sub_dirs(dir: &Path) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.insert(name.to_string());
                }
            }
        }
        Ok(names)
    }

    async fn files_in(dir: &Path) -> Result<Vec<(String, PathBuf, u64)>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                files.push((name.to_string(), entry.path(), meta.len()));
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl BackupStorage for FsBackupStorage {
    async fn node_backup_tags(&self) -> Result<BTreeSet<String>> {
        let mut tags = BTreeSet::new();
        for tag in Self::sub_dirs(&self.root).await? {
            if tokio::fs::metadata(self.root.join(&tag).join(&self.node_id))
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false)
            {
                tags.insert(tag);
            }
        }
        Ok(tags)
    }

    async fn cluster_backup_tags(&self, _ignore_down_nodes: bool) -> Result<BTreeSet<String>> {
        // Every node writes to the shared root, so none can be unreachable
        let mut tags = BTreeSet::new();
        for tag in Self::sub_dirs(&self.root).await? {
            if !Self::sub_dirs(&self.root.join(&tag)).await?.is_empty() {
                tags.insert(tag);
            }
        }
        Ok(tags)
    }

    async fn create_backup(&self, tag: &str) -> Result<()> {
        let target = self.tag_dir(tag)?.join(&self.node_id);
        if tokio::fs::metadata(&target).await.is_ok() {
            return Err(Error::Backup(format!("backup {} already exists", tag)));
        }
        tokio::fs::create_dir_all(&target).await?;

        let mut copied = Vec::new();
        if let Some(data_dir) = &self.data_dir {
            for (name, path, _) in Self::files_in(data_dir).await? {
                tokio::fs::copy(&path, target.join(&name)).await?;
                copied.push(name);
            }
        }
        copied.sort();

        let manifest = BackupManifest {
            tag,
            node: &self.node_id,
            created_at: Utc::now(),
            files: copied,
        };
        tokio::fs::write(target.join(MANIFEST_FILE), serde_json::to_vec_pretty(&manifest)?).await?;

        info!("Created backup {} of node {} with {} files", tag, self.node_id, manifest.files.len());
        Ok(())
    }

    async fn delete_backup(&self, tag: &str) -> Result<()> {
        match tokio::fs::remove_dir_all(self.tag_dir(tag)?).await {
            Ok(()) => {
                info!("Deleted backup {}", tag);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Backup {} to delete does not exist", tag);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn download_files(&self, tag: &str) -> Result<BackupFileSet> {
        let dir = self.tag_dir(tag)?;
        let mut files = Vec::new();
        for node in Self::sub_dirs(&dir).await? {
            for (name, path, size) in Self::files_in(&dir.join(&node)).await? {
                files.push(BackupFile {
                    node: node.clone(),
                    name,
                    path,
                    size,
                });
            }
        }
        debug!("Backup {} has {} files", tag, files.len());
        Ok(BackupFileSet::new(tag, files))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn read_all(storage: &FsBackupStorage, files: &BackupFileSet, offset: u64) -> Vec<u8> {
        let mut stream = storage.open_stream(files, offset).await.unwrap();
        let mut bytes = Vec::new();
        stream.reader.read_to_end(&mut bytes).await.unwrap();
        let written = stream.finish().await.unwrap();
        assert_eq!(written, bytes.len() as u64);
        bytes
    }

    #[tokio::test]
    async fn test_create_list_and_delete() {
        let root = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        std::fs::write(data.path().join("db.dump"), b"rows").unwrap();

        let storage = FsBackupStorage::new(root.path(), "node1", Some(data.path().to_path_buf()));
        storage.create_backup("manual-1").await.unwrap();
        assert!(storage.create_backup("manual-1").await.is_err());

        assert!(storage.node_backup_tags().await.unwrap().contains("manual-1"));
        let files = storage.download_files("manual-1").await.unwrap();
        let names: Vec<&str> = files.files().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["backup.json", "db.dump"]);
        assert!(files.is_valid(1));

        storage.delete_backup("manual-1").await.unwrap();
        assert!(storage.cluster_backup_tags(true).await.unwrap().is_empty());
        assert!(storage.download_files("manual-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_quorum_validity() {
        let root = tempfile::tempdir().unwrap();
        FsBackupStorage::new(root.path(), "n1", None).create_backup("b").await.unwrap();
        let storage = FsBackupStorage::new(root.path(), "n2", None);
        storage.create_backup("b").await.unwrap();

        let files = storage.download_files("b").await.unwrap();
        assert_eq!(files.unique_nodes().len(), 2);
        assert!(files.is_valid(3));
        assert!(!files.is_valid(5));
    }

    #[tokio::test]
    async fn test_stream_from_offset_is_suffix_of_full_archive() {
        let root = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        std::fs::write(data.path().join("a.bin"), vec![7u8; 3000]).unwrap();
        let storage = FsBackupStorage::new(root.path(), "node1", Some(data.path().to_path_buf()));
        storage.create_backup("b").await.unwrap();
        let files = storage.download_files("b").await.unwrap();

        let full = read_all(&storage, &files, 0).await;
        assert_eq!(full.len() % 512, 0);
        assert_eq!(full, read_all(&storage, &files, 0).await);

        let tail = read_all(&storage, &files, 1000).await;
        assert_eq!(tail.as_slice(), &full[1000..]);
    }

    #[tokio::test]
    async fn test_invalid_tag_rejected() {
        let root = tempfile::tempdir().unwrap();
        let storage = FsBackupStorage::new(root.path(), "node1", None);
        assert!(storage.create_backup("../escape").await.is_err());
    }
}
