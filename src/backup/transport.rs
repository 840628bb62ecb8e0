//! Remote file server transports
//!
//! Uploads go through [`RemoteTransport`], a small file-server abstraction with
//! append-at-offset uploads and renames. [`FsTransport`] targets a mounted
//! share addressed by a `file://` URL.

use crate::{Error, Result};

use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncSeekExt, AsyncWrite};
use tracing::{debug, info};
use url::Url;

/// Writer of one remote file
pub type RemoteWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Where files go, for log and error messages.
    fn endpoint(&self) -> &str;

    /// Names of remote files starting with `prefix`, sorted.
    async fn list_files(&self, prefix: &str) -> Result<Vec<String>>;

    /// Size of a remote file, `None` when it does not exist.
    async fn file_size(&self, name: &str) -> Result<Option<u64>>;

    /// Open `name` for writing at byte `offset`, creating it when missing.
    /// Anything past `offset` is discarded.
    async fn open_upload(&self, name: &str, offset: u64) -> Result<RemoteWriter>;

    async fn rename(&self, from: &str, to: &str) -> Result<()>;
}

/// Builds the transport for a configured upload URL
pub trait TransportFactory: Send + Sync {
    fn create(&self, url: &str) -> Result<Arc<dyn RemoteTransport>>;
}

/// Transport writing into a local or mounted directory
pub struct FsTransport {
    root: PathBuf,
    endpoint: String,
}

impl FsTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let endpoint = root.display().to_string();
        Self { root, endpoint }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(Error::Transport(format!("invalid remote file name '{}'", name)));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl RemoteTransport for FsTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(prefix) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn file_size(&self, name: &str) -> Result<Option<u64>> {
        match tokio::fs::metadata(self.path_of(name)?).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn open_upload(&self, name: &str, offset: u64) -> Result<RemoteWriter> {
        let path = self.path_of(name)?;
        tokio::fs::create_dir_all(&self.root).await?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;

        let len = file.metadata().await?.len();
        if len < offset {
            return Err(Error::Transport(format!(
                "{} has {} bytes, cannot resume at {}",
                name, len, offset
            )));
        }
        if len > offset {
            file.set_len(offset).await?;
        }
        file.seek(SeekFrom::Start(offset)).await?;

        debug!("Opened {} for upload at offset {}", path.display(), offset);
        Ok(Box::new(file))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        tokio::fs::rename(self.path_of(from)?, self.path_of(to)?).await?;
        info!("Renamed {} to {} on {}", from, to, self.endpoint);
        Ok(())
    }
}

/// Maps upload URLs to transports by scheme
#[derive(Debug, Default, Clone, Copy)]
pub struct UrlTransportFactory;

impl TransportFactory for UrlTransportFactory {
    fn create(&self, url: &str) -> Result<Arc<dyn RemoteTransport>> {
        let parsed = Url::parse(url.trim())
            .map_err(|e| Error::Config(format!("invalid upload URL '{}': {}", url, e)))?;

        match parsed.scheme() {
            "file" => {
                let root = parsed
                    .to_file_path()
                    .map_err(|_| Error::Config(format!("upload URL '{}' is not a local path", url)))?;
                Ok(Arc::new(FsTransport::new(root)))
            }
            other => Err(Error::Config(format!(
                "unsupported upload URL scheme '{}'; expected file",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn write(transport: &FsTransport, name: &str, offset: u64, bytes: &[u8]) {
        let mut writer = transport.open_upload(name, offset).await.unwrap();
        writer.write_all(bytes).await.unwrap();
        writer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_append_at_offset_truncates_tail() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FsTransport::new(dir.path());

        write(&transport, "a.tar.incomplete", 0, b"hello world").await;
        write(&transport, "a.tar.incomplete", 5, b"!!").await;

        let content = std::fs::read(dir.path().join("a.tar.incomplete")).unwrap();
        assert_eq!(content, b"hello!!");
        assert_eq!(transport.file_size("a.tar.incomplete").await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_offset_past_end_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FsTransport::new(dir.path());
        write(&transport, "a", 0, b"abc").await;
        assert!(transport.open_upload("a", 10).await.is_err());
    }

    #[tokio::test]
    async fn test_list_and_rename() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FsTransport::new(dir.path());
        write(&transport, "t_1_1_s.tar.incomplete", 0, b"x").await;
        write(&transport, "other_1_1_s.tar", 0, b"y").await;

        transport
            .rename("t_1_1_s.tar.incomplete", "t_1_1_s.tar")
            .await
            .unwrap();
        assert_eq!(transport.list_files("t_").await.unwrap(), vec!["t_1_1_s.tar"]);
        assert_eq!(transport.file_size("missing").await.unwrap(), None);
        assert!(transport.file_size("../etc").await.is_err());
    }

    #[test]
    fn test_factory_schemes() {
        let dir = tempfile::tempdir().unwrap();
        let url = Url::from_directory_path(dir.path()).unwrap();
        let transport = UrlTransportFactory.create(url.as_str()).unwrap();
        assert!(transport
            .endpoint()
            .starts_with(&dir.path().display().to_string()));

        assert!(UrlTransportFactory.create("ftp://host/share").is_err());
        assert!(UrlTransportFactory.create("not a url").is_err());
    }
}
