//! Storage drivers
//!
//! A driver is a flat, path-addressed byte store. Paths are absolute,
//! `/`-separated and never contain `..`. Directories exist implicitly while
//! they have children.

use crate::distribution::BlobStream;
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream;
use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;

/// Size of the chunks `reader` streams content in
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
}

#[async_trait]
pub trait StorageDriver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_content(&self, path: &str) -> Result<Bytes>;

    /// Replace the content at `path` atomically
    async fn put_content(&self, path: &str, content: Bytes) -> Result<()>;

    async fn stat(&self, path: &str) -> Result<FileInfo>;

    /// Direct children of a directory as full paths, sorted
    async fn list(&self, path: &str) -> Result<Vec<String>>;

    /// Delete a file or a whole directory tree
    async fn delete(&self, path: &str) -> Result<()>;

    /// Stream the content at `path` in chunks of at most [`READ_CHUNK_SIZE`]
    async fn reader(&self, path: &str) -> Result<BlobStream>;

    /// Start a staged write. Nothing appears at any path until the writer
    /// commits; dropping it discards what was written.
    async fn writer(&self) -> Result<Box<dyn FileWriter>>;
}

/// Append-only staged file returned by [`StorageDriver::writer`]
#[async_trait]
pub trait FileWriter: Send {
    fn size(&self) -> u64;

    async fn write(&mut self, chunk: &[u8]) -> Result<()>;

    /// Atomically place the written content at `path`, replacing any file there
    async fn commit(self: Box<Self>, path: &str) -> Result<()>;

    async fn cancel(self: Box<Self>) -> Result<()>;
}

fn validate_path(path: &str) -> Result<()> {
    let valid = path.starts_with('/')
        && !path.contains("//")
        && !path.split('/').any(|segment| segment == ".." || segment == ".");
    if valid {
        Ok(())
    } else {
        Err(ProxyError::LocalStore(format!("Invalid storage path: {}", path)))
    }
}

fn dir_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", path.trim_end_matches('/'))
    }
}

fn chunked(content: Bytes) -> BlobStream {
    let chunks: Vec<Result<Bytes>> = (0..content.len())
        .step_by(READ_CHUNK_SIZE)
        .map(|start| Ok(content.slice(start..(start + READ_CHUNK_SIZE).min(content.len()))))
        .collect();
    Box::pin(stream::iter(chunks))
}

/// Volatile driver, used for tests and throwaway caches
#[derive(Default)]
pub struct InMemoryDriver {
    files: Arc<RwLock<BTreeMap<String, Bytes>>>,
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageDriver for InMemoryDriver {
    fn name(&self) -> &'static str {
        "inmemory"
    }

    async fn get_content(&self, path: &str) -> Result<Bytes> {
        validate_path(path)?;
        self.files
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| ProxyError::PathNotFound(path.to_string()))
    }

    async fn put_content(&self, path: &str, content: Bytes) -> Result<()> {
        validate_path(path)?;
        self.files.write().await.insert(path.to_string(), content);
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        validate_path(path)?;
        let files = self.files.read().await;
        if let Some(content) = files.get(path) {
            return Ok(FileInfo {
                path: path.to_string(),
                size: content.len() as u64,
                is_dir: false,
            });
        }

        let prefix = dir_prefix(path);
        if files.range(prefix.clone()..).next().is_some_and(|(k, _)| k.starts_with(&prefix)) {
            return Ok(FileInfo {
                path: path.to_string(),
                size: 0,
                is_dir: true,
            });
        }
        Err(ProxyError::PathNotFound(path.to_string()))
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        validate_path(path)?;
        let prefix = dir_prefix(path);
        let files = self.files.read().await;
        let children: BTreeSet<String> = files
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| k[prefix.len()..].split('/').next())
            .map(|child| format!("{}{}", prefix, child))
            .collect();

        if children.is_empty() && path != "/" {
            return Err(ProxyError::PathNotFound(path.to_string()));
        }
        Ok(children.into_iter().collect())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        let mut files = self.files.write().await;
        if files.remove(path).is_some() {
            return Ok(());
        }

        let prefix = dir_prefix(path);
        let doomed: Vec<String> = files
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        if doomed.is_empty() {
            return Err(ProxyError::PathNotFound(path.to_string()));
        }
        for key in doomed {
            files.remove(&key);
        }
        Ok(())
    }

    async fn reader(&self, path: &str) -> Result<BlobStream> {
        Ok(chunked(self.get_content(path).await?))
    }

    async fn writer(&self) -> Result<Box<dyn FileWriter>> {
        Ok(Box::new(InMemoryFileWriter {
            files: self.files.clone(),
            buffer: BytesMut::new(),
        }))
    }
}

struct InMemoryFileWriter {
    files: Arc<RwLock<BTreeMap<String, Bytes>>>,
    buffer: BytesMut,
}

#[async_trait]
impl FileWriter for InMemoryFileWriter {
    fn size(&self) -> u64 {
        self.buffer.len() as u64
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    async fn commit(self: Box<Self>, path: &str) -> Result<()> {
        validate_path(path)?;
        let InMemoryFileWriter { files, buffer } = *self;
        files.write().await.insert(path.to_string(), buffer.freeze());
        Ok(())
    }

    async fn cancel(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Driver rooted at a local directory
pub struct FilesystemDriver {
    root: PathBuf,
}

impl FilesystemDriver {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            ProxyError::LocalStore(format!("Failed to create storage root {}: {}", root.display(), e))
        })?;
        Ok(Self { root })
    }

    fn full_path(&self, path: &str) -> Result<PathBuf> {
        resolve(&self.root, path)
    }

    /// Hidden sibling of the root's entries; `list` skips `.tmp` names
    fn temp_path(&self) -> PathBuf {
        self.root.join(format!("{}.upload.tmp", uuid::Uuid::new_v4()))
    }
}

fn resolve(root: &Path, path: &str) -> Result<PathBuf> {
    validate_path(path)?;
    Ok(root.join(path.trim_start_matches('/')))
}

fn map_io(err: std::io::Error, path: &str) -> ProxyError {
    if err.kind() == ErrorKind::NotFound {
        ProxyError::PathNotFound(path.to_string())
    } else {
        ProxyError::LocalStore(format!("{}: {}", path, err))
    }
}

#[async_trait]
impl StorageDriver for FilesystemDriver {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn get_content(&self, path: &str) -> Result<Bytes> {
        let full = self.full_path(path)?;
        let data = tokio::fs::read(&full).await.map_err(|e| map_io(e, path))?;
        Ok(Bytes::from(data))
    }

    async fn put_content(&self, path: &str, content: Bytes) -> Result<()> {
        let full = self.full_path(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(e, path))?;
        }

        // Write to a sibling temp file first so readers never see partial content
        let temp = full.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&temp, &content)
            .await
            .map_err(|e| map_io(e, path))?;
        if let Err(e) = tokio::fs::rename(&temp, &full).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(map_io(e, path));
        }
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let full = self.full_path(path)?;
        let metadata = tokio::fs::metadata(&full)
            .await
            .map_err(|e| map_io(e, path))?;
        Ok(FileInfo {
            path: path.to_string(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            is_dir: metadata.is_dir(),
        })
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let full = self.full_path(path)?;
        let mut entries = tokio::fs::read_dir(&full)
            .await
            .map_err(|e| map_io(e, path))?;

        let prefix = dir_prefix(path);
        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| map_io(e, path))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".tmp") {
                continue;
            }
            children.push(format!("{}{}", prefix, name));
        }
        children.sort();
        Ok(children)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.full_path(path)?;
        let metadata = tokio::fs::metadata(&full)
            .await
            .map_err(|e| map_io(e, path))?;
        let removed = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&full).await
        } else {
            tokio::fs::remove_file(&full).await
        };
        removed.map_err(|e| map_io(e, path))
    }

    async fn reader(&self, path: &str) -> Result<BlobStream> {
        let full = self.full_path(path)?;
        let file = tokio::fs::File::open(&full)
            .await
            .map_err(|e| map_io(e, path))?;

        let chunks = stream::try_unfold((file, path.to_string()), |(mut file, path)| async move {
            let mut buffer = vec![0u8; READ_CHUNK_SIZE];
            let read = match file.read(&mut buffer).await {
                Ok(read) => read,
                Err(e) => return Err(map_io(e, &path)),
            };
            if read == 0 {
                return Ok(None);
            }
            buffer.truncate(read);
            Ok(Some((Bytes::from(buffer), (file, path))))
        });
        Ok(Box::pin(chunks))
    }

    async fn writer(&self) -> Result<Box<dyn FileWriter>> {
        let temp = self.temp_path();
        let file = tokio::fs::File::create(&temp).await.map_err(|e| {
            ProxyError::LocalStore(format!("Failed to create {}: {}", temp.display(), e))
        })?;
        Ok(Box::new(FilesystemFileWriter {
            root: self.root.clone(),
            temp: Some(temp),
            file,
            size: 0,
        }))
    }
}

/// Content staged in a temp file under the driver root, renamed into place on commit
struct FilesystemFileWriter {
    root: PathBuf,
    /// `None` once the file has been renamed or removed
    temp: Option<PathBuf>,
    file: tokio::fs::File,
    size: u64,
}

impl FilesystemFileWriter {
    fn temp_error(&self, action: &str, err: std::io::Error) -> ProxyError {
        let temp = self.temp.as_deref().unwrap_or(&self.root);
        ProxyError::LocalStore(format!("Failed to {} {}: {}", action, temp.display(), err))
    }
}

#[async_trait]
impl FileWriter for FilesystemFileWriter {
    fn size(&self) -> u64 {
        self.size
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if let Err(e) = self.file.write_all(chunk).await {
            return Err(self.temp_error("write", e));
        }
        self.size += chunk.len() as u64;
        Ok(())
    }

    async fn commit(mut self: Box<Self>, path: &str) -> Result<()> {
        let full = resolve(&self.root, path)?;
        if let Err(e) = self.file.sync_all().await {
            return Err(self.temp_error("sync", e));
        }
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(e, path))?;
        }

        let Some(temp) = self.temp.take() else {
            return Err(ProxyError::LocalStore(format!("Upload for {} already finished", path)));
        };
        if let Err(e) = tokio::fs::rename(&temp, &full).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(map_io(e, path));
        }
        Ok(())
    }

    async fn cancel(mut self: Box<Self>) -> Result<()> {
        match self.temp.take() {
            Some(temp) => tokio::fs::remove_file(&temp)
                .await
                .map_err(|e| ProxyError::LocalStore(format!("Failed to remove {}: {}", temp.display(), e))),
            None => Ok(()),
        }
    }
}

impl Drop for FilesystemFileWriter {
    fn drop(&mut self) {
        if let Some(temp) = self.temp.take() {
            let _ = std::fs::remove_file(temp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn exercise(driver: &dyn StorageDriver) {
        driver
            .put_content("/a/b/one", Bytes::from_static(b"1"))
            .await
            .unwrap();
        driver
            .put_content("/a/c/two", Bytes::from_static(b"22"))
            .await
            .unwrap();

        assert_eq!(driver.get_content("/a/b/one").await.unwrap(), "1");
        assert_eq!(driver.stat("/a/c/two").await.unwrap().size, 2);
        assert!(driver.stat("/a/b").await.unwrap().is_dir);
        assert_eq!(driver.list("/a").await.unwrap(), vec!["/a/b", "/a/c"]);

        driver.delete("/a/b").await.unwrap();
        assert!(matches!(
            driver.get_content("/a/b/one").await,
            Err(ProxyError::PathNotFound(_))
        ));
        assert!(matches!(
            driver.delete("/a/b").await,
            Err(ProxyError::PathNotFound(_))
        ));
        assert!(driver.get_content("/a/../etc/passwd").await.is_err());
    }

    async fn exercise_staged_writes(driver: &dyn StorageDriver) {
        let content: Vec<u8> = (0..READ_CHUNK_SIZE * 2 + 17).map(|i| (i % 251) as u8).collect();

        let mut abandoned = driver.writer().await.unwrap();
        abandoned.write(&content[..100]).await.unwrap();
        drop(abandoned);

        let mut cancelled = driver.writer().await.unwrap();
        cancelled.write(&content[..100]).await.unwrap();
        cancelled.cancel().await.unwrap();
        assert!(matches!(
            driver.list("/").await,
            Ok(children) if children.is_empty()
        ));

        let mut writer = driver.writer().await.unwrap();
        for chunk in content.chunks(1000) {
            writer.write(chunk).await.unwrap();
        }
        assert_eq!(writer.size(), content.len() as u64);
        assert!(driver.stat("/blobs/data").await.is_err());
        writer.commit("/blobs/data").await.unwrap();

        let chunks: Vec<Bytes> = driver
            .reader("/blobs/data")
            .await
            .unwrap()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|chunk| chunk.len() <= READ_CHUNK_SIZE));
        assert_eq!(chunks.concat(), content);
        assert_eq!(driver.list("/").await.unwrap(), vec!["/blobs"]);

        assert!(matches!(
            driver.reader("/blobs/missing").await,
            Err(ProxyError::PathNotFound(_))
        ));
    }

    #[tokio::test]
    async fn in_memory_driver_semantics() {
        exercise(&InMemoryDriver::new()).await;
        exercise_staged_writes(&InMemoryDriver::new()).await;
    }

    #[tokio::test]
    async fn filesystem_driver_semantics() {
        let dir = tempfile::TempDir::new().unwrap();
        exercise(&FilesystemDriver::new(dir.path()).unwrap()).await;

        let dir = tempfile::TempDir::new().unwrap();
        exercise_staged_writes(&FilesystemDriver::new(dir.path()).unwrap()).await;
        // abandoned and cancelled uploads leave no temp files behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
