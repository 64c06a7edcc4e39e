//! Flat-directory file storage
//!
//! Each stored file is one regular file in the data directory named after it.
//! The directory is emptied when the store opens: a restarted dstore rejoins
//! with nothing and is refilled by rebalancing. Uploads land in a staging
//! subdirectory and are renamed into place once complete.

use crate::common::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

const STAGING_DIR: &str = ".incoming";

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create (or clear) the data directory.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        let mut entries = fs::read_dir(&root).await?;
        let mut cleared = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&path).await?;
            } else {
                fs::remove_file(&path).await?;
            }
            cleared += 1;
        }
        if cleared > 0 {
            tracing::info!("Cleared {} stale entries from {}", cleared, root.display());
        }
        fs::create_dir(root.join(STAGING_DIR)).await?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name == STAGING_DIR
            || name.contains(['/', '\\'])
            || name.chars().any(char::is_whitespace)
        {
            return Err(Error::Protocol(format!("invalid file name: {:?}", name)));
        }
        Ok(self.root.join(name))
    }

    pub async fn put(&self, name: &str, mut data: &[u8]) -> Result<()> {
        let size = data.len() as u64;
        self.put_stream(name, &mut data, size).await
    }

    /// Copy exactly `size` bytes from `reader` into `name`. A short payload
    /// leaves no file behind.
    pub async fn put_stream<R>(&self, name: &str, reader: &mut R, size: u64) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let path = self.path(name)?;
        let staged = self.root.join(STAGING_DIR).join(name);

        let mut file = fs::File::create(&staged).await?;
        let copied = tokio::io::copy(&mut reader.take(size), &mut file).await;
        let copied = match copied {
            Ok(copied) => copied,
            Err(e) => {
                discard(&staged).await;
                return Err(e.into());
            }
        };
        if copied != size {
            discard(&staged).await;
            return Err(Error::Protocol(format!(
                "payload of {} ended after {} of {} bytes",
                name, copied, size
            )));
        }
        file.flush().await?;
        drop(file);

        fs::rename(&staged, &path).await?;
        Ok(())
    }

    /// Contents of `name`, or `None` if it is not stored here.
    pub async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path(name)?).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete `name`; false if it was not stored here.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        match fs::remove_file(self.path(name)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of every stored file, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

async fn discard(staged: &Path) {
    if let Err(e) = fs::remove_file(staged).await {
        tracing::debug!("Could not discard {}: {}", staged.display(), e);
    }
}
