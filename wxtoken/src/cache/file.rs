//! A file-backed token cache

use std::{io, path::PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;

use super::{CacheError, PersistedCredential, PersistentCache};

/// A token cache holding a single record in a local file
#[derive(Debug)]
pub struct FileCache {
    path: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct FileRecord {
    key: String,
    #[serde(flatten)]
    record: PersistedCredential,
}

impl FileCache {
    /// Constructs a new file cache
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_record(&self) -> io::Result<Option<FileRecord>> {
        use tokio::io::AsyncReadExt;

        let mut file = match OpenOptions::new().read(true).open(&self.path).await {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error),
        };

        let mut data = String::new();
        file.read_to_string(&mut data).await?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    async fn write_record(&self, record: &FileRecord) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;

        let mut file_opts = OpenOptions::new();

        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let mut file = file_opts.open(&self.path).await?;
        let data = serde_json::to_string_pretty(record)?;
        file.write_all(data.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl PersistentCache for FileCache {
    async fn load(&self, key: &str) -> Result<Option<PersistedCredential>, CacheError> {
        let record = self.read_record().await?;

        Ok(match record {
            Some(r) if r.key == key => Some(r.record),
            Some(r) => {
                tracing::debug!(
                    path = %self.path.display(),
                    found = %r.key,
                    wanted = key,
                    "cache file holds a token for another key"
                );
                None
            }
            None => None,
        })
    }

    async fn store(&self, key: &str, record: &PersistedCredential) -> Result<(), CacheError> {
        let record = FileRecord {
            key: key.to_owned(),
            record: record.clone(),
        };
        Ok(self.write_record(&record).await?)
    }
}
