//! Local directory backend: one file per block under `root/location/`.

use crate::backend::ObjectBackend;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use log::warn;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub struct LocalFsBackend {
    root: PathBuf,
}

impl LocalFsBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn object_dir(&self, location: &str) -> PathBuf {
        self.root.join(location)
    }

    fn block_path(&self, location: &str, block_index: u64) -> PathBuf {
        self.object_dir(location).join(block_index.to_string())
    }
}

#[async_trait]
impl ObjectBackend for LocalFsBackend {
    async fn fetch_block(
        &self,
        location: &str,
        block_index: u64,
        _block_size: u32,
    ) -> Result<Option<Bytes>> {
        match fs::read(self.block_path(location, block_index)).await {
            Ok(buf) => Ok(Some(Bytes::from(buf))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_blocks(&self, location: &str, blocks: &[(u64, Bytes)]) -> Result<usize> {
        fs::create_dir_all(self.object_dir(location)).await?;
        let mut acked = 0;
        for (index, data) in blocks {
            let write = async {
                let mut f = fs::File::create(self.block_path(location, *index)).await?;
                f.write_all(data).await?;
                f.flush().await?;
                Ok::<_, std::io::Error>(())
            };
            match write.await {
                Ok(()) => acked += 1,
                Err(e) if acked > 0 => {
                    warn!("block write to {location}/{index} failed after {acked} acks: {e}");
                    return Ok(acked);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(acked)
    }

    async fn remove_blocks_from(&self, location: &str, from_index: u64) -> Result<()> {
        let dir = self.object_dir(location);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(index) = name.to_str().and_then(|s| s.parse::<u64>().ok()) else {
                continue;
            };
            if index >= from_index {
                fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }

    async fn delete_object(&self, location: &str) -> Result<()> {
        match fs::remove_dir_all(self.object_dir(location)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
