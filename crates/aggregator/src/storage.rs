use crate::{Error, Result};
use mockall::automock;
use std::{
    fs::{self, File},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

pub const NAME_CACHE_KEY: &str = "name_cache";
pub const STATS_CACHE_KEY: &str = "stats_cache";

/// Durable key → blob store. Calls block; run them off the async workers.
#[automock]
pub trait Storage: Send + Sync {
    /// Returns `None` when nothing was ever stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
}

/// One JSON file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| Error::StorageIo {
            key: dir.display().to_string(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(Error::StorageIo {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        let temp_path = path.with_extension("json.tmp");
        let io_err = |source| Error::StorageIo {
            key: key.to_string(),
            source,
        };

        let mut file = File::create(&temp_path).map_err(io_err)?;
        file.write_all(value).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        // Readers only ever see a complete record
        fs::rename(&temp_path, &path).map_err(io_err)
    }
}

/// Deserializes a stored record, treating absence as an empty value.
pub fn load_record<T>(storage: &dyn Storage, key: &str) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    match storage.get(key)? {
        Some(bytes) => serde_json::from_slice(&bytes).map_err(|source| Error::CorruptRecord {
            key: key.to_string(),
            source,
        }),
        None => Ok(T::default()),
    }
}
