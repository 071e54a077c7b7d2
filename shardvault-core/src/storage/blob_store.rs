use crate::error::{Result, VaultError};
use crate::storage::shard::{ShardKey, is_shard_component};
use crate::storage::sidecar::SIDECAR_EXTENSION;
use bytes::Bytes;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

const TEMP_EXTENSION: &str = "tmp";
const SIDECAR_LOCK_STRIPES: usize = 64;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// BlobStore keeps object bytes and sidecars on disk.
/// Layout: {base}/{shard1}/{shard2}/{sequence}.{ext} with {sequence}.json beside it.
pub struct BlobStore {
    base_path: PathBuf,
    sidecar_locks: Vec<Mutex<()>>,
}

/// A file found while walking the shard tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub shard: ShardKey,
    pub filename: String,
    pub path: PathBuf,
    pub len: u64,
}

impl ScannedFile {
    pub fn relative_path(&self) -> String {
        format!("{}/{}", self.shard, self.filename)
    }

    pub fn is_sidecar(&self) -> bool {
        Path::new(&self.filename)
            .extension()
            .is_some_and(|ext| ext == SIDECAR_EXTENSION)
    }
}

impl BlobStore {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_path)?;
        let sidecar_locks = (0..SIDECAR_LOCK_STRIPES).map(|_| Mutex::new(())).collect();
        Ok(Self {
            base_path,
            sidecar_locks,
        })
    }

    /// Get the base path for the store
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn shard_dir(&self, shard: &ShardKey) -> PathBuf {
        self.base_path.join(&shard.shard1).join(&shard.shard2)
    }

    pub fn blob_path(&self, shard: &ShardKey, filename: &str) -> PathBuf {
        self.shard_dir(shard).join(filename)
    }

    /// Sidecar path for an object file: same stem, `.json` extension.
    pub fn sidecar_path(&self, shard: &ShardKey, filename: &str) -> PathBuf {
        self.blob_path(shard, filename)
            .with_extension(SIDECAR_EXTENSION)
    }

    /// Write object bytes. Fails if a file already exists at the target.
    pub fn put_blob(&self, shard: &ShardKey, filename: &str, data: &Bytes) -> Result<PathBuf> {
        let blob_path = self.blob_path(shard, filename);
        self.write_new(&blob_path, data)
            .map_err(|source| VaultError::BlobWrite {
                path: blob_path.clone(),
                source,
            })?;

        tracing::debug!(
            "Stored blob {} ({} bytes) in shard {}",
            filename,
            data.len(),
            shard
        );
        Ok(blob_path)
    }

    fn write_new(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = temp_path_for(path);
        write_synced(&temp_path, data)?;

        // hard_link refuses to replace an existing target, unlike rename.
        let linked = fs::hard_link(&temp_path, path);
        let _ = fs::remove_file(&temp_path);
        linked
    }

    /// Held from loading an object's rows until its sidecar is renamed into
    /// place, so the last rename always carries the latest committed rows.
    pub fn lock_sidecar(&self, object_id: i64) -> Result<MutexGuard<'_, ()>> {
        let stripe = object_id.rem_euclid(self.sidecar_locks.len() as i64) as usize;
        self.sidecar_locks[stripe]
            .lock()
            .map_err(|_| VaultError::Internal("sidecar lock poisoned".to_string()))
    }

    /// Write or replace a sidecar atomically.
    pub fn put_sidecar(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = temp_path_for(path);
        write_synced(&temp_path, data)?;
        fs::rename(&temp_path, path)
    }

    pub fn get_blob(&self, shard: &ShardKey, filename: &str) -> io::Result<Bytes> {
        let data = fs::read(self.blob_path(shard, filename))?;
        Ok(Bytes::from(data))
    }

    pub fn exists(&self, shard: &ShardKey, filename: &str) -> bool {
        self.blob_path(shard, filename).exists()
    }

    /// Remove a blob written by a write that lost a race. Missing files are fine.
    pub fn remove_blob(&self, shard: &ShardKey, filename: &str) -> Result<()> {
        let path = self.blob_path(shard, filename);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Every regular file under `{base}/{xx}/{yy}/`, sorted by path.
    /// Temp files and directories that are not shard levels are skipped.
    pub fn scan(&self) -> Result<Vec<ScannedFile>> {
        let mut files = Vec::new();

        for shard1 in shard_subdirs(&self.base_path)? {
            for shard2 in shard_subdirs(&self.base_path.join(&shard1))? {
                let shard = ShardKey::new(shard1.clone(), shard2);
                let dir = self.shard_dir(&shard);

                for entry in fs::read_dir(&dir)? {
                    let entry = entry?;
                    if !entry.file_type()?.is_file() {
                        continue;
                    }
                    let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                        continue;
                    };
                    if name.ends_with(&format!(".{}", TEMP_EXTENSION)) {
                        continue;
                    }
                    files.push(ScannedFile {
                        shard: shard.clone(),
                        filename: name,
                        path: entry.path(),
                        len: entry.metadata()?.len(),
                    });
                }
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    let unique = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    name.push(format!(".{}-{}.{}", std::process::id(), unique, TEMP_EXTENSION));
    path.with_file_name(name)
}

fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

fn shard_subdirs(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if is_shard_component(name) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}
