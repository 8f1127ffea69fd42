use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::error::{Result, StorageError};

fn wrap(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Abstracts the filesystem primitives the atomic-write sequence needs, so
/// the sequence itself (tmp write, fsync file, rename, fsync parent dir) can
/// be exercised with a fake in tests without touching a real disk.
pub trait ArtifactIo: Send + Sync + 'static {
    fn write_tmp(&self, path: &Path, bytes: &[u8]) -> Result<()>;
    fn fsync_file(&self, path: &Path) -> Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    fn fsync_dir(&self, dir: &Path) -> Result<()>;
    fn file_len(&self, path: &Path) -> Result<u64>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FsArtifactIo;

impl ArtifactIo for FsArtifactIo {
    fn write_tmp(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut f = File::create(path).map_err(|e| wrap(path, e))?;
        f.write_all(bytes).map_err(|e| wrap(path, e))?;
        Ok(())
    }

    fn fsync_file(&self, path: &Path) -> Result<()> {
        let f = File::open(path).map_err(|e| wrap(path, e))?;
        f.sync_all().map_err(|e| wrap(path, e))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        std::fs::rename(from, to).map_err(|e| wrap(to, e))
    }

    fn fsync_dir(&self, dir: &Path) -> Result<()> {
        let f = File::open(dir).map_err(|e| wrap(dir, e))?;
        f.sync_all().map_err(|e| wrap(dir, e))
    }

    fn file_len(&self, path: &Path) -> Result<u64> {
        std::fs::metadata(path).map(|m| m.len()).map_err(|e| wrap(path, e))
    }
}

/// Writes `bytes` to `path` with the write-tmp/fsync/rename/fsync-dir
/// sequence that makes a crash between any two steps leave either the old
/// content or the new content on disk, never a partial file.
pub fn atomic_write(io: &dyn ArtifactIo, path: &Path, bytes: &[u8]) -> Result<u64> {
    let dir = path.parent().ok_or_else(|| StorageError::Io {
        path: path.display().to_string(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "artifact path has no parent"),
    })?;
    std::fs::create_dir_all(dir).map_err(|e| wrap(dir, e))?;
    let tmp_path = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("bin")
    ));
    io.write_tmp(&tmp_path, bytes)?;
    io.fsync_file(&tmp_path)?;
    io.rename(&tmp_path, path)?;
    io.fsync_dir(dir)?;
    io.file_len(path)
}
