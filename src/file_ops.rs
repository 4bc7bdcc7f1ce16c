//! Filesystem collaborator used by batch operations and file versioning.
//!
//! Each primitive is atomic at the single-file level at best; nothing here
//! coordinates across files. [`LocalFileSystem`] runs the blocking work on
//! tokio's blocking pool.

use async_trait::async_trait;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use xxhash_rust::xxh3::Xxh3;

use crate::errors::{TaskError, TaskResult};

pub const COPY_BUFFER_SIZE: usize = 8 * 1024 * 1024;
pub const HASH_BUFFER_SIZE: usize = 1024 * 1024;

#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn copy(&self, source: &Path, destination: &Path) -> TaskResult<u64>;
    async fn move_path(&self, source: &Path, destination: &Path) -> TaskResult<()>;
    async fn delete(&self, path: &Path) -> TaskResult<()>;
    /// Content checksum as a lowercase hex string.
    async fn hash(&self, path: &Path) -> TaskResult<String>;
    async fn size(&self, path: &Path) -> TaskResult<u64>;
}

#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub buffer_size: usize,
    pub preserve_metadata: bool,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            buffer_size: COPY_BUFFER_SIZE,
            preserve_metadata: true,
        }
    }
}

pub fn compute_file_hash(path: &Path) -> TaskResult<u64> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(HASH_BUFFER_SIZE, file);
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut hasher = Xxh3::new();

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.digest())
}

pub fn format_hash(hash: u64) -> String {
    format!("{:016x}", hash)
}

/// Copies one regular file, creating parent directories as needed.
pub fn copy_file(source: &Path, dest: &Path, options: &CopyOptions) -> TaskResult<u64> {
    let src_file = File::open(source)?;
    let src_metadata = src_file.metadata()?;

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut dest_file = File::create(dest)?;
    let mut reader = BufReader::with_capacity(options.buffer_size, src_file);
    let mut writer = BufWriter::with_capacity(options.buffer_size, &mut dest_file);

    let mut buffer = vec![0u8; options.buffer_size];
    let mut bytes_copied = 0u64;

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        writer.write_all(&buffer[..bytes_read])?;
        bytes_copied += bytes_read as u64;
    }

    writer.flush()?;
    drop(writer);
    dest_file.sync_all()?;

    if options.preserve_metadata {
        let _ = fs::set_permissions(dest, src_metadata.permissions());
        let _ = filetime::set_file_mtime(
            dest,
            filetime::FileTime::from_system_time(src_metadata.modified()?),
        );
    }

    Ok(bytes_copied)
}

/// Copies a file or a whole directory tree.
pub fn copy_path(source: &Path, dest: &Path, options: &CopyOptions) -> TaskResult<u64> {
    if !source.exists() {
        return Err(TaskError::NotFound(source.display().to_string()));
    }
    if !source.is_dir() {
        return copy_file(source, dest, options);
    }

    let mut total = 0u64;
    for entry in walkdir::WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| TaskError::operation_from("directory walk failed", e))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| {
                TaskError::operation(format!("cannot strip prefix from {:?}", entry.path()))
            })?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            total += copy_file(entry.path(), &target, options)?;
        }
    }
    Ok(total)
}

/// Renames in place when possible, otherwise copies and removes the source.
pub fn move_path(source: &Path, dest: &Path) -> TaskResult<()> {
    if !source.exists() {
        return Err(TaskError::NotFound(source.display().to_string()));
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    match fs::rename(source, dest) {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::debug!(
                source = %source.display(),
                "rename failed ({}), falling back to copy",
                e
            );
            copy_path(source, dest, &CopyOptions::default())?;
            delete_path(source)
        }
    }
}

pub fn delete_path(path: &Path) -> TaskResult<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

pub fn path_size(path: &Path) -> TaskResult<u64> {
    let metadata = fs::metadata(path)?;
    if !metadata.is_dir() {
        return Ok(metadata.len());
    }
    Ok(walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum())
}

/// Local disk implementation of [`FileSystem`].
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystem {
    options: CopyOptions,
}

impl LocalFileSystem {
    pub fn new(options: CopyOptions) -> Self {
        Self { options }
    }
}

async fn blocking<T, F>(f: F) -> TaskResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> TaskResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TaskError::operation_from("blocking file task failed", e))?
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn copy(&self, source: &Path, destination: &Path) -> TaskResult<u64> {
        let (source, destination) = (source.to_path_buf(), destination.to_path_buf());
        let options = self.options.clone();
        blocking(move || copy_path(&source, &destination, &options)).await
    }

    async fn move_path(&self, source: &Path, destination: &Path) -> TaskResult<()> {
        let (source, destination) = (source.to_path_buf(), destination.to_path_buf());
        blocking(move || move_path(&source, &destination)).await
    }

    async fn delete(&self, path: &Path) -> TaskResult<()> {
        let path: PathBuf = path.to_path_buf();
        blocking(move || delete_path(&path)).await
    }

    async fn hash(&self, path: &Path) -> TaskResult<String> {
        let path = path.to_path_buf();
        blocking(move || compute_file_hash(&path).map(format_hash)).await
    }

    async fn size(&self, path: &Path) -> TaskResult<u64> {
        let path = path.to_path_buf();
        blocking(move || path_size(&path)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_content_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, b"hello").unwrap();
        fs::write(&b, b"hello").unwrap();
        assert_eq!(compute_file_hash(&a).unwrap(), compute_file_hash(&b).unwrap());

        fs::write(&b, b"hello!").unwrap();
        assert_ne!(compute_file_hash(&a).unwrap(), compute_file_hash(&b).unwrap());
        assert_eq!(format_hash(0xab).len(), 16);
    }

    #[test]
    fn copies_directory_trees() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("one.txt"), b"1").unwrap();
        fs::write(src.join("nested").join("two.txt"), b"22").unwrap();

        let dest = dir.path().join("dest");
        let copied = copy_path(&src, &dest, &CopyOptions::default()).unwrap();
        assert_eq!(copied, 3);
        assert_eq!(fs::read(dest.join("nested").join("two.txt")).unwrap(), b"22");
        assert_eq!(path_size(&dest).unwrap(), 3);
    }

    #[test]
    fn move_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("file.bin");
        fs::write(&src, b"data").unwrap();
        let dest = dir.path().join("sub").join("file.bin");

        move_path(&src, &dest).unwrap();
        assert!(!src.exists());
        assert!(dest.exists());

        delete_path(&dest).unwrap();
        assert!(!dest.exists());
        assert!(delete_path(&dest).is_err());
    }

    #[tokio::test]
    async fn local_filesystem_runs_on_blocking_pool() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("x.txt");
        fs::write(&src, b"abc").unwrap();

        let local = LocalFileSystem::default();
        let dest = dir.path().join("y.txt");
        assert_eq!(local.copy(&src, &dest).await.unwrap(), 3);
        assert_eq!(local.hash(&src).await.unwrap(), local.hash(&dest).await.unwrap());
        assert_eq!(local.size(&dest).await.unwrap(), 3);
    }
}
