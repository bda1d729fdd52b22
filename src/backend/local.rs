//! Local filesystem storage backend.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use super::StorageBackend;
use crate::error::{Error, Result};

/// A storage backend using the local filesystem.
///
/// All keys are `/`-separated paths relative to the configured root. The
/// registry uses it both to enumerate local dataset roots and to write
/// downloaded object-store pieces into the local cache directory.
///
/// # Example
///
/// ```no_run
/// use parcela::backend::LocalBackend;
///
/// let backend = LocalBackend::new("/data/events").unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Creates a new local backend with the given root directory.
    ///
    /// Creates the directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or accessed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| Error::io(e, &root))?;
        Ok(Self { root })
    }

    /// Opens an existing directory without creating it.
    ///
    /// # Errors
    ///
    /// Returns an error if `root` is not a directory.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(Error::io(
                std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
                &root,
            ));
        }
        Ok(Self { root })
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a key to a full filesystem path.
    pub fn resolve_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl StorageBackend for LocalBackend {
    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(true) {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                match e.into_io_error() {
                    Some(io) => Error::io(io, path),
                    None => Error::storage(format!("Filesystem loop at {}", path.display())),
                }
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                results.push(key);
            }
        }
        results.sort();
        Ok(results)
    }

    fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.resolve_path(key);
        let data = fs::read(&path).map_err(|e| Error::io(e, &path))?;
        Ok(Bytes::from(data))
    }

    fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.resolve_path(key);

        let parent = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent).map_err(|e| Error::io(e, parent))?;

        // Unique temp file per writer, renamed over the target when complete.
        let mut tmp = NamedTempFile::new_in(parent).map_err(|e| Error::io(e, parent))?;
        tmp.write_all(&data).map_err(|e| Error::io(e, tmp.path()))?;
        match tmp.persist(&path) {
            Ok(_) => Ok(()),
            // Another writer of the same key won the race.
            Err(_) if path.is_file() => Ok(()),
            Err(e) => Err(Error::io(e.error, &path)),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve_path(key);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| Error::io(e, &path))?;
        }
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.resolve_path(key).exists())
    }

    fn size(&self, key: &str) -> Result<u64> {
        let path = self.resolve_path(key);
        let metadata = fs::metadata(&path).map_err(|e| Error::io(e, &path))?;
        Ok(metadata.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let temp_dir = tempfile::tempdir()
            .ok()
            .unwrap_or_else(|| panic!("Should create temp dir"));
        let backend = LocalBackend::new(temp_dir.path())
            .ok()
            .unwrap_or_else(|| panic!("Should create backend"));
        (temp_dir, backend)
    }

    #[test]
    fn test_put_and_get() {
        let (_dir, backend) = backend();
        let data = Bytes::from("hello world");
        backend
            .put("test.parquet", data.clone())
            .ok()
            .unwrap_or_else(|| panic!("Should put data"));

        let retrieved = backend
            .get("test.parquet")
            .ok()
            .unwrap_or_else(|| panic!("Should get data"));
        assert_eq!(retrieved, data);
        assert_eq!(backend.size("test.parquet").ok(), Some(11));
    }

    #[test]
    fn test_list_is_recursive_and_uses_forward_slashes() {
        let (_dir, backend) = backend();
        for key in [
            "date=2020-01-02/part-1.parquet",
            "date=2020-01-01/part-0.parquet",
            "other.txt",
        ] {
            backend
                .put(key, Bytes::from("x"))
                .ok()
                .unwrap_or_else(|| panic!("Should put nested data"));
        }

        let all = backend
            .list("")
            .ok()
            .unwrap_or_else(|| panic!("Should list"));
        assert_eq!(
            all,
            vec![
                "date=2020-01-01/part-0.parquet".to_string(),
                "date=2020-01-02/part-1.parquet".to_string(),
                "other.txt".to_string(),
            ]
        );

        let dated = backend
            .list("date=2020-01-02")
            .ok()
            .unwrap_or_else(|| panic!("Should list with prefix"));
        assert_eq!(dated.len(), 1);
    }

    #[test]
    fn test_delete_and_exists() {
        let (_dir, backend) = backend();
        backend
            .put("a/b.parquet", Bytes::from("x"))
            .ok()
            .unwrap_or_else(|| panic!("Should put"));
        assert_eq!(backend.exists("a/b.parquet").ok(), Some(true));
        backend
            .delete("a/b.parquet")
            .ok()
            .unwrap_or_else(|| panic!("Should delete"));
        assert_eq!(backend.exists("a/b.parquet").ok(), Some(false));
        assert!(backend.delete("missing").is_ok());
    }

    #[test]
    fn test_concurrent_puts_of_one_key() {
        let (_dir, backend) = backend();
        let data = Bytes::from(vec![7u8; 64 * 1024]);
        let barrier = std::sync::Barrier::new(8);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    barrier.wait();
                    backend
                        .put("site=a/part-0.parquet", data.clone())
                        .ok()
                        .unwrap_or_else(|| panic!("Should put concurrently"));
                });
            }
        });
        assert_eq!(backend.get("site=a/part-0.parquet").ok(), Some(data));
        assert_eq!(
            backend.list("").ok(),
            Some(vec!["site=a/part-0.parquet".to_string()])
        );
    }

    #[test]
    fn test_open_requires_directory() {
        let (dir, _backend) = backend();
        assert!(LocalBackend::open(dir.path()).is_ok());
        assert!(LocalBackend::open(dir.path().join("nope")).is_err());
    }
}
