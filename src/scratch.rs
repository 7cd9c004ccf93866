use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::debug;

use crate::model::{self, FileDescriptor};

/// Working directory for transient media files. Names are fresh UUIDs, so
/// collisions cannot happen; durability comes from the job store, not from
/// this directory.
#[derive(Debug, Clone)]
pub struct ScratchStore {
    dir: PathBuf,
}

impl ScratchStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating scratch directory {:?}", dir))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(dir, fs::Permissions::from_mode(0o755))?;
            }
        }
        let dir = dir
            .canonicalize()
            .with_context(|| format!("resolving scratch directory {:?}", dir))?;
        debug!("scratch directory {:?}", dir);
        Ok(Self { dir })
    }

    /// Assigns a fresh path to the descriptor. Fails if one is already set.
    pub fn new_path(&self, file: &mut FileDescriptor, ext: &str) -> Result<()> {
        if !file.path.is_empty() {
            return Err(anyhow!("file path is already assigned"));
        }
        let mut name = model::new_id();
        if !ext.is_empty() {
            name.push('.');
            name.push_str(ext);
        }
        file.path = self.dir.join(name).to_string_lossy().into_owned();
        Ok(())
    }

    /// Allocates a path and opens it write-only. The returned handle is a
    /// blocking `File` so container muxers can seek back into the header.
    pub fn new_writer(&self, file: &mut FileDescriptor, ext: &str) -> Result<fs::File> {
        self.new_path(file, ext)?;
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o644);
        }
        options
            .open(&file.path)
            .with_context(|| format!("opening scratch file {}", file.path))
    }

    pub async fn new_reader(&self, file: &FileDescriptor) -> Result<tokio::fs::File> {
        if file.path.is_empty() {
            return Err(anyhow!("file path is empty"));
        }
        tokio::fs::File::open(&file.path)
            .await
            .with_context(|| format!("opening scratch file {}", file.path))
    }

    pub fn delete(&self, file: &FileDescriptor) -> Result<()> {
        if file.path.is_empty() {
            return Err(anyhow!("file path is empty"));
        }
        fs::remove_file(&file.path)
            .with_context(|| format!("removing scratch file {}", file.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn writer_assigns_path_exactly_once() {
        let tmp = TempDir::new().unwrap();
        let store = ScratchStore::new(tmp.path()).unwrap();
        let mut file = FileDescriptor::default();

        let mut writer = store.new_writer(&mut file, "raw").unwrap();
        assert!(file.path.ends_with(".raw"));
        assert!(Path::new(&file.path).is_absolute());
        writer.write_all(b"media").unwrap();

        let err = store.new_writer(&mut file, "raw").unwrap_err();
        assert!(err.to_string().contains("already assigned"));
    }

    #[tokio::test]
    async fn reader_sees_written_bytes() {
        use tokio::io::AsyncReadExt;

        let tmp = TempDir::new().unwrap();
        let store = ScratchStore::new(tmp.path()).unwrap();
        let mut file = FileDescriptor::default();
        store.new_writer(&mut file, "raw").unwrap().write_all(b"abc").unwrap();

        let mut reader = store.new_reader(&file).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abc");
    }

    #[test]
    fn delete_requires_a_path() {
        let tmp = TempDir::new().unwrap();
        let store = ScratchStore::new(tmp.path()).unwrap();
        let file = FileDescriptor::default();
        assert!(store.delete(&file).is_err());
    }

    #[test]
    fn delete_removes_the_file() {
        let tmp = TempDir::new().unwrap();
        let store = ScratchStore::new(tmp.path()).unwrap();
        let mut file = FileDescriptor::default();
        store.new_writer(&mut file, "mp4").unwrap();
        assert!(Path::new(&file.path).exists());

        store.delete(&file).unwrap();
        assert!(!Path::new(&file.path).exists());
        assert!(store.delete(&file).is_err());
    }

    #[test]
    fn paths_are_unique() {
        let tmp = TempDir::new().unwrap();
        let store = ScratchStore::new(tmp.path()).unwrap();
        let mut a = FileDescriptor::default();
        let mut b = FileDescriptor::default();
        store.new_path(&mut a, "raw").unwrap();
        store.new_path(&mut b, "raw").unwrap();
        assert_ne!(a.path, b.path);
    }
}
