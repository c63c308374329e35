use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

/// Flat key/value file storage rooted at a directory.
pub trait StorageManager: Send + Sync {
    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()>;
    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>>;
    fn exists(&self, ident: &str) -> bool;
    fn delete(&self, ident: &str) -> std::io::Result<()>;
}

#[derive(Clone, Debug)]
pub struct BackendLocal {
    base_dir: PathBuf,
}

impl BackendLocal {
    pub fn new(storage_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let base_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(BackendLocal { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path(&self, ident: &str) -> PathBuf {
        self.base_dir.join(ident)
    }
}

impl StorageManager for BackendLocal {
    fn exists(&self, ident: &str) -> bool {
        std::fs::metadata(self.path(ident)).is_ok()
    }

    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.path(ident))
    }

    /// Readers observe either the previous or the new content, never a torn file.
    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()> {
        let path = self.path(ident);
        let temp_path = self.path(&format!(
            ".{}-{ident}.tmp",
            rusty_ulid::generate_ulid_string()
        ));

        let result = (|| {
            let mut file = File::create(&temp_path)?;
            file.write_all(data)?;
            file.sync_all()
        })();

        if let Err(err) = result {
            let _ = std::fs::remove_file(&temp_path);
            return Err(err);
        }

        std::fs::rename(&temp_path, &path)
    }

    fn delete(&self, ident: &str) -> std::io::Result<()> {
        std::fs::remove_file(self.path(ident))
    }
}
