use std::path::{Path, PathBuf};
use std::fs;
use crate::core::error::Result;

/// Directory holding one `<database>.db` file per database
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub base_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir)?;
        Ok(StorageLayout { base_dir })
    }

    pub fn database_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{}.db", name))
    }

    /// `(name, path)` of every `*.db` file, sorted by name.
    pub fn discover(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("db") {
                continue;
            }
            if let Some(name) = database_name(&path) {
                found.push((name, path));
            }
        }
        found.sort();
        Ok(found)
    }
}

/// Database name a backing file stands for: its file stem.
pub fn database_name(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
