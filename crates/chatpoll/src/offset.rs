//! Persists the last-consumed chat update sequence number between polls.
//! A single plaintext integer, atomically written (temp file + rename) —
//! the same crash-safety idiom the pulse store uses for its JSON snapshot,
//! simplified here since there's only one number to persist.

use std::path::{Path, PathBuf};

use tracing::warn;

pub struct OffsetStore {
    path: PathBuf,
}

impl OffsetStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Best-effort load: a missing or unparseable file starts from zero
    /// rather than failing the process.
    pub fn load(&self) -> u64 {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw.trim().parse().unwrap_or_else(|e| {
                warn!(error = %e, path = ?self.path, "offset file unparseable, starting from 0");
                0
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => {
                warn!(error = %e, path = ?self.path, "failed to read offset file, starting from 0");
                0
            }
        }
    }

    pub fn save(&self, offset: u64) -> std::io::Result<()> {
        write_atomically(&self.path, offset)
    }
}

fn write_atomically(path: &Path, offset: u64) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, offset.to_string())?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = OffsetStore::new(dir.path().join("offset"));
        assert_eq!(store.load(), 0);
    }

    #[test]
    fn saves_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = OffsetStore::new(dir.path().join("offset"));
        store.save(42).unwrap();
        assert_eq!(store.load(), 42);
    }

    #[test]
    fn corrupt_file_loads_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offset");
        std::fs::write(&path, "not-a-number").unwrap();
        let store = OffsetStore::new(path);
        assert_eq!(store.load(), 0);
    }
}
