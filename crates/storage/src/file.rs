use std::path::{Path, PathBuf};

use snafu::{ResultExt, ensure};

use super::KeyValueStore;
use super::error::{
    CreateStoreDirectorySnafu, InvalidKeySnafu, ReadValueSnafu, RemoveValueSnafu,
    RenameTempFileSnafu, StorageResult, WriteValueSnafu,
};

const VALUE_EXTENSION: &str = "json";

/// Directory-backed store keeping one document per key.
///
/// Writes go through a sibling temporary file followed by a rename, so a
/// crash mid-write leaves the previous value readable.
#[derive(Debug, Clone)]
pub struct FileStore {
    directory: PathBuf,
}

impl FileStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn value_path(&self, key: &str, stage: &'static str) -> StorageResult<PathBuf> {
        ensure!(
            !key.is_empty()
                && key
                    .chars()
                    .all(|character| character.is_ascii_alphanumeric() || "-_.".contains(character))
                && !key.starts_with('.'),
            InvalidKeySnafu { stage, key }
        );

        Ok(self.directory.join(format!("{key}.{VALUE_EXTENSION}")))
    }

    fn ensure_directory(&self) -> StorageResult<()> {
        std::fs::create_dir_all(&self.directory).context(CreateStoreDirectorySnafu {
            stage: "create-store-directory",
            path: display_path(&self.directory),
        })
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let path = self.value_path(key, "file-get-path")?;

        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(source).context(ReadValueSnafu {
                stage: "file-get-read",
                key,
                path: display_path(&path),
            }),
        }
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let path = self.value_path(key, "file-set-path")?;
        self.ensure_directory()?;

        let temp_path = path.with_extension(format!("{VALUE_EXTENSION}.tmp"));
        std::fs::write(&temp_path, value).context(WriteValueSnafu {
            stage: "file-set-write-temporary",
            key,
            path: display_path(&temp_path),
        })?;

        std::fs::rename(&temp_path, &path).context(RenameTempFileSnafu {
            stage: "file-set-rename-temporary",
            from: display_path(&temp_path),
            to: display_path(&path),
        })?;

        tracing::debug!(key = %key, path = %path.display(), bytes = value.len(), "stored value");
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let path = self.value_path(key, "file-remove-path")?;

        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(key = %key, "removed stored value");
                Ok(())
            }
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(source).context(RemoveValueSnafu {
                stage: "file-remove",
                key,
                path: display_path(&path),
            }),
        }
    }
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}
