//! Identity store backed by a directory of JSON files.

use rollcall_core::{Identity, IdentityStore, StoreError};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const EXTENSION: &str = "json";

/// One `<id>.json` file per identity.
pub struct FaceStore {
    dir: PathBuf,
}

impl FaceStore {
    /// Open (and create if needed) the faces directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, identity_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !identity_id.is_empty()
            && !identity_id.starts_with('.')
            && identity_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(StoreError::InvalidId(identity_id.to_string()));
        }
        Ok(self.dir.join(format!("{identity_id}.{EXTENSION}")))
    }

    fn read_one(path: &Path) -> Result<Identity, StoreError> {
        let bytes = fs::read(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Malformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

impl IdentityStore for FaceStore {
    /// Identities in file-name order. Unreadable records are skipped.
    fn load_all(&self) -> Result<Vec<Identity>, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|e| e == EXTENSION))
            .collect();
        paths.sort();

        let mut identities = Vec::with_capacity(paths.len());
        for path in paths {
            match Self::read_one(&path) {
                Ok(identity) => identities.push(identity),
                Err(e) => tracing::warn!(error = %e, "skipping identity record"),
            }
        }
        tracing::debug!(dir = %self.dir.display(), count = identities.len(), "loaded identities");
        Ok(identities)
    }

    fn persist(&self, identity: &Identity) -> Result<(), StoreError> {
        let path = self.path_for(&identity.id)?;
        let tmp = self.dir.join(format!(".{}.tmp", identity.id));
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StoreError::Io { path, source }
        };

        let body = serde_json::to_vec_pretty(identity).map_err(|e| StoreError::Malformed {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let mut file = fs::File::create(&tmp).map_err(io_err(&tmp))?;
        file.write_all(&body).map_err(io_err(&tmp))?;
        file.sync_all().map_err(io_err(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_err(&path))?;

        tracing::info!(id = %identity.id, vectors = identity.embeddings.len(), "identity saved");
        Ok(())
    }

    fn delete(&self, identity_id: &str) -> Result<bool, StoreError> {
        let path = self.path_for(identity_id)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(id = identity_id, "identity removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}
