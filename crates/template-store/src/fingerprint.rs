//! Fingerprint template files

use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{identity_hash, validate_identity, StoreError, MAX_LOADED_TEMPLATES, MAX_TEMPLATE_LEN};

const TEMPLATE_EXT: &str = "tpl";

/// One file per enrolled finger, named `<sha256>.tpl`, owner-only.
pub struct FingerprintStore {
    root: PathBuf,
}

impl FingerprintStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist a final merged template. Returns the identity the caller
    /// reports to the subscriber.
    pub fn save(&self, template: &[u8]) -> Result<String, StoreError> {
        if template.len() > MAX_TEMPLATE_LEN {
            return Err(StoreError::TooLarge(template.len()));
        }

        let id = identity_hash(template);
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.root)?;

        let path = self.template_path(&id);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;
        file.write_all(template)?;

        debug!(identity = %id, len = template.len(), "fingerprint template saved");
        Ok(id)
    }

    /// Read one template back by identity.
    pub fn load(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        validate_identity(id)?;
        let path = self.template_path(id);
        if !path.is_file() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let bytes = fs::read(&path)?;
        if bytes.len() > MAX_TEMPLATE_LEN {
            return Err(StoreError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    /// Load every persisted template, capped at [`MAX_LOADED_TEMPLATES`]
    /// and ordered by identity so candidate iteration is deterministic.
    /// Unreadable individual files are skipped with a warning rather
    /// than failing the whole verification.
    pub fn load_all(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let dir = match fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut ids: Vec<String> = dir
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == TEMPLATE_EXT))
            .filter_map(|path| {
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(str::to_string)
            })
            .filter(|id| validate_identity(id).is_ok())
            .collect();
        ids.sort();
        ids.truncate(MAX_LOADED_TEMPLATES);

        let mut templates = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(&id) {
                Ok(bytes) => templates.push((id, bytes)),
                Err(err) => warn!(identity = %id, %err, "skipping unreadable template"),
            }
        }
        Ok(templates)
    }

    /// Delete exactly one enrollment.
    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        validate_identity(id)?;
        let path = self.template_path(id);
        if !path.is_file() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        fs::remove_file(&path)?;
        debug!(identity = %id, "fingerprint template removed");
        Ok(())
    }

    fn template_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.{TEMPLATE_EXT}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn store() -> (tempfile::TempDir, FingerprintStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FingerprintStore::new(dir.path().join("fprint"));
        (dir, store)
    }

    #[test]
    fn save_and_load_round_trip_by_content_hash() {
        let (_dir, store) = store();
        let id = store.save(b"merged-template").expect("save");
        assert_eq!(id, identity_hash(b"merged-template"));
        assert_eq!(store.load(&id).expect("load"), b"merged-template");
    }

    #[test]
    fn identical_bytes_enroll_to_the_same_identity() {
        let (_dir, store) = store();
        let first = store.save(b"same-finger").expect("save");
        let second = store.save(b"same-finger").expect("save");
        assert_eq!(first, second);
        assert_eq!(store.load_all().expect("load_all").len(), 1);
    }

    #[test]
    fn remove_deletes_exactly_that_identity() {
        let (_dir, store) = store();
        let keep = store.save(b"keep").expect("save");
        let gone = store.save(b"gone").expect("save");

        store.remove(&gone).expect("remove");
        assert!(matches!(store.load(&gone), Err(StoreError::NotFound(_))));
        assert!(store.load(&keep).is_ok());

        // Deleting again reports the absence.
        assert!(matches!(store.remove(&gone), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn oversized_templates_are_refused() {
        let (_dir, store) = store();
        let huge = vec![0u8; MAX_TEMPLATE_LEN + 1];
        assert!(matches!(store.save(&huge), Err(StoreError::TooLarge(_))));
    }

    #[test]
    fn template_files_are_owner_only() {
        let (_dir, store) = store();
        let id = store.save(b"private").expect("save");
        let meta = fs::metadata(store.root().join(format!("{id}.tpl"))).expect("metadata");
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn load_all_is_sorted_and_ignores_foreign_files() {
        let (_dir, store) = store();
        store.save(b"bbb").expect("save");
        store.save(b"aaa").expect("save");
        fs::write(store.root().join("README"), b"not a template").expect("write");

        let all = store.load_all().expect("load_all");
        assert_eq!(all.len(), 2);
        assert!(all[0].0 < all[1].0);
    }
}
