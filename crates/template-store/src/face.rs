//! Face sample directories

use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use image::RgbImage;
use tracing::debug;

use crate::{identity_hash, validate_identity, StoreError};

/// One directory per enrolled face, keyed by the hash of the first
/// accepted sample, holding numbered PNG files (`0.png`, `1.png`, ...).
pub struct FaceStore {
    root: PathBuf,
}

impl FaceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist a completed sample set. The identity is derived from the
    /// first sample's raw pixels, never from later ones.
    pub fn save_samples(&self, samples: &[RgbImage]) -> Result<String, StoreError> {
        let first = samples
            .first()
            .ok_or_else(|| StoreError::NotFound("empty sample set".to_string()))?;
        let id = identity_hash(first.as_raw());

        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.root)?;
        let dir = self.root.join(&id);
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&dir)?;

        for (index, sample) in samples.iter().enumerate() {
            sample.save(dir.join(format!("{index}.png")))?;
        }

        debug!(identity = %id, count = samples.len(), "face samples saved");
        Ok(id)
    }

    /// Paths of every stored image for one identity, in sample order.
    pub fn list_images(&self, id: &str) -> Result<Vec<PathBuf>, StoreError> {
        validate_identity(id)?;
        let dir = self.root.join(id);
        if !dir.is_dir() {
            return Err(StoreError::NotFound(id.to_string()));
        }

        let mut indexed: Vec<(u32, PathBuf)> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter_map(|path| {
                let index = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| stem.parse::<u32>().ok())?;
                Some((index, path))
            })
            .collect();
        indexed.sort_by_key(|(index, _)| *index);

        Ok(indexed.into_iter().map(|(_, path)| path).collect())
    }

    /// Decode every stored image for one identity, in sample order.
    pub fn load_images(&self, id: &str) -> Result<Vec<RgbImage>, StoreError> {
        let mut images = Vec::new();
        for path in self.list_images(id)? {
            images.push(image::open(&path)?.to_rgb8());
        }
        Ok(images)
    }

    /// Delete exactly one enrollment directory.
    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        validate_identity(id)?;
        let dir = self.root.join(id);
        if !dir.is_dir() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        fs::remove_dir_all(&dir)?;
        debug!(identity = %id, "face enrollment removed");
        Ok(())
    }
}
