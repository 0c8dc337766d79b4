//! Backend discovery and failover registry
//!
//! Scans a plugin directory for backend manifests at startup, then hands
//! out one opened device at a time. The last backend that opened
//! successfully stays "active" and is retried first on the next open;
//! when it fails, every other discovered backend is probed once, in
//! discovery order, before giving up with `NoDevice`. Device fleets vary
//! between machines, so callers never pick a vendor themselves.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{drivers, Backend, BackendError, Device};

/// One backend manifest file in the plugin directory.
#[derive(Debug, Deserialize)]
struct Manifest {
    /// Driver name resolved against the built-in driver table.
    driver: String,
}

struct Entry {
    path: PathBuf,
    backend: Arc<dyn Backend>,
}

/// An opened reader paired with the backend that produced it. The worker
/// that runs a session owns this; `close` consumes it so the handle is
/// closed exactly once.
pub struct ActiveDevice {
    pub backend: Arc<dyn Backend>,
    pub device: Box<dyn Device>,
}

impl ActiveDevice {
    /// Close the reader and release the backend's SDK resources.
    pub fn close(mut self) -> Result<(), BackendError> {
        let closed = self.device.close();
        let finalized = self.backend.finalize();
        closed.and(finalized)
    }
}

impl fmt::Debug for ActiveDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveDevice")
            .field("backend", &self.backend.name())
            .finish_non_exhaustive()
    }
}

/// Owns every discovered backend and tracks which one is active.
pub struct Registry {
    entries: Vec<Entry>,
    active: Option<usize>,
}

impl Registry {
    /// Scan `plugin_dir` for `*.toml` manifests and instantiate the
    /// backend each one names. A manifest naming a driver missing from
    /// the driver table is rejected here, before any device is touched.
    pub fn discover(plugin_dir: &Path) -> Self {
        let mut paths: Vec<PathBuf> = match fs::read_dir(plugin_dir) {
            Ok(dir) => dir
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
                .collect(),
            Err(err) => {
                warn!(dir = %plugin_dir.display(), %err, "cannot read backend plugin directory");
                Vec::new()
            }
        };
        // Directory iteration order is not stable; discovery order is.
        paths.sort();

        let mut entries = Vec::new();
        for path in paths {
            if let Some(backend) = load_manifest(&path) {
                entries.push(Entry { path, backend });
            }
        }

        info!(count = entries.len(), "discovered fingerprint backends");
        Self {
            entries,
            active: None,
        }
    }

    /// Build a registry from already-constructed backends, bypassing the
    /// manifest scan. Used by tests and single-vendor deployments.
    pub fn with_backends(backends: Vec<Arc<dyn Backend>>) -> Self {
        let entries = backends
            .into_iter()
            .map(|backend| Entry {
                path: PathBuf::from(backend.name()),
                backend,
            })
            .collect();
        Self {
            entries,
            active: None,
        }
    }

    /// Number of discovered backends.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Name of the currently active backend, if any.
    pub fn active_name(&self) -> Option<&str> {
        self.active.map(|idx| self.entries[idx].backend.name())
    }

    /// Open a device, preferring the sticky active backend and failing
    /// over across the rest in discovery order. No backend is probed
    /// twice within one call.
    pub fn open(&mut self) -> Result<ActiveDevice, BackendError> {
        let previously_active = self.active;

        if let Some(idx) = previously_active {
            let entry = &self.entries[idx];
            match probe(entry.backend.as_ref()) {
                Ok(device) => {
                    debug!(backend = entry.backend.name(), "reopened active backend");
                    return Ok(ActiveDevice {
                        backend: Arc::clone(&entry.backend),
                        device,
                    });
                }
                Err(err) => {
                    debug!(backend = entry.backend.name(), %err, "active backend lost its device");
                }
            }
        }

        for (idx, entry) in self.entries.iter().enumerate() {
            if previously_active == Some(idx) {
                continue;
            }
            match probe(entry.backend.as_ref()) {
                Ok(device) => {
                    info!(
                        backend = entry.backend.name(),
                        manifest = %entry.path.display(),
                        "fingerprint backend activated"
                    );
                    self.active = Some(idx);
                    return Ok(ActiveDevice {
                        backend: Arc::clone(&entry.backend),
                        device,
                    });
                }
                Err(err) => {
                    debug!(backend = entry.backend.name(), %err, "backend probe failed");
                }
            }
        }

        self.active = None;
        Err(BackendError::NoDevice)
    }
}

/// Load, enumerate and open one backend. Backends that fail are
/// finalized again before the error is returned so nothing stays
/// half-initialized across probes.
fn probe(backend: &dyn Backend) -> Result<Box<dyn Device>, BackendError> {
    backend.init()?;

    let count = match backend.device_count() {
        Ok(count) => count,
        Err(err) => {
            let _ = backend.finalize();
            return Err(err);
        }
    };
    if count == 0 {
        let _ = backend.finalize();
        return Err(BackendError::NoDevice);
    }

    for index in 0..count {
        if let Some(device) = backend.open_device(index) {
            return Ok(device);
        }
    }

    let _ = backend.finalize();
    Err(BackendError::OpenDeviceFail)
}

fn load_manifest(path: &Path) -> Option<Arc<dyn Backend>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(manifest = %path.display(), %err, "cannot read backend manifest");
            return None;
        }
    };

    let manifest: Manifest = match toml::from_str(&raw) {
        Ok(manifest) => manifest,
        Err(err) => {
            warn!(manifest = %path.display(), %err, "malformed backend manifest");
            return None;
        }
    };

    match drivers::create(&manifest.driver) {
        Some(backend) => {
            debug!(manifest = %path.display(), driver = manifest.driver, "backend registered");
            Some(backend)
        }
        None => {
            warn!(
                manifest = %path.display(),
                driver = manifest.driver,
                "rejecting manifest for unknown driver"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;
    use std::io::Write;

    #[test]
    fn failover_activates_first_backend_with_an_openable_device() {
        let empty_a = Arc::new(MockBackend::with_devices("empty-a", 0));
        let empty_b = Arc::new(MockBackend::with_devices("empty-b", 0));
        let good = Arc::new(MockBackend::new("good"));

        let mut registry = Registry::with_backends(vec![
            empty_a.clone() as Arc<dyn Backend>,
            empty_b.clone(),
            good.clone(),
        ]);

        let active = registry.open().expect("third backend has a device");
        assert_eq!(registry.active_name(), Some("good"));
        active.close().expect("clean close");

        assert_eq!(empty_a.probe_count(), 1);
        assert_eq!(empty_b.probe_count(), 1);

        // Second open retries the sticky backend first and must not
        // re-probe the ones that already reported no devices.
        let active = registry.open().expect("sticky backend still works");
        active.close().expect("clean close");
        assert_eq!(empty_a.probe_count(), 1);
        assert_eq!(empty_b.probe_count(), 1);
        assert_eq!(good.probe_count(), 2);
    }

    #[test]
    fn open_without_any_device_is_no_device() {
        let mut registry = Registry::with_backends(vec![
            Arc::new(MockBackend::with_devices("a", 0)) as Arc<dyn Backend>,
        ]);
        assert_eq!(registry.open().unwrap_err(), BackendError::NoDevice);
        assert_eq!(registry.active_name(), None);
    }

    #[test]
    fn enumerated_but_unopenable_devices_probe_all_indices() {
        let stuck = Arc::new(MockBackend::failing_open("stuck", 3));
        let mut registry = Registry::with_backends(vec![stuck.clone() as Arc<dyn Backend>]);
        assert_eq!(registry.open().unwrap_err(), BackendError::NoDevice);
        assert_eq!(stuck.open_attempts(), 3);
        // A failed probe leaves nothing initialized behind.
        assert_eq!(stuck.init_count(), stuck.finalize_count());
    }

    #[test]
    fn unknown_driver_manifest_is_rejected_at_scan_time() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut file = std::fs::File::create(dir.path().join("vendor.toml")).expect("create");
        writeln!(file, "driver = \"no-such-vendor\"").expect("write");

        let registry = Registry::discover(dir.path());
        assert!(registry.is_empty());
    }

    #[test]
    fn mock_manifest_is_accepted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut file = std::fs::File::create(dir.path().join("virt.toml")).expect("create");
        writeln!(file, "driver = \"mock\"").expect("write");

        let registry = Registry::discover(dir.path());
        assert_eq!(registry.len(), 1);
    }
}
