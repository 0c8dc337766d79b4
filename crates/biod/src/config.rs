//! Daemon configuration
//!
//! A TOML file layered over built-in defaults; every field is optional
//! in the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Control socket PAM callers connect to.
    pub socket_path: PathBuf,
    /// Socket streaming raw frames and detected boxes.
    pub live_data_socket: PathBuf,
    /// Socket of the external face comparison peer.
    pub peer_socket: PathBuf,
    /// Directory scanned for fingerprint backend manifests.
    pub plugin_dir: PathBuf,
    /// Fingerprint template directory.
    pub fprint_store_dir: PathBuf,
    /// Face sample directory.
    pub face_store_dir: PathBuf,
    /// V4L2 capture device.
    pub video_device: String,
    /// SeetaFace frontal detection model.
    pub face_model: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/bioauthd/bioauthd.sock"),
            live_data_socket: PathBuf::from("/run/bioauthd/live-data.sock"),
            peer_socket: PathBuf::from("/run/bioauthd/face-peer.sock"),
            plugin_dir: PathBuf::from("/etc/bioauthd/backends"),
            fprint_store_dir: PathBuf::from("/var/lib/bioauthd/fprint"),
            face_store_dir: PathBuf::from("/var/lib/bioauthd/faces"),
            video_device: "/dev/video0".to_string(),
            face_model: PathBuf::from("/usr/share/bioauthd/seeta_fd_frontal_v1.0.bin"),
        }
    }
}

impl DaemonConfig {
    /// Load the configuration. With no explicit path the standard
    /// location is read when present, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        builder = match path {
            Some(path) => builder.add_source(config::File::from(path)),
            None => builder
                .add_source(config::File::with_name("/etc/bioauthd/bioauthd").required(false)),
        };
        builder.build()?.try_deserialize()
    }
}
