//! Comparison peer client
//!
//! Face matching is delegated to an external comparator process over a
//! Unix socket: one request with both images, one verdict byte back.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;

use crate::{wire, FaceError, Frame};

/// How long to wait for the peer's verdict.
pub const COMPARE_TIMEOUT: Duration = Duration::from_secs(30);

/// Decides whether a live crop shows the same face as a stored sample.
pub trait FaceComparator: Send + Sync {
    fn compare(&self, live: &Frame, stored: &Frame) -> Result<bool, FaceError>;
}

/// Connects per request; the peer treats each connection as one
/// comparison.
pub struct PeerClient {
    path: PathBuf,
}

impl PeerClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FaceComparator for PeerClient {
    fn compare(&self, live: &Frame, stored: &Frame) -> Result<bool, FaceError> {
        let mut stream = UnixStream::connect(&self.path)?;
        stream.set_read_timeout(Some(COMPARE_TIMEOUT))?;
        stream.write_all(&wire::encode_compare_request(live, stored))?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply)?;
        let verdict = wire::decode_compare_reply(&reply)
            .ok_or_else(|| FaceError::Peer(format!("unexpected reply tag {:#04x}", reply[0])))?;
        debug!(matched = verdict, "comparison peer verdict");
        Ok(verdict)
    }
}
