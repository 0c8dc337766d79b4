//! Live-data publisher socket
//!
//! Streams raw frames and detected boxes to whoever connects, strictly
//! best-effort: a client that stalls or disconnects is dropped, never
//! allowed to slow the capture loop down.

use std::fs;
use std::io::{self, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

const ACCEPT_POLL: Duration = Duration::from_millis(100);

pub struct LiveDataPublisher {
    clients: Arc<Mutex<Vec<UnixStream>>>,
    running: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    path: PathBuf,
}

impl LiveDataPublisher {
    /// Bind the publisher socket, replacing a stale file from a previous
    /// run, and start accepting subscribers.
    pub fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        info!(socket = %path.display(), "live-data publisher listening");

        let clients: Arc<Mutex<Vec<UnixStream>>> = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicBool::new(true));

        let accept_clients = Arc::clone(&clients);
        let accept_running = Arc::clone(&running);
        let accept_thread = thread::Builder::new()
            .name("live-data-accept".to_string())
            .spawn(move || {
                while accept_running.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, _addr)) => {
                            if stream.set_nonblocking(true).is_ok() {
                                debug!("live-data subscriber connected");
                                if let Ok(mut clients) = accept_clients.lock() {
                                    clients.push(stream);
                                }
                            }
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                            thread::sleep(ACCEPT_POLL);
                        }
                        Err(err) => {
                            warn!(%err, "live-data accept failed");
                            thread::sleep(ACCEPT_POLL);
                        }
                    }
                }
            })?;

        Ok(Self {
            clients,
            running,
            accept_thread: Some(accept_thread),
            path,
        })
    }

    /// Send one message to every subscriber. A subscriber whose buffer
    /// is full would corrupt its stream on a partial write, so any write
    /// failure disconnects it.
    pub fn publish(&self, payload: &[u8]) {
        let Ok(mut clients) = self.clients.lock() else {
            return;
        };
        clients.retain_mut(|stream| match stream.write_all(payload) {
            Ok(()) => true,
            Err(err) => {
                debug!(%err, "dropping live-data subscriber");
                false
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.clients.lock().map(|clients| clients.len()).unwrap_or(0)
    }
}

impl Drop for LiveDataPublisher {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn subscriber_receives_published_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket = dir.path().join("live.sock");
        let publisher = LiveDataPublisher::bind(&socket).expect("bind");

        let mut client = UnixStream::connect(&socket).expect("connect");
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");

        // Wait for the accept loop to pick the client up.
        for _ in 0..50 {
            if publisher.subscriber_count() == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(publisher.subscriber_count(), 1);

        publisher.publish(&[0x60, 1, 2, 3]);
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).expect("read");
        assert_eq!(buf, [0x60, 1, 2, 3]);
    }

    #[test]
    fn disconnected_subscribers_are_pruned() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket = dir.path().join("live.sock");
        let publisher = LiveDataPublisher::bind(&socket).expect("bind");

        {
            let _client = UnixStream::connect(&socket).expect("connect");
            for _ in 0..50 {
                if publisher.subscriber_count() == 1 {
                    break;
                }
                thread::sleep(Duration::from_millis(20));
            }
        }

        // The client is gone; a publish or two flushes it out.
        publisher.publish(b"x");
        publisher.publish(b"x");
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[test]
    fn drop_removes_the_socket_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket = dir.path().join("live.sock");
        drop(LiveDataPublisher::bind(&socket).expect("bind"));
        assert!(!socket.exists());
    }
}
