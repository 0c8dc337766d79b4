//! Control socket
//!
//! Frames are `[u8 type][u32 LE length][JSON payload]`. Requests come in
//! on type 0x01, responses go back on 0x02, and a connection that sends
//! `subscribe` is switched to the event stream on 0x03 until it closes.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::service::{BiometricsService, ServiceError, ServiceEvent};

pub const MSG_REQUEST: u8 = 0x01;
pub const MSG_RESPONSE: u8 = 0x02;
pub const MSG_EVENT: u8 = 0x03;

/// Requests are small JSON commands; anything larger is malformed.
pub const MAX_FRAME_LEN: u32 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    EnrollFprintStart,
    EnrollFprintStop,
    VerifyFprintStart { id: Option<String> },
    VerifyFprintStop,
    DeleteEnrolledFinger { id: String },
    EnrollFaceStart,
    EnrollFaceStop,
    VerifyFaceStart { id: String },
    VerifyFaceStop,
    DeleteEnrolledFace { id: String },
    Subscribe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Error { code: String, message: String },
}

impl Response {
    fn from_result(result: Result<(), ServiceError>) -> Self {
        match result {
            Ok(()) => Response::Ok,
            Err(err) => Response::Error {
                code: err.code().to_string(),
                message: err.to_string(),
            },
        }
    }
}

pub fn encode_frame(msg_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + payload.len());
    out.push(msg_type);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

async fn read_frame(stream: &mut UnixStream) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let mut header = [0u8; 5];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_le_bytes(header[1..5].try_into().unwrap_or_default());
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "oversized frame",
        ));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(Some((header[0], payload)))
}

/// Accept loop. Runs until the daemon shuts down.
pub async fn serve(path: &Path, service: Arc<BiometricsService>) -> anyhow::Result<()> {
    if path.exists() {
        // A connectable socket means another daemon owns it; only a
        // stale file from an unclean shutdown may be replaced.
        if std::os::unix::net::UnixStream::connect(path).is_ok() {
            anyhow::bail!("control socket {} is in use", path.display());
        }
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    info!(socket = %path.display(), "control socket listening");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, service).await {
                debug!(%err, "connection closed with error");
            }
        });
    }
}

/// Local callers only: root, or the account the daemon runs as.
fn peer_allowed(stream: &UnixStream) -> bool {
    match stream.peer_cred() {
        Ok(cred) => {
            let own_uid = unsafe { libc::geteuid() };
            cred.uid() == 0 || cred.uid() == own_uid
        }
        Err(err) => {
            warn!(%err, "cannot read peer credentials");
            false
        }
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    service: Arc<BiometricsService>,
) -> anyhow::Result<()> {
    let allowed = peer_allowed(&stream);

    while let Some((msg_type, payload)) = read_frame(&mut stream).await? {
        if msg_type != MSG_REQUEST {
            debug!(msg_type, "dropping unexpected frame type");
            continue;
        }

        let request: Request = match serde_json::from_slice(&payload) {
            Ok(request) => request,
            Err(err) => {
                let response = Response::Error {
                    code: "internal".to_string(),
                    message: format!("malformed request: {err}"),
                };
                write_response(&mut stream, &response).await?;
                continue;
            }
        };

        if !allowed {
            let response = Response::from_result(Err(ServiceError::PermissionDenied));
            write_response(&mut stream, &response).await?;
            continue;
        }

        if request == Request::Subscribe {
            write_response(&mut stream, &Response::Ok).await?;
            return forward_events(stream, service.subscribe()).await;
        }

        // Stops join worker threads, so requests run off the runtime.
        let dispatch_service = Arc::clone(&service);
        let result = tokio::task::spawn_blocking(move || dispatch(&dispatch_service, request))
            .await
            .unwrap_or_else(|err| Err(ServiceError::Internal(err.to_string())));
        write_response(&mut stream, &Response::from_result(result)).await?;
    }
    Ok(())
}

fn dispatch(service: &BiometricsService, request: Request) -> Result<(), ServiceError> {
    match request {
        Request::EnrollFprintStart => service.enroll_fprint_start(),
        Request::EnrollFprintStop => service.fprint_stop(true),
        Request::VerifyFprintStart { id } => service.verify_fprint_start(id.as_deref()),
        Request::VerifyFprintStop => service.fprint_stop(false),
        Request::DeleteEnrolledFinger { id } => service.delete_enrolled_finger(&id),
        Request::EnrollFaceStart => service.enroll_face_start(),
        Request::EnrollFaceStop => service.face_stop(),
        Request::VerifyFaceStart { id } => service.verify_face_start(&id),
        Request::VerifyFaceStop => service.face_stop(),
        Request::DeleteEnrolledFace { id } => service.delete_enrolled_face(&id),
        Request::Subscribe => Ok(()),
    }
}

async fn write_response(stream: &mut UnixStream, response: &Response) -> std::io::Result<()> {
    let payload = serde_json::to_vec(response)?;
    stream.write_all(&encode_frame(MSG_RESPONSE, &payload)).await
}

/// Push every broadcast event to one subscriber until it disconnects. A
/// subscriber that falls behind the channel skips the missed events and
/// keeps receiving.
async fn forward_events(
    mut stream: UnixStream,
    mut events: broadcast::Receiver<ServiceEvent>,
) -> anyhow::Result<()> {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "event subscriber lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        };
        let payload = serde_json::to_vec(&event)?;
        stream.write_all(&encode_frame(MSG_EVENT, &payload)).await?;
    }
}
