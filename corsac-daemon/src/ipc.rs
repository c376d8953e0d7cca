/*!
 * IPC Server for CORSAC Daemon
 * JSON protocol over Unix socket
 */

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::RwLock;

use crate::artwork::ArtworkResolver;
use crate::bluetooth::admission::{AdmissionController, Session};
use crate::bluetooth::playback::{volume_in_range, PlaybackFacade};
use crate::bluetooth::{Device, DeviceRegistry};
use crate::calls::{CallInfo, CallTracker};
use crate::state::{PlaybackSnapshot, StateStore};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    Status,
    Devices,
    Play,
    Pause,
    Next,
    Previous,
    SetVolume { level: u16 },
    AlbumArt,
    Disconnect,
    Calls,
    Dial { number: String },
    Answer { path: String },
    Hangup { path: String },
    HangupAll,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    State {
        session: SessionSummary,
        playback: PlaybackSnapshot,
    },
    DeviceList { devices: Vec<Device> },
    ArtPath { path: Option<String> },
    CallList { calls: Vec<CallInfo> },
    Success { message: String },
    Error { message: String },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionSummary {
    pub state: String,
    pub device: Option<Device>,
    pub authorized_services: u32,
}

/// Everything a client request may touch, shared across client tasks.
pub struct IpcContext {
    pub facade: Arc<PlaybackFacade>,
    pub store: Arc<StateStore>,
    pub registry: Arc<DeviceRegistry>,
    pub session: Arc<RwLock<Session>>,
    pub admission: Arc<AdmissionController>,
    pub artwork: Arc<ArtworkResolver>,
    pub calls: Option<Arc<CallTracker>>,
}

pub struct IpcServer {
    listener: UnixListener,
    context: Arc<IpcContext>,
}

impl IpcServer {
    pub fn new(listener: UnixListener, context: Arc<IpcContext>) -> Self {
        Self { listener, context }
    }

    pub async fn run(self) -> Result<()> {
        tracing::info!("IPC server listening for connections...");

        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    tracing::debug!("New client connected");
                    let context = self.context.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, context).await {
                            tracing::error!("Client error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

async fn handle_client(stream: UnixStream, context: Arc<IpcContext>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        let request = line.trim();
        if request.is_empty() {
            continue;
        }
        tracing::debug!("Received request: {}", request);

        let response = match serde_json::from_str::<Request>(request) {
            Ok(request) => respond(&context, request).await,
            Err(e) => Response::Error {
                message: format!("bad request: {}", e),
            },
        };

        let mut payload = serde_json::to_string(&response)?;
        payload.push('\n');
        write_half.write_all(payload.as_bytes()).await?;
    }

    Ok(())
}

async fn respond(context: &IpcContext, request: Request) -> Response {
    match request {
        Request::Status => {
            let session = context.session.read().await;
            Response::State {
                session: SessionSummary {
                    state: session.state.as_str().to_string(),
                    device: session.device.clone(),
                    authorized_services: session.authorized_services,
                },
                playback: context.store.snapshot().await,
            }
        }
        Request::Devices => Response::DeviceList {
            devices: context.registry.all().await,
        },
        Request::Play => command(context.facade.play().await, "playing"),
        Request::Pause => command(context.facade.pause().await, "paused"),
        Request::Next => command(context.facade.next().await, "skipped forward"),
        Request::Previous => command(context.facade.previous().await, "skipped back"),
        Request::SetVolume { level } => {
            if !volume_in_range(level) {
                return Response::Error {
                    message: format!("volume must be between 0 and 127, got {}", level),
                };
            }
            command(
                context.facade.set_volume(level).await,
                &format!("volume set to {}", level),
            )
        }
        Request::AlbumArt => {
            let snapshot = context.store.snapshot().await;
            let path = match &snapshot.track {
                Some(track) => context
                    .artwork
                    .resolve(track)
                    .await
                    .map(|p| p.display().to_string()),
                None => None,
            };
            Response::ArtPath { path }
        }
        Request::Disconnect => {
            context.admission.disconnect_all(&context.registry).await;
            Response::Success {
                message: "disconnected all devices".to_string(),
            }
        }
        Request::Calls => match &context.calls {
            Some(tracker) => Response::CallList {
                calls: tracker.calls().await,
            },
            None => Response::Error {
                message: "telephony is disabled".to_string(),
            },
        },
        Request::Dial { number } => match &context.calls {
            Some(tracker) => command(tracker.dial(&number).await, "dialing"),
            None => Response::Error {
                message: "telephony is disabled".to_string(),
            },
        },
        Request::Answer { path } => match &context.calls {
            Some(tracker) => command(tracker.answer(&path).await, "answered"),
            None => Response::Error {
                message: "telephony is disabled".to_string(),
            },
        },
        Request::Hangup { path } => match &context.calls {
            Some(tracker) => command(tracker.hangup(&path).await, "hung up"),
            None => Response::Error {
                message: "telephony is disabled".to_string(),
            },
        },
        Request::HangupAll => match &context.calls {
            Some(tracker) => command(tracker.hangup_all().await, "hung up"),
            None => Response::Error {
                message: "telephony is disabled".to_string(),
            },
        },
    }
}

fn command(result: crate::error::Result<()>, message: &str) -> Response {
    match result {
        Ok(()) => Response::Success {
            message: message.to_string(),
        },
        Err(e) => Response::Error {
            message: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_parse_from_tagged_json() {
        assert!(matches!(
            serde_json::from_str::<Request>(r#"{"type":"Play"}"#).unwrap(),
            Request::Play
        ));
        assert!(matches!(
            serde_json::from_str::<Request>(r#"{"type":"SetVolume","level":64}"#).unwrap(),
            Request::SetVolume { level: 64 }
        ));
    }

    #[test]
    fn command_maps_errors_to_responses() {
        let ok = command(Ok(()), "done");
        assert!(matches!(ok, Response::Success { .. }));

        let err = command(Err(crate::error::DaemonError::NoActiveSession), "done");
        let Response::Error { message } = err else {
            panic!("expected error response");
        };
        assert_eq!(message, "no active session");
    }
}
