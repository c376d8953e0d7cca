/*!
 * CORSAC Daemon Client
 * JSON IPC communication with corsacd
 */

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

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

#[derive(Debug, Serialize, Deserialize)]
pub struct Device {
    pub address: String,
    pub name: String,
    pub paired: bool,
    pub connected: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    pub status: String,
    pub track: Option<TrackInfo>,
    pub volume: u16,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TrackInfo {
    pub title: String,
    pub artist: String,
    pub album: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CallInfo {
    pub path: String,
    pub line_id: Option<String>,
    pub state: Option<String>,
}

pub struct CorsacClient {
    socket_path: String,
}

impl CorsacClient {
    pub fn new(socket_path: String) -> Self {
        Self { socket_path }
    }

    pub async fn send_request(&self, request: Request) -> Result<Response> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;

        let mut request_json = serde_json::to_string(&request)?;
        request_json.push('\n');
        stream.write_all(request_json.as_bytes()).await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;

        let response: Response = serde_json::from_str(line.trim())?;
        Ok(response)
    }
}
