/*!
 * CORSAC Session Control CLI
 * Drives a running corsacd over its Unix socket
 * Onyx Digital Intelligence Development LLC
 */

use anyhow::Result;
use clap::{Parser, Subcommand};

mod client;

use client::{CorsacClient, Request, Response};

#[derive(Parser)]
#[command(name = "corsac")]
#[command(about = "CORSAC Session Control CLI")]
struct Cli {
    /// Daemon socket path
    #[arg(short, long, default_value = "/run/corsac/corsac.sock")]
    socket: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show session and playback state
    Status,
    /// List devices seen on the bus
    Devices,
    /// Start playback on the connected phone
    Play,
    /// Pause playback
    Pause,
    /// Skip to the next track
    Next,
    /// Skip to the previous track
    Previous,
    /// Set the remote volume (0-127)
    Volume { level: u16 },
    /// Resolve album art for the current track
    Art,
    /// Disconnect every connected device
    Disconnect,
    /// List active voice calls
    Calls,
    /// Place a voice call
    Dial { number: String },
    /// Answer an incoming call by its object path
    Answer { path: String },
    /// Hang up one call by its object path
    Hangup { path: String },
    /// Hang up all voice calls
    HangupAll,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = CorsacClient::new(cli.socket);

    let request = match cli.command {
        Commands::Status => Request::Status,
        Commands::Devices => Request::Devices,
        Commands::Play => Request::Play,
        Commands::Pause => Request::Pause,
        Commands::Next => Request::Next,
        Commands::Previous => Request::Previous,
        Commands::Volume { level } => Request::SetVolume { level },
        Commands::Art => Request::AlbumArt,
        Commands::Disconnect => Request::Disconnect,
        Commands::Calls => Request::Calls,
        Commands::Dial { number } => Request::Dial { number },
        Commands::Answer { path } => Request::Answer { path },
        Commands::Hangup { path } => Request::Hangup { path },
        Commands::HangupAll => Request::HangupAll,
    };

    match client.send_request(request).await? {
        Response::State { session, playback } => {
            println!("session:  {}", session.state);
            match &session.device {
                Some(device) => println!("device:   {} ({})", device.name, device.address),
                None => println!("device:   none"),
            }
            println!("status:   {}", playback.status);
            match &playback.track {
                Some(track) => println!(
                    "track:    {} / {} / {}",
                    track.title, track.artist, track.album
                ),
                None => println!("track:    none"),
            }
            println!("volume:   {}", playback.volume);
        }
        Response::DeviceList { devices } => {
            if devices.is_empty() {
                println!("no devices known");
            }
            for device in devices {
                println!(
                    "{}  {}  paired={}  connected={}",
                    device.address, device.name, device.paired, device.connected
                );
            }
        }
        Response::ArtPath { path } => match path {
            Some(path) => println!("{}", path),
            None => println!("no artwork"),
        },
        Response::CallList { calls } => {
            if calls.is_empty() {
                println!("no active calls");
            }
            for call in calls {
                println!(
                    "{}  {}  {}",
                    call.path,
                    call.line_id.as_deref().unwrap_or("unknown"),
                    call.state.as_deref().unwrap_or("unknown")
                );
            }
        }
        Response::Success { message } => println!("{}", message),
        Response::Error { message } => {
            eprintln!("error: {}", message);
            std::process::exit(1);
        }
    }

    Ok(())
}
