use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use huddle::config::{CandidatePolicy, DEFAULT_SIGNALING_PORT, MeshConfig};
use huddle::mesh::sim::SimFactory;
use huddle::mesh::{MediaTrack, MeshClient, MeshEvent, TrackKind};
use tokio::io::{self, AsyncBufReadExt};

#[derive(Debug, Parser)]
#[command(name = "mesh_client", about = "Join a huddle room from the terminal")]
struct Args {
    /// Signaling server URL
    #[arg(long, default_value_t = format!("ws://127.0.0.1:{}", DEFAULT_SIGNALING_PORT))]
    url: String,

    #[arg(long)]
    room: String,

    /// Display name shown to the other participants
    #[arg(long)]
    name: String,

    /// Queue ICE candidates that arrive before the remote description
    #[arg(long)]
    buffer_early_candidates: bool,
}

fn screen_tracks() -> [MediaTrack; 2] {
    [
        MediaTrack::new("screen-video", TrackKind::Video, "screen"),
        MediaTrack::new("screen-audio", TrackKind::Audio, "screen"),
    ]
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = MeshConfig {
        candidate_policy: if args.buffer_early_candidates {
            CandidatePolicy::BufferEarly
        } else {
            CandidatePolicy::DropEarly
        },
        ..MeshConfig::default()
    };

    let client = MeshClient::connect(
        &args.url,
        args.room.as_str(),
        args.name.clone(),
        config,
        Arc::new(SimFactory::new()),
    )
    .await?;

    client.add_track(MediaTrack::new("camera-audio", TrackKind::Audio, "camera"))?;
    client.add_track(MediaTrack::new("camera-video", TrackKind::Video, "camera"))?;

    println!("Joined {} as {}. /share toggles screen sharing, /quit leaves.", args.room, args.name);

    tokio::spawn(print_events(client.view().clone()));

    let mut sharing = false;
    let mut stdin = io::BufReader::new(io::stdin()).lines();
    while let Ok(Some(line)) = stdin.next_line().await {
        match line.trim() {
            "" => {}
            "/quit" => break,
            "/share" => {
                for track in screen_tracks() {
                    if sharing {
                        client.remove_track(track.id)?;
                    } else {
                        client.add_track(track)?;
                    }
                }
                sharing = !sharing;
                println!("Screen sharing {}", if sharing { "on" } else { "off" });
            }
            text => client.send_chat(text)?,
        }
    }

    client.leave().await;
    Ok(())
}

async fn print_events(view: huddle::mesh::MeshView) {
    let mut roster = view.roster.clone();
    let events = view.events.clone();

    loop {
        tokio::select! {
            changed = roster.changed() => {
                if changed.is_err() {
                    break;
                }
                let names = roster.borrow_and_update().clone();
                println!("In the room: {}", names.join(", "));
            }
            event = events.recv() => match event {
                Ok(MeshEvent::Joined { conn_id }) => println!("Connected as {}", conn_id),
                Ok(MeshEvent::Notice(notice)) => println!("* {}", notice),
                Ok(MeshEvent::Chat { display_name, text }) => {
                    println!("{}: {}", display_name, text)
                }
                Ok(MeshEvent::LinkState { remote, state }) => {
                    println!("Link to {}: {:?}", remote, state)
                }
                Ok(MeshEvent::Error(message)) => eprintln!("Error: {}", message),
                Err(_) => break,
            },
        }
    }
}
