use std::time::Duration;

use clap::{Parser, Subcommand};
use ipcam::{CameraClient, ClientConfig, ClientEvent};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "ipcam-probe",
    about = "Fetch snapshots, tail MJPEG streams and alarm feeds from an IP camera"
)]
struct Args {
    /// Camera host name or address
    #[arg(long)]
    host: String,

    #[arg(long, default_value_t = 80)]
    port: u16,

    #[arg(long, short, default_value = "admin")]
    user: String,

    #[arg(long, short, default_value = "")]
    password: String,

    /// Refuse Digest challenges
    #[arg(long)]
    no_digest: bool,

    #[arg(long, default_value_t = 18)]
    idle_timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch one JPEG and write it to a file
    Snapshot {
        #[arg(long, default_value = "/snapshot.jpg")]
        url: String,
        #[arg(long, short, default_value = "snapshot.jpg")]
        output: String,
    },
    /// Tail an MJPEG stream and report throughput
    Stream {
        #[arg(long, default_value = "/video.mjpg")]
        url: String,
    },
    /// Print alarm/event messages as they arrive
    Events {
        #[arg(long)]
        url: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = ClientConfig::new(&args.user, &args.password);
    config.digest_allowed = !args.no_digest;
    config.idle_timeout = Duration::from_secs(args.idle_timeout_secs);

    let url = match &args.command {
        Command::Snapshot { url, .. } => url.clone(),
        Command::Stream { url } => {
            config.stream_url = Some(url.clone());
            url.clone()
        }
        Command::Events { url } => {
            config.keep_open_url = Some(url.clone());
            url.clone()
        }
    };

    let (mut client, mut events) = CameraClient::new(&args.host, &args.host, args.port, config);
    client.start();

    if let Err(e) = client.send("GET", &url).await {
        eprintln!("Failed to reach camera: {}", e);
        return;
    }

    let mut frame_bytes = 0usize;
    // A close before any reply is the 401 leg of a handshake; the resend follows.
    let mut responded = false;
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(event) = event else {
            break;
        };

        match event {
            ClientEvent::Snapshot { image, .. } => {
                if let Command::Snapshot { output, .. } = &args.command {
                    match std::fs::write(output, &image) {
                        Ok(()) => println!("Wrote {} bytes to {}", image.len(), output),
                        Err(e) => eprintln!("Failed to write {}: {}", output, e),
                    }
                }
                break;
            }
            ClientEvent::StreamStarted {
                content_type,
                boundary,
                ..
            } => {
                responded = true;
                println!("Stream started: {content_type} (boundary {boundary:?})");
            }
            ClientEvent::Frame { data, .. } => {
                frame_bytes += data.len();
                tracing::debug!(total = frame_bytes, "stream data");
            }
            ClientEvent::Message { text, .. } => {
                responded = true;
                println!("{text}");
            }
            ClientEvent::Status { status, .. } => {
                responded = true;
                println!("Camera replied {status}");
            }
            ClientEvent::Fault { reason, .. } => {
                eprintln!("Fault: {reason}");
                if !responded {
                    break;
                }
            }
            ClientEvent::AuthFailed { reason, .. } => {
                eprintln!("Authentication failed: {reason}");
                break;
            }
            ClientEvent::Closed { .. } => {
                if responded {
                    println!("Connection closed ({frame_bytes} stream bytes received)");
                    break;
                }
            }
        }
    }

    client.dispose();
}
