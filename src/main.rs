use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use mesh_call::{
    CallConfig, CallCoordinator, CallEvent, CallPhase, MediaConstraints, StaticPermissions, WebRtcConnectionFactory,
    WebSocketConnector,
};

/// Join a mesh audio call from the terminal.
#[derive(Debug, Parser)]
#[command(name = "mesh-call", version)]
struct Cli {
    /// Signaling relay base url; the room id is appended as a path segment
    #[arg(long, env = "MESH_CALL_SIGNAL_URL", default_value = "ws://localhost:8081/signal")]
    signal_url: String,

    #[arg(long)]
    room: String,

    #[arg(long, default_value_t = format!("user-{}", rand::random::<u32>()))]
    user_id: String,

    /// Display name shown to other participants
    #[arg(long)]
    name: Option<String>,

    /// Capture device name; the system default when absent
    #[arg(long)]
    input_device: Option<String>,

    /// Join receive-only
    #[arg(long)]
    no_audio: bool,

    /// STUN/TURN server url, repeatable; replaces the built-in list
    #[arg(long = "stun")]
    stun: Vec<String>,

    #[arg(long, default_value_t = mesh_call::config::DEFAULT_MAX_ICE_RETRIES)]
    max_retries: u32,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).try_init().map_err(|err| anyhow!(err))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    let config = CallConfig {
        max_ice_retries: cli.max_retries,
        ..CallConfig::default()
    }
    .with_ice_servers(cli.stun);

    let factory = WebRtcConnectionFactory::new(config.clone()).context("webrtc setup failed")?;
    let call = CallCoordinator::new(
        cli.user_id.clone(),
        config,
        Arc::new(factory),
        Arc::new(WebSocketConnector::new(cli.signal_url)),
        Arc::new(StaticPermissions::allow(cli.name)),
    );

    call.acquire_media(&MediaConstraints {
        audio: !cli.no_audio,
        input_device: cli.input_device,
    })
    .await
    .context("could not open the microphone")?;

    let mut events = call.subscribe();
    let mut phase = call.watch_phase();
    call.join(&cli.room).await.context("could not join the call")?;
    info!(room = %cli.room, user = %cli.user_id, "press ctrl-c to leave");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                call.leave();
                // Give the writer a moment to flush the leave frame.
                tokio::time::sleep(Duration::from_millis(200)).await;
                break;
            }
            _ = phase.wait_for(|p| *p == CallPhase::Ended) => break,
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(missed)) => warn!(missed, "call events dropped"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    while let Ok(event) = events.try_recv() {
        log_event(&event);
    }
    Ok(())
}

fn log_event(event: &CallEvent) {
    match event {
        CallEvent::PeerJoined(p) => info!(peer = %p.id, name = %p.display_name, "joined"),
        CallEvent::PeerLeft(p) => info!(peer = %p.id, name = %p.display_name, "left"),
        CallEvent::PeerStateChanged { participant_id, state } => {
            info!(peer = %participant_id, %state, "connection")
        }
        CallEvent::TrackReceived { participant_id, track } => {
            info!(peer = %participant_id, track = %track.id, kind = ?track.kind, "receiving media")
        }
        CallEvent::CallEnded { reason: Some(reason) } => warn!("call ended: {reason}"),
        CallEvent::CallEnded { reason: None } => info!("left the call"),
    }
}
