//! PeerCall - Kommandozeilen-Client
//!
//! Befehle auf stdin: `call`, `hangup`, `video on|off`, `audio on|off`,
//! `state`, `quit`. Events werden als JSON-Zeilen ausgegeben.

use anyhow::{Context, Result};
use peercall::call_engine::{CaptureDevice, EngineContext, WebRtcEngine};
use peercall::config::CallConfig;
use peercall::negotiation::{self, CallHandle};
use peercall::signaling::RelayClient;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<()> {
    peercall::init_tracing();

    let config = CallConfig::load().context("Failed to load configuration")?;
    tracing::info!(
        "Starting PeerCall (relay {}, room '{}')",
        config.signaling_url,
        config.room
    );

    let context = EngineContext::new(config.rtc_ice_servers())
        .context("Failed to initialize WebRTC")?;
    let capture = Arc::new(CaptureDevice::new(config.capture));
    let engine = Arc::new(WebRtcEngine::new(context, Arc::clone(&capture)));

    let relay = Arc::new(RelayClient::new(
        config.signaling_url.clone(),
        config.room.clone(),
        config.heartbeat_interval(),
    ));
    // Runtime abonniert den Relay-Kanal; erst danach verbinden
    let (handle, runtime) = negotiation::spawn(engine, Arc::clone(&relay), config.negotiation_timeout());

    let mut notifications = handle.subscribe();
    tokio::spawn(async move {
        while let Ok(notification) = notifications.recv().await {
            match serde_json::to_string(&notification) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::error!("Failed to encode notification: {}", e),
            }
        }
    });

    if let Err(e) = relay.connect().await {
        handle.shutdown();
        let _ = runtime.await;
        capture.stop();
        return Err(e).context("Failed to connect to signaling relay");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if !execute(&handle, line.trim()).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.shutdown();
    runtime.await.context("Call runtime panicked")?;
    relay.disconnect().await;
    capture.stop();

    Ok(())
}

/// Führt einen Befehl aus. `false` beendet das Programm.
async fn execute(handle: &CallHandle, command: &str) -> bool {
    let result = match command.split_whitespace().collect::<Vec<_>>().as_slice() {
        [] => Ok(()),
        ["call"] => handle.start_call().await,
        ["hangup"] => handle.hang_up().await,
        ["video", "on"] => handle.toggle_video(true).await,
        ["video", "off"] => handle.toggle_video(false).await,
        ["audio", "on"] => handle.toggle_audio(true).await,
        ["audio", "off"] => handle.toggle_audio(false).await,
        ["state"] => {
            let state = handle.state();
            println!(
                "phase={} role={:?} video={} audio={}",
                state.phase,
                state.role,
                state.media_flags.video_enabled,
                state.media_flags.audio_enabled
            );
            Ok(())
        }
        ["quit"] | ["exit"] => return false,
        _ => {
            eprintln!("Unknown command: {}", command);
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("{}", e);
    }
    true
}
