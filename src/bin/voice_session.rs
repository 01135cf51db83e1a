//! Live Voice Session
//!
//! Holds one spoken conversation with the live endpoint using the default
//! (or configured) microphone and speakers. Ctrl+C hangs up.
//!
//! Usage: `voice-session [config.toml] [system instruction...]`

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use live_voice_session::{
    audio::{list_devices, CpalCapture, CpalOutput},
    config::AppConfig,
    network::WebSocketClient,
    session::{SessionController, SessionObserver},
    Error,
};

/// Logs lifecycle events and a coarse volume meter
#[derive(Default)]
struct ConsoleObserver {
    frames: AtomicU64,
}

impl SessionObserver for ConsoleObserver {
    fn on_open(&self) {
        println!("Connected. Start talking, Ctrl+C to hang up.");
    }

    fn on_close(&self) {
        println!("Disconnected.");
    }

    fn on_error(&self, error: &Error) {
        eprintln!("Session error: {}", error);
    }

    fn on_volume_change(&self, volume: f32) {
        // Roughly twice a second at 16 kHz with 4096-sample frames
        if self.frames.fetch_add(1, Ordering::Relaxed) % 2 == 0 {
            let bars = (volume * 40.0).round() as usize;
            tracing::debug!("mic [{:<40}] {:.3}", "#".repeat(bars.min(40)), volume);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting live voice session");

    // wss needs a process-wide TLS provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut args = std::env::args().skip(1);
    let config_path = args.next().map(PathBuf::from);
    let instruction: Vec<String> = args.collect();

    let mut config = AppConfig::load_or_default(config_path.as_deref()).context("failed to load config")?;
    if !instruction.is_empty() {
        config.session.system_instruction = instruction.join(" ");
    }

    // List available devices
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}", device.name, device_type, default_marker);
        if let (Some(rate), Some(channels)) = (device.default_sample_rate, device.default_channels) {
            println!("    Default: {} Hz, {} ch", rate, channels);
        }
    }
    println!();

    let output = Arc::new(CpalOutput::open(config.audio.output_device.clone()).context("failed to open speakers")?);
    tracing::info!("Playback at {} Hz", output.device_rate());

    let capture = Arc::new(CpalCapture::new(config.audio.input_device.clone()));

    let controller = SessionController::new(
        WebSocketClient::new(),
        capture,
        output,
        &config,
        Arc::new(ConsoleObserver::default()),
    );

    let mut states = controller.subscribe();
    controller
        .connect(config.session.clone())
        .await
        .context("failed to start session")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Hanging up");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                if !state.is_active() {
                    tracing::info!("Session ended ({})", state);
                    break;
                }
            }
        }
    }

    controller.disconnect().await;

    Ok(())
}
