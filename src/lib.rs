//! # Live Voice Session
//!
//! Full-duplex spoken conversation with a remote conversational endpoint.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SessionController                               │
//! │        connect / disconnect / retry  ──►  state machine + observer      │
//! │                                                                         │
//! │  UPLINK (capture path, never blocks)                                    │
//! │  ┌─────────────┐   ┌───────────────┐   ┌──────────────────────────┐     │
//! │  │ Microphone  │──►│ UplinkEncoder │──►│   LiveTransportSession   │──┐  │
//! │  │ (capture)   │   │ PCM16 + RMS   │   │   fire-and-forget send   │  │  │
//! │  └─────────────┘   └───────┬───────┘   └──────────────────────────┘  │  │
//! │                            │ volume                                  │  │
//! │                            ▼                                         │  │
//! │                     on_volume_change                                 │  │
//! │                                                            WebSocket │  │
//! │  DOWNLINK (inbound path, strictly in delivery order)                 │  │
//! │  ┌─────────────┐   ┌────────────────┐   ┌────────────────────────┐   │  │
//! │  │  Speakers   │◄──│PlaybackScheduler│◄──│   DownlinkDecoder     │◄──┘  │
//! │  │ (timeline)  │   │ gapless / flush │   │   base64 → PCM16 → f32 │      │
//! │  └─────────────┘   └────────────────┘   └────────────────────────┘      │
//! │                            ▲                                            │
//! │                            └──── interruption (barge-in) → flush()      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod session;

pub use error::{Error, Result};
pub use session::{ConnectionState, SessionController, SessionObserver};

/// Application-wide constants
pub mod constants {
    /// Microphone sample rate sent upstream
    pub const DEFAULT_UPLINK_RATE_HZ: u32 = 16_000;

    /// Sample rate of synthesized speech coming back
    pub const DEFAULT_DOWNLINK_RATE_HZ: u32 = 24_000;

    /// Samples per capture frame (mono)
    pub const DEFAULT_FRAME_SIZE: usize = 4096;

    /// Prebuilt voice used when none is configured
    pub const DEFAULT_VOICE_ID: &str = "Puck";

    /// Live model used when none is configured
    pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";

    /// Bidirectional streaming endpoint
    pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

    /// Upper bound on the CONNECTING state
    pub const DEFAULT_OPEN_TIMEOUT_MS: u64 = 10_000;

    /// Upper bound on a graceful channel close
    pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 2_000;

    /// Environment variables consulted for the API key, in order
    pub const API_KEY_ENV_VARS: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];
}
