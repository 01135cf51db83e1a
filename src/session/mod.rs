//! Session lifecycle
//!
//! A session ties one capture source, one transport channel and one
//! playback scheduler together. [`SessionController`] owns at most one
//! session at a time and reports its progress through a
//! [`SessionObserver`] and a watchable [`ConnectionState`].

pub mod controller;
pub mod pipeline;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::codec::VolumeSample;
use crate::config::SessionConfig;
use crate::error::Error;

pub use controller::SessionController;

/// Externally visible connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    /// Whether a session currently holds resources
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Identity of one live session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub config: SessionConfig,
    pub started_at: DateTime<Utc>,
}

impl SessionInfo {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            started_at: Utc::now(),
        }
    }
}

/// Lifecycle notifications
///
/// Called from runtime tasks; implementations must not block. Every
/// method defaults to a no-op.
pub trait SessionObserver: Send + Sync + 'static {
    /// The session reached CONNECTED
    fn on_open(&self) {}

    /// The session ended without error
    fn on_close(&self) {}

    /// The session failed; called once per failure
    fn on_error(&self, _error: &Error) {}

    /// Loudness of the latest captured frame, in `[0.0, 1.0]`
    fn on_volume_change(&self, _volume: VolumeSample) {}
}

/// Observer that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}
