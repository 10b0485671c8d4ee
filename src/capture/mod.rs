// Capture engine modules

pub mod adaptive;
pub mod segment_writer;
pub mod session;
pub mod source;

pub use session::{CaptureSession, SessionCommand, SessionHandle};
pub use source::{FrameSource, SourceConfig};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Capture lifecycle state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStatus {
    /// Not capturing; buffered segments remain on disk and exportable
    Idle,
    /// Start requested, waiting for the frame source to confirm delivery
    Starting,
    /// Frames flowing into the open segment
    Active,
    /// System asleep; history up to the pause point is preserved
    Paused,
    /// Stream failure, restarting with bounded backoff
    Recovering,
    /// Stop requested, finalizing the open segment
    Stopping,
}

/// Capture state shared with the UI observer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureState {
    pub status: CaptureStatus,
    pub started_at: Option<DateTime<Utc>>,
    /// Closed segments plus the elapsed time of the open one
    pub buffered_secs: f64,
    /// Frame rate currently applied when opening segments
    pub active_frame_rate: u32,
}

impl CaptureState {
    pub fn new() -> Self {
        Self {
            status: CaptureStatus::Idle,
            started_at: None,
            buffered_secs: 0.0,
            active_frame_rate: 0,
        }
    }

    pub fn is_capturing(&self) -> bool {
        matches!(
            self.status,
            CaptureStatus::Active | CaptureStatus::Paused | CaptureStatus::Recovering
        )
    }
}

impl Default for CaptureState {
    fn default() -> Self {
        Self::new()
    }
}

/// Error type for capture operations
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("screen capture permission denied")]
    PermissionDenied,

    #[error("failed to set up capture stream: {0}")]
    StreamSetupFailed(String),

    #[error("capture stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("insufficient disk space: {available} bytes available, {required} required")]
    InsufficientDiskSpace { available: u64, required: u64 },

    #[error("a capture session is already running")]
    AlreadyRunning,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sink for the engine's observable state. The Tauri layer forwards these as
/// events to the webview; tests record them.
pub trait CaptureObserver: Send + Sync {
    fn state_changed(&self, state: &CaptureState);
    fn buffered_duration_changed(&self, buffered_secs: f64);
    fn warning(&self, message: &str);
    fn fatal_error(&self, error: &CaptureError);
}

/// Observer that drops everything, for headless use
pub struct NullObserver;

impl CaptureObserver for NullObserver {
    fn state_changed(&self, _state: &CaptureState) {}
    fn buffered_duration_changed(&self, _buffered_secs: f64) {}
    fn warning(&self, _message: &str) {}
    fn fatal_error(&self, _error: &CaptureError) {}
}
