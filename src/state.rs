use crate::transcript::TranscriptTurn;
use std::sync::Mutex;

/// Number of spectrum bars computed by the capture thread for visualizers.
pub const BAR_COUNT: usize = 50;

/// Events sent from the session tasks to the presentation layer.
#[derive(Debug, Clone)]
pub enum AppEvent {
    StatusUpdate { status: String, message: String },
    /// Partial transcript update; carries the accumulator's running value.
    TranscriptDelta { text: String, is_user: bool },
    /// A completed conversation turn was appended to history.
    TurnCommitted(TranscriptTurn),
    /// An inbound audio payload was scheduled for playback.
    AudioPlayback { duration_secs: f64 },
    SessionError(String),
    SessionClosed { code: u16, reason: String },
}

/// Snapshot of the live session, for `LiveService::connection_status()`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConnectionStatus {
    pub is_connecting: bool,
    pub is_connected: bool,
    pub transcript_history: Vec<TranscriptTurn>,
    pub current_input_partial: String,
    pub current_output_partial: String,
}

/// Capture-side meters shared with the presentation layer.
pub struct Meters {
    /// FFT magnitudes for the visualizer bars (0.0–1.0 range).
    pub spectrum: Mutex<[f32; BAR_COUNT]>,
    /// Peak amplitude of the most recent capture chunk.
    pub input_peak: Mutex<f32>,
}

impl Meters {
    pub fn new() -> Self {
        Self {
            spectrum: Mutex::new([0.0; BAR_COUNT]),
            input_peak: Mutex::new(0.0),
        }
    }
}

impl Default for Meters {
    fn default() -> Self {
        Self::new()
    }
}
