pub mod channel;
pub mod gemini;

use crate::settings::Settings;
use crate::tools::{ToolCallRequest, ToolDeclaration};
use serde_json::Value;
use std::sync::Arc;

/// Events produced by parsing a provider's WebSocket messages.
///
/// One inbound message may carry several applicable fields at once; the
/// parser emits the corresponding events already in dispatch order:
/// output transcript, input transcript, turn complete, audio, interrupted,
/// then tool calls in received order.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// The provider confirmed session setup; streaming may begin.
    SetupComplete,
    /// Assistant-side transcript delta.
    OutputTranscript(String),
    /// User-side transcript delta.
    InputTranscript(String),
    /// The model finished its reply for the current turn.
    TurnComplete,
    /// Decoded synthesized audio.
    Audio {
        data: Vec<u8>,
        sample_rate: u32,
        channels: u16,
    },
    /// The user barged in; abort in-flight playback.
    Interrupted,
    /// The model wants a client-side function invoked.
    ToolCall(ToolCallRequest),
    /// Provider-level error.
    Error(String),
    /// Informational status (logged, not acted upon).
    Status(String),
}

/// Everything needed to establish and configure a provider connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// JSON message sent immediately after connecting.
    pub setup_message: Value,
}

/// Wire-format specifics of one realtime provider.
pub trait LiveProvider: Send + Sync {
    fn name(&self) -> &str;
    fn connection_config(&self, settings: &Settings, tools: &[ToolDeclaration])
        -> ConnectionConfig;
    /// Parse one inbound text frame into ordered events.
    fn parse_events(&self, text: &str) -> Vec<ServerEvent>;
    /// Wrap a PCM16 chunk in the provider's outbound audio envelope.
    fn encode_audio_chunk(&self, pcm: &[u8]) -> Value;
    /// Wrap a tool response payload in the provider's envelope.
    fn encode_tool_response(&self, id: &str, name: &str, result: &Value) -> Value;
}

/// Gemini Live is the only realtime provider today.
pub fn create_provider() -> Arc<dyn LiveProvider> {
    Arc::new(gemini::GeminiProvider)
}
