//! Live duplex voice sessions with a realtime conversational AI provider.
//!
//! The crate owns the full lifetime of one conversation: microphone capture
//! and PCM16 encoding, the bidirectional WebSocket channel, gapless playback
//! of synthesized replies with barge-in, transcript aggregation into turns,
//! and bridging of mid-conversation tool calls to an embedding-provided
//! executor. See [`session::LiveService`] for the entry point.

pub mod audio;
pub mod diagnostics;
pub mod error;
pub mod playback;
pub mod provider;
pub mod session;
pub mod settings;
pub mod state;
pub mod tools;
pub mod transcript;
