use chrono::{DateTime, Utc};
use serde::Serialize;

/// One finalized exchange: a user utterance paired with the assistant reply.
/// Append-only; never mutated after creation.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptTurn {
    pub user_text: String,
    pub assistant_text: String,
    pub timestamp: DateTime<Utc>,
}

/// Accumulates streaming transcript deltas into finalized turns.
///
/// Both partials are reset to empty immediately after a turn is committed,
/// even when one side never produced text in that turn (an audio-only reply
/// leaves an empty assistant string in history).
pub struct TranscriptAggregator {
    user_partial: String,
    assistant_partial: String,
    history: Vec<TranscriptTurn>,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self {
            user_partial: String::new(),
            assistant_partial: String::new(),
            history: Vec::new(),
        }
    }

    /// Append a user-side delta; returns the running partial for captions.
    pub fn append_user(&mut self, delta: &str) -> &str {
        self.user_partial.push_str(delta);
        &self.user_partial
    }

    /// Append an assistant-side delta; returns the running partial.
    pub fn append_assistant(&mut self, delta: &str) -> &str {
        self.assistant_partial.push_str(delta);
        &self.assistant_partial
    }

    /// Fold both partials into a turn, push it to history, reset partials.
    pub fn commit_turn(&mut self, persona_label: &str) -> TranscriptTurn {
        let assistant = self.assistant_partial.trim();
        let assistant_text = if assistant.is_empty() || persona_label.is_empty() {
            assistant.to_string()
        } else {
            format!("{} {}", persona_label, assistant)
        };
        let turn = TranscriptTurn {
            user_text: self.user_partial.trim().to_string(),
            assistant_text,
            timestamp: Utc::now(),
        };
        self.user_partial.clear();
        self.assistant_partial.clear();
        self.history.push(turn.clone());
        turn
    }

    /// Drop any unfinalized partial text (session teardown).
    pub fn clear_partials(&mut self) {
        self.user_partial.clear();
        self.assistant_partial.clear();
    }

    pub fn user_partial(&self) -> &str {
        &self.user_partial
    }

    pub fn assistant_partial(&self) -> &str {
        &self.assistant_partial
    }

    pub fn history(&self) -> &[TranscriptTurn] {
        &self.history
    }
}

impl Default for TranscriptAggregator {
    fn default() -> Self {
        Self::new()
    }
}
