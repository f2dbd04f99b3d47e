// Integration tests for the public session surface.
//
// These drive the pure cores through the crate API the way the dispatcher
// does at runtime; no audio hardware or network is required.

use lycheetalk::error::ToolError;
use lycheetalk::playback::PlaybackScheduler;
use lycheetalk::provider::{create_provider, ServerEvent};
use lycheetalk::session::LiveService;
use lycheetalk::settings::Settings;
use lycheetalk::state::AppEvent;
use lycheetalk::tools::ToolExecutor;
use lycheetalk::transcript::TranscriptAggregator;
use serde_json::{json, Value};
use std::sync::Arc;

struct NoTools;

impl ToolExecutor for NoTools {
    fn execute(&self, name: &str, _args: &Value) -> Result<Value, ToolError> {
        Err(ToolError::UnknownTool(name.into()))
    }
}

#[test]
fn stopping_a_fresh_service_twice_never_errors() {
    let (event_tx, _event_rx) = std::sync::mpsc::channel::<AppEvent>();
    let service = LiveService::new(Settings::default(), Vec::new(), Arc::new(NoTools), event_tx);

    service.stop_conversation();
    service.stop_conversation();

    let status = service.connection_status();
    assert!(!status.is_connecting);
    assert!(!status.is_connected);
    assert!(status.transcript_history.is_empty());
}

#[test]
fn a_parsed_conversation_folds_into_turns() {
    let provider = create_provider();
    let mut aggregator = TranscriptAggregator::new();

    let frames = [
        json!({ "serverContent": { "inputTranscription": { "text": "What time " } } }),
        json!({ "serverContent": { "inputTranscription": { "text": "is it?" } } }),
        json!({ "serverContent": { "outputTranscription": { "text": "It is " } } }),
        json!({ "serverContent": {
            "outputTranscription": { "text": "noon." },
            "turnComplete": true,
        } }),
    ];

    for frame in frames {
        for event in provider.parse_events(&frame.to_string()) {
            match event {
                ServerEvent::InputTranscript(delta) => {
                    aggregator.append_user(&delta);
                }
                ServerEvent::OutputTranscript(delta) => {
                    aggregator.append_assistant(&delta);
                }
                ServerEvent::TurnComplete => {
                    aggregator.commit_turn("[Lychee]");
                }
                _ => {}
            }
        }
    }

    let history = aggregator.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].user_text, "What time is it?");
    assert_eq!(history[0].assistant_text, "[Lychee] It is noon.");
    assert_eq!(aggregator.user_partial(), "");
    assert_eq!(aggregator.assistant_partial(), "");
}

#[test]
fn gapless_playback_survives_a_barge_in() {
    let mut scheduler = PlaybackScheduler::new();

    // Steady stream: two half-second buffers, no gap, no overlap.
    let first = scheduler.schedule(0.5, 0.0);
    let second = scheduler.schedule(0.5, 0.4);
    assert_eq!(first.start, 0.0);
    assert_eq!(second.start, 0.5);

    // Third buffer queued ahead, then the user barges in at 0.7.
    let third = scheduler.schedule(0.5, 0.5);
    assert!(scheduler.is_active(third.id));
    let stopped = scheduler.interrupt();
    assert!(stopped.contains(&third.id));
    assert_eq!(scheduler.active_count(), 0);
    assert_eq!(scheduler.next_start(), 0.0);

    // Playback resumes at the clock, not at the stale schedule.
    let resumed = scheduler.schedule(0.5, 0.9);
    assert_eq!(resumed.start, 0.9);
}
