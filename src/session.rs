use crate::audio::AudioCapture;
use crate::error::LiveError;
use crate::playback::{AudioPlayback, PlaybackSink};
use crate::provider::channel::{ChannelEvent, ChannelHandle, RemoteChannel, OUTBOUND_QUEUE};
use crate::provider::{create_provider, LiveProvider, ServerEvent};
use crate::settings::Settings;
use crate::state::{AppEvent, ConnectionStatus, Meters};
use crate::tools::{ToolCallBridge, ToolDeclaration, ToolExecutor};
use crate::transcript::TranscriptAggregator;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender as EventSender;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

const EVENT_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closing,
}

struct ActiveSession {
    generation: u64,
    started_at: DateTime<Utc>,
    /// Held for ownership: dropping it releases the input stream.
    _capture: AudioCapture,
    /// Gate checked inside the capture callback; closed before teardown.
    capturing: Arc<AtomicBool>,
    playback: Arc<AudioPlayback>,
    channel: ChannelHandle,
}

struct ServiceInner {
    state: SessionState,
    session: Option<ActiveSession>,
}

/// Everything the dispatcher task needs besides the service itself. Cloned
/// handles rather than the session slot, so event handling never contends
/// with the state lock.
struct DispatchCtx {
    generation: u64,
    playback: Arc<dyn PlaybackSink>,
    channel: ChannelHandle,
    capturing: Arc<AtomicBool>,
}

/// Owner of the one live session: its state machine, device and channel
/// lifecycle, and the dispatcher that routes inbound events to the
/// transcript aggregator, the playback scheduler and the tool bridge.
pub struct LiveService {
    settings: Settings,
    tools: Vec<ToolDeclaration>,
    bridge: ToolCallBridge,
    provider: Arc<dyn LiveProvider>,
    event_tx: EventSender<AppEvent>,
    inner: Mutex<ServiceInner>,
    /// Bumped on every start and stop; in-flight work tagged with an older
    /// generation is dropped instead of applied.
    generation: AtomicU64,
    transcripts: Mutex<TranscriptAggregator>,
    meters: Arc<Meters>,
}

impl LiveService {
    pub fn new(
        settings: Settings,
        tools: Vec<ToolDeclaration>,
        executor: Arc<dyn ToolExecutor>,
        event_tx: EventSender<AppEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            tools,
            bridge: ToolCallBridge::new(executor),
            provider: create_provider(),
            event_tx,
            inner: Mutex::new(ServiceInner {
                state: SessionState::Idle,
                session: None,
            }),
            generation: AtomicU64::new(0),
            transcripts: Mutex::new(TranscriptAggregator::new()),
            meters: Arc::new(Meters::new()),
        })
    }

    pub fn meters(&self) -> Arc<Meters> {
        self.meters.clone()
    }

    /// Begin a conversation. Rejected unless the service is `Idle`.
    ///
    /// Devices are acquired first (output, then gated input), then the
    /// channel is opened; the session goes `Active` when the provider
    /// confirms setup, which is when capture starts flowing.
    pub async fn start_conversation(self: Arc<Self>) -> Result<(), LiveError> {
        {
            let mut inner = lock_inner(&self.inner);
            if inner.state != SessionState::Idle {
                return Err(LiveError::SessionActive);
            }
            inner.state = SessionState::Connecting;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.emit_status("connecting", "Connecting...");

        match self.clone().connect(generation).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut inner = lock_inner(&self.inner);
                if inner.state == SessionState::Connecting {
                    inner.state = SessionState::Idle;
                }
                drop(inner);
                self.emit_status("idle", "Ready");
                Err(e)
            }
        }
    }

    async fn connect(self: Arc<Self>, generation: u64) -> Result<(), LiveError> {
        // Output context first so the reply path exists before any inbound
        // audio can arrive, then the gated input context.
        let playback = Arc::new(AudioPlayback::start(device_name(
            &self.settings.speaker_device,
        ))?);
        let capturing = Arc::new(AtomicBool::new(false));
        let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
        let capture = AudioCapture::start(
            device_name(&self.settings.mic_device),
            audio_tx,
            self.meters.clone(),
            capturing.clone(),
        )?;

        let (events_tx, events_rx) = mpsc::channel::<ChannelEvent>(EVENT_QUEUE);
        let config = self.provider.connection_config(&self.settings, &self.tools);
        let channel =
            RemoteChannel::open(self.provider.clone(), config, audio_rx, events_tx).await?;

        {
            let mut inner = lock_inner(&self.inner);
            let stopped_during_connect = inner.state != SessionState::Connecting
                || self.generation.load(Ordering::SeqCst) != generation;
            if stopped_during_connect {
                channel.close();
                playback.stop_all();
                return Err(LiveError::Connect("session stopped during connect".into()));
            }
            inner.session = Some(ActiveSession {
                generation,
                started_at: Utc::now(),
                _capture: capture,
                capturing: capturing.clone(),
                playback: playback.clone(),
                channel: channel.clone(),
            });
        }

        let ctx = DispatchCtx {
            generation,
            playback,
            channel,
            capturing,
        };
        tokio::spawn(async move {
            self.dispatch_loop(events_rx, ctx).await;
        });
        Ok(())
    }

    /// Tear the session down. Safe to call from any state, including before
    /// any resource was allocated; a second call while `Idle` does nothing.
    pub fn stop_conversation(&self) {
        let mut inner = lock_inner(&self.inner);
        if inner.state == SessionState::Idle {
            return;
        }
        inner.state = SessionState::Closing;
        // Invalidate in-flight frames and events for the old session.
        self.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(session) = inner.session.take() {
            let lived = Utc::now() - session.started_at;
            log::info!(
                "[session] stopping after {}s (generation {})",
                lived.num_seconds(),
                session.generation
            );
            // Teardown order: capture gate, channel, playback, devices.
            session.capturing.store(false, Ordering::SeqCst);
            session.channel.close();
            session.playback.stop_all();
            // Dropping the session releases input and output streams.
        }
        inner.state = SessionState::Idle;
        drop(inner);

        if let Ok(mut transcripts) = self.transcripts.lock() {
            transcripts.clear_partials();
        }
        self.emit_status("idle", "Ready");
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        let state = lock_inner(&self.inner).state;
        let (history, input_partial, output_partial) = match self.transcripts.lock() {
            Ok(t) => (
                t.history().to_vec(),
                t.user_partial().to_string(),
                t.assistant_partial().to_string(),
            ),
            Err(_) => (Vec::new(), String::new(), String::new()),
        };
        ConnectionStatus {
            is_connecting: state == SessionState::Connecting,
            is_connected: state == SessionState::Active,
            transcript_history: history,
            current_input_partial: input_partial,
            current_output_partial: output_partial,
        }
    }

    async fn dispatch_loop(self: Arc<Self>, mut events_rx: mpsc::Receiver<ChannelEvent>, ctx: DispatchCtx) {
        while let Some(event) = events_rx.recv().await {
            if self.generation.load(Ordering::SeqCst) != ctx.generation {
                // The session this work belongs to is gone.
                break;
            }
            match event {
                ChannelEvent::Batch(events) => {
                    for server_event in events {
                        self.handle_server_event(server_event, &ctx);
                    }
                }
                ChannelEvent::Error(message) => {
                    self.emit(AppEvent::SessionError(message));
                    self.stop_conversation();
                    self.emit(AppEvent::SessionClosed {
                        code: 1006,
                        reason: "socket error".into(),
                    });
                    break;
                }
                ChannelEvent::Closed { code, reason } => {
                    self.stop_conversation();
                    self.emit(AppEvent::SessionClosed { code, reason });
                    break;
                }
            }
        }
        log::debug!("[session] dispatcher for generation {} ended", ctx.generation);
    }

    /// Apply one inbound event. Events arrive on a single queue in the
    /// parser's emission order, so per-message handling order is fixed:
    /// output transcript, input transcript, turn complete, audio,
    /// interruption, tool calls.
    fn handle_server_event(&self, event: ServerEvent, ctx: &DispatchCtx) {
        match event {
            ServerEvent::SetupComplete => {
                let mut inner = lock_inner(&self.inner);
                if inner.state == SessionState::Connecting {
                    inner.state = SessionState::Active;
                    ctx.capturing.store(true, Ordering::SeqCst);
                    drop(inner);
                    log::info!("[session] setup complete, capture live");
                    self.emit_status("live", "Listening");
                }
            }
            ServerEvent::OutputTranscript(delta) => {
                let text = match self.transcripts.lock() {
                    Ok(mut t) => t.append_assistant(&delta).to_string(),
                    Err(_) => return,
                };
                self.emit(AppEvent::TranscriptDelta {
                    text,
                    is_user: false,
                });
            }
            ServerEvent::InputTranscript(delta) => {
                let text = match self.transcripts.lock() {
                    Ok(mut t) => t.append_user(&delta).to_string(),
                    Err(_) => return,
                };
                self.emit(AppEvent::TranscriptDelta {
                    text,
                    is_user: true,
                });
            }
            ServerEvent::TurnComplete => {
                let turn = match self.transcripts.lock() {
                    Ok(mut t) => t.commit_turn(&self.settings.persona_label),
                    Err(_) => return,
                };
                self.emit(AppEvent::TurnCommitted(turn));
            }
            ServerEvent::Audio {
                data, sample_rate, ..
            } => {
                let samples = decode_pcm16(&data);
                let duration_secs = ctx.playback.enqueue(samples, sample_rate);
                self.emit(AppEvent::AudioPlayback { duration_secs });
            }
            ServerEvent::Interrupted => {
                log::info!("[session] barge-in, aborting playback");
                ctx.playback.stop_all();
            }
            ServerEvent::ToolCall(request) => {
                let payload = self.bridge.respond(&request);
                ctx.channel
                    .send_tool_response(request.id, request.name, payload);
            }
            ServerEvent::Error(message) => {
                log::error!("[session] provider error: {}", message);
                self.emit(AppEvent::SessionError(message));
            }
            ServerEvent::Status(message) => {
                log::debug!("[session] {}", message);
            }
        }
    }

    fn emit(&self, event: AppEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_status(&self, status: &str, message: &str) {
        self.emit(AppEvent::StatusUpdate {
            status: status.into(),
            message: message.into(),
        });
    }
}

/// A poisoned state lock would otherwise wedge stop(); take the data anyway,
/// teardown must stay reachable.
fn lock_inner(inner: &Mutex<ServiceInner>) -> MutexGuard<'_, ServiceInner> {
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn device_name(configured: &str) -> Option<&str> {
    if configured.is_empty() {
        None
    } else {
        Some(configured)
    }
}

fn decode_pcm16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolError;
    use serde_json::{json, Value};
    use std::sync::mpsc::Receiver;

    struct StubExecutor;

    impl ToolExecutor for StubExecutor {
        fn execute(&self, name: &str, args: &Value) -> Result<Value, ToolError> {
            match name {
                "echo" => Ok(args.clone()),
                other => Err(ToolError::UnknownTool(other.into())),
            }
        }
    }

    struct StubSink {
        enqueued: Mutex<Vec<(usize, u32)>>,
        stopped: AtomicU64,
    }

    impl StubSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                enqueued: Mutex::new(Vec::new()),
                stopped: AtomicU64::new(0),
            })
        }
    }

    impl PlaybackSink for StubSink {
        fn enqueue(&self, samples: Vec<i16>, sample_rate: u32) -> f64 {
            let duration = samples.len() as f64 / sample_rate as f64;
            self.enqueued.lock().unwrap().push((samples.len(), sample_rate));
            duration
        }

        fn stop_all(&self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }

        fn active_count(&self) -> usize {
            0
        }
    }

    fn service() -> (Arc<LiveService>, Receiver<AppEvent>) {
        let (event_tx, event_rx) = std::sync::mpsc::channel();
        let svc = LiveService::new(
            Settings::default(),
            Vec::new(),
            Arc::new(StubExecutor),
            event_tx,
        );
        (svc, event_rx)
    }

    fn ctx(
        svc: &LiveService,
        sink: Arc<StubSink>,
    ) -> (DispatchCtx, mpsc::Receiver<crate::provider::channel::Control>) {
        let (channel, ctrl_rx) = ChannelHandle::test_handle();
        (
            DispatchCtx {
                generation: svc.generation.load(Ordering::SeqCst),
                playback: sink,
                channel,
                capturing: Arc::new(AtomicBool::new(false)),
            },
            ctrl_rx,
        )
    }

    #[test]
    fn stop_twice_is_idempotent_and_leaves_idle() {
        let (svc, _events) = service();
        svc.stop_conversation();
        assert!(!svc.connection_status().is_connected);
        assert!(!svc.connection_status().is_connecting);
        svc.stop_conversation();
        let status = svc.connection_status();
        assert!(!status.is_connected);
        assert!(!status.is_connecting);
    }

    #[test]
    fn setup_complete_activates_session_and_opens_capture_gate() {
        let (svc, events) = service();
        let sink = StubSink::new();
        let (ctx, _ctrl) = ctx(&svc, sink);
        lock_inner(&svc.inner).state = SessionState::Connecting;

        svc.handle_server_event(ServerEvent::SetupComplete, &ctx);

        assert!(svc.connection_status().is_connected);
        assert!(ctx.capturing.load(Ordering::SeqCst));
        // Second setup-complete is a no-op once Active.
        svc.handle_server_event(ServerEvent::SetupComplete, &ctx);
        let statuses: Vec<_> = events.try_iter().collect();
        assert_eq!(statuses.len(), 1);
    }

    #[test]
    fn transcript_flow_builds_one_turn_with_persona_prefix() {
        let (svc, events) = service();
        let sink = StubSink::new();
        let (ctx, _ctrl) = ctx(&svc, sink);

        for delta in ["Hel", "lo ", "Sir"] {
            svc.handle_server_event(ServerEvent::OutputTranscript(delta.into()), &ctx);
        }
        svc.handle_server_event(ServerEvent::InputTranscript("Hi".into()), &ctx);
        svc.handle_server_event(ServerEvent::TurnComplete, &ctx);

        let status = svc.connection_status();
        assert_eq!(status.transcript_history.len(), 1);
        assert_eq!(status.transcript_history[0].user_text, "Hi");
        assert_eq!(
            status.transcript_history[0].assistant_text,
            "[Lychee] Hello Sir"
        );
        assert_eq!(status.current_input_partial, "");
        assert_eq!(status.current_output_partial, "");

        let mut deltas = 0;
        let mut turns = 0;
        for event in events.try_iter() {
            match event {
                AppEvent::TranscriptDelta { .. } => deltas += 1,
                AppEvent::TurnCommitted(_) => turns += 1,
                _ => {}
            }
        }
        assert_eq!(deltas, 4);
        assert_eq!(turns, 1);
    }

    #[test]
    fn audio_is_scheduled_and_interruption_stops_playback() {
        let (svc, events) = service();
        let sink = StubSink::new();
        let (ctx, _ctrl) = ctx(&svc, sink.clone());

        // 0.5s of 24kHz PCM16.
        let data = vec![0u8; 24000];
        svc.handle_server_event(
            ServerEvent::Audio {
                data,
                sample_rate: 24000,
                channels: 1,
            },
            &ctx,
        );
        assert_eq!(*sink.enqueued.lock().unwrap(), vec![(12000, 24000)]);

        svc.handle_server_event(ServerEvent::Interrupted, &ctx);
        assert_eq!(sink.stopped.load(Ordering::SeqCst), 1);

        let played: Vec<_> = events
            .try_iter()
            .filter_map(|e| match e {
                AppEvent::AudioPlayback { duration_secs } => Some(duration_secs),
                _ => None,
            })
            .collect();
        assert_eq!(played.len(), 1);
        assert!((played[0] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn every_tool_call_gets_exactly_one_response() {
        let (svc, _events) = service();
        let sink = StubSink::new();
        let (ctx, mut ctrl_rx) = ctx(&svc, sink);

        for (id, name) in [("a", "echo"), ("b", "missing")] {
            svc.handle_server_event(
                ServerEvent::ToolCall(crate::tools::ToolCallRequest {
                    id: id.into(),
                    name: name.into(),
                    args: json!({ "n": 1 }),
                }),
                &ctx,
            );
        }

        let mut responded = Vec::new();
        while let Ok(ctrl) = ctrl_rx.try_recv() {
            if let crate::provider::channel::Control::ToolResponse { id, result, .. } = ctrl {
                responded.push((id, result));
            }
        }
        assert_eq!(responded.len(), 2);
        assert_eq!(responded[0].0, "a");
        assert_eq!(responded[0].1["output"]["n"], 1);
        assert_eq!(responded[1].0, "b");
        assert!(responded[1].1.get("error").is_some());
    }

    #[test]
    fn decode_pcm16_is_little_endian() {
        let samples = decode_pcm16(&[0x00, 0x40, 0xFF, 0xFF]);
        assert_eq!(samples, vec![16384, -1]);
    }
}
