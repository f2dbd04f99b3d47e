use lycheetalk::error::ToolError;
use lycheetalk::session::LiveService;
use lycheetalk::state::AppEvent;
use lycheetalk::tools::{ToolDeclaration, ToolExecutor};
use lycheetalk::{app_err, app_log, audio, diagnostics, settings};
use serde_json::{json, Value};
use std::io::Write;
use std::sync::Arc;

/// Minimal built-in executor so tool calls round-trip out of the box. Real
/// embeddings supply their own `ToolExecutor`.
struct LocalExecutor;

impl ToolExecutor for LocalExecutor {
    fn execute(&self, name: &str, _args: &Value) -> Result<Value, ToolError> {
        match name {
            "get_time" => Ok(json!({
                "time": chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            })),
            other => Err(ToolError::UnknownTool(other.into())),
        }
    }
}

fn local_tools() -> Vec<ToolDeclaration> {
    vec![ToolDeclaration {
        name: "get_time".into(),
        description: "Get the current local date and time.".into(),
        parameters: json!({ "type": "object", "properties": {} }),
    }]
}

fn main() {
    env_logger::init();

    if let Err(e) = diagnostics::init_session_logging() {
        eprintln!("[lycheetalk] file logging unavailable: {}", e);
    }
    diagnostics::install_panic_hook();

    let mut settings = settings::load();
    if settings.api_key.is_empty() {
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            settings.api_key = key;
        }
    }
    if settings.api_key.is_empty() {
        eprintln!(
            "[lycheetalk] no API key; set GEMINI_API_KEY or edit {}",
            settings::settings_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "the settings file".into())
        );
        return;
    }

    let (event_tx, event_rx) = std::sync::mpsc::channel::<AppEvent>();
    let runtime = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");

    let service = LiveService::new(settings, local_tools(), Arc::new(LocalExecutor), event_tx);
    let meters = service.meters();

    // Caption renderer: partials overwrite in place, turns print as lines.
    std::thread::spawn(move || {
        for event in event_rx {
            match event {
                AppEvent::StatusUpdate { status, message } => {
                    app_log!("[{}] {}", status, message);
                }
                AppEvent::TranscriptDelta { text, is_user } => {
                    let speaker = if is_user { "you" } else { " ai" };
                    print!("\r[{}] {}\x1b[K", speaker, text);
                    let _ = std::io::stdout().flush();
                }
                AppEvent::TurnCommitted(turn) => {
                    println!("\r\x1b[K[you] {}", turn.user_text);
                    println!("[ ai] {}", turn.assistant_text);
                }
                AppEvent::AudioPlayback { duration_secs } => {
                    log::debug!("[main] playing {:.2}s", duration_secs);
                }
                AppEvent::SessionError(message) => {
                    app_err!("[error] {}", message);
                }
                AppEvent::SessionClosed { code, reason } => {
                    app_log!("[closed] {} {}", code, reason);
                }
            }
        }
    });

    println!(
        "lycheetalk {} (commands: start, stop, status, devices, quit)",
        env!("CARGO_PKG_VERSION")
    );

    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        line.clear();
        if stdin.read_line(&mut line).is_err() {
            break;
        }
        match line.trim() {
            "start" => {
                if let Err(e) = runtime.block_on(service.clone().start_conversation()) {
                    app_err!("[lycheetalk] start failed: {}", e);
                }
            }
            "stop" => service.stop_conversation(),
            "status" => {
                let status = service.connection_status();
                let peak = meters.input_peak.lock().map(|p| *p).unwrap_or(0.0);
                println!(
                    "connecting={} connected={} turns={} mic_peak={:.3}",
                    status.is_connecting,
                    status.is_connected,
                    status.transcript_history.len(),
                    peak
                );
                if !status.current_input_partial.is_empty() {
                    println!("you (partial): {}", status.current_input_partial);
                }
                if !status.current_output_partial.is_empty() {
                    println!(" ai (partial): {}", status.current_output_partial);
                }
            }
            "devices" => {
                println!("input devices:");
                for name in audio::list_input_devices() {
                    println!("  {}", name);
                }
                println!("output devices:");
                for name in audio::list_output_devices() {
                    println!("  {}", name);
                }
            }
            "quit" | "exit" => {
                service.stop_conversation();
                break;
            }
            "" => {}
            other => println!("unknown command: {}", other),
        }
    }
}
