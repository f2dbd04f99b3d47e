use crate::error::LiveError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Prebuilt voice name for synthesized replies.
    #[serde(default = "default_voice")]
    pub voice: String,
    /// System instruction establishing the assistant persona.
    #[serde(default = "default_persona")]
    pub persona: String,
    /// Prefix stamped onto finalized assistant transcript lines.
    #[serde(default = "default_persona_label")]
    pub persona_label: String,
    #[serde(default = "default_language")]
    pub language: String,
    /// Input device name; empty means the system default microphone.
    #[serde(default)]
    pub mic_device: String,
    /// Output device name; empty means the system default speaker.
    #[serde(default)]
    pub speaker_device: String,
    #[serde(default = "default_true")]
    pub input_transcription: bool,
    #[serde(default = "default_true")]
    pub output_transcription: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            voice: default_voice(),
            persona: default_persona(),
            persona_label: default_persona_label(),
            language: default_language(),
            mic_device: String::new(),
            speaker_device: String::new(),
            input_transcription: true,
            output_transcription: true,
        }
    }
}

fn default_model() -> String {
    "models/gemini-live-2.5-flash-native-audio".into()
}
fn default_voice() -> String {
    "Puck".into()
}
fn default_persona() -> String {
    "You are a helpful voice assistant. Keep replies short and conversational.".into()
}
fn default_persona_label() -> String {
    "[Lychee]".into()
}
fn default_language() -> String {
    "en".into()
}
fn default_true() -> bool {
    true
}

pub fn settings_path() -> Result<PathBuf, LiveError> {
    if let Some(dir) = dirs::data_local_dir() {
        return Ok(dir.join("LycheeTalk").join("settings.json"));
    }
    if let Some(home) = dirs::home_dir() {
        return Ok(home.join(".lycheetalk").join("settings.json"));
    }
    Err(LiveError::Config("failed to resolve data directory".into()))
}

pub fn load() -> Settings {
    let path = match settings_path() {
        Ok(p) => p,
        Err(_) => return Settings::default(),
    };
    match fs::read_to_string(&path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
        Err(_) => Settings::default(),
    }
}

pub fn save(settings: &Settings) -> Result<(), LiveError> {
    let path = settings_path()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| LiveError::Config(format!("failed to create settings dir: {}", e)))?;
    }
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| LiveError::Config(format!("failed to serialize settings: {}", e)))?;
    fs::write(&path, json)
        .map_err(|e| LiveError::Config(format!("failed to write settings: {}", e)))?;
    Ok(())
}
