use super::{ConnectionConfig, LiveProvider, ServerEvent};
use crate::settings::Settings;
use crate::tools::{ToolCallRequest, ToolDeclaration};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};

const LIVE_HOST: &str = "generativelanguage.googleapis.com";
const LIVE_PATH: &str =
    "/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Rate of inbound synthesized audio when the mime type does not say.
const DEFAULT_OUTPUT_RATE: u32 = 24000;

pub struct GeminiProvider;

impl LiveProvider for GeminiProvider {
    fn name(&self) -> &str {
        "Gemini Live"
    }

    fn connection_config(
        &self,
        settings: &Settings,
        tools: &[ToolDeclaration],
    ) -> ConnectionConfig {
        let url = format!("wss://{}{}?key={}", LIVE_HOST, LIVE_PATH, settings.api_key);

        let mut setup = json!({
            "model": settings.model,
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": { "voiceName": settings.voice }
                    },
                    "languageCode": settings.language,
                },
            },
            "systemInstruction": {
                "parts": [{ "text": settings.persona }],
            },
        });

        if settings.input_transcription {
            setup["inputAudioTranscription"] = json!({});
        }
        if settings.output_transcription {
            setup["outputAudioTranscription"] = json!({});
        }
        if !tools.is_empty() {
            let declarations: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            setup["tools"] = json!([{ "functionDeclarations": declarations }]);
        }

        ConnectionConfig {
            url,
            headers: vec![("Host".into(), LIVE_HOST.into())],
            setup_message: json!({ "setup": setup }),
        }
    }

    fn parse_events(&self, text: &str) -> Vec<ServerEvent> {
        let message: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => return vec![ServerEvent::Error(format!("parse error: {}", e))],
        };

        if message.get("setupComplete").is_some() {
            return vec![ServerEvent::SetupComplete];
        }

        let mut events = Vec::new();

        if let Some(content) = message.get("serverContent") {
            // A single serverContent may carry several of these at once;
            // emission order here is the dispatch order.
            if let Some(delta) = content
                .get("outputTranscription")
                .and_then(|t| t.get("text"))
                .and_then(|t| t.as_str())
            {
                events.push(ServerEvent::OutputTranscript(delta.to_string()));
            }
            if let Some(delta) = content
                .get("inputTranscription")
                .and_then(|t| t.get("text"))
                .and_then(|t| t.as_str())
            {
                events.push(ServerEvent::InputTranscript(delta.to_string()));
            }
            if content
                .get("turnComplete")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
            {
                events.push(ServerEvent::TurnComplete);
            }
            if let Some(parts) = content
                .get("modelTurn")
                .and_then(|t| t.get("parts"))
                .and_then(|p| p.as_array())
            {
                for part in parts {
                    if let Some(event) = parse_audio_part(part) {
                        events.push(event);
                    }
                }
            }
            if content
                .get("interrupted")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
            {
                events.push(ServerEvent::Interrupted);
            }
        }

        if let Some(calls) = message
            .get("toolCall")
            .and_then(|t| t.get("functionCalls"))
            .and_then(|c| c.as_array())
        {
            for call in calls {
                let id = call.get("id").and_then(|v| v.as_str()).unwrap_or("");
                let name = call.get("name").and_then(|v| v.as_str()).unwrap_or("");
                if id.is_empty() || name.is_empty() {
                    log::warn!("[gemini] skipping malformed function call: {}", call);
                    continue;
                }
                events.push(ServerEvent::ToolCall(ToolCallRequest {
                    id: id.to_string(),
                    name: name.to_string(),
                    args: call.get("args").cloned().unwrap_or_else(|| json!({})),
                }));
            }
        }

        if let Some(go_away) = message.get("goAway") {
            events.push(ServerEvent::Status(format!("goAway: {}", go_away)));
        }
        if message.get("usageMetadata").is_some() {
            events.push(ServerEvent::Status("usage metadata received".into()));
        }

        if events.is_empty() {
            events.push(ServerEvent::Status(format!("unhandled message: {}", text)));
        }
        events
    }

    fn encode_audio_chunk(&self, pcm: &[u8]) -> Value {
        json!({
            "realtimeInput": {
                "mediaChunks": [{
                    "mimeType": format!("audio/pcm;rate={}", crate::audio::CAPTURE_SAMPLE_RATE),
                    "data": BASE64.encode(pcm),
                }],
            },
        })
    }

    fn encode_tool_response(&self, id: &str, name: &str, result: &Value) -> Value {
        json!({
            "toolResponse": {
                "functionResponses": [{
                    "id": id,
                    "name": name,
                    "response": result,
                }],
            },
        })
    }
}

fn parse_audio_part(part: &Value) -> Option<ServerEvent> {
    let blob = part.get("inlineData")?;
    let mime = blob.get("mimeType").and_then(|m| m.as_str()).unwrap_or("");
    if !mime.starts_with("audio/pcm") {
        return None;
    }
    let b64 = blob.get("data").and_then(|d| d.as_str())?;
    let data = match BASE64.decode(b64) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("[gemini] skipping undecodable audio blob: {}", e);
            return None;
        }
    };
    if data.len() % 2 != 0 {
        log::warn!("[gemini] skipping audio blob with odd byte count");
        return None;
    }
    Some(ServerEvent::Audio {
        data,
        sample_rate: parse_mime_rate(mime).unwrap_or(DEFAULT_OUTPUT_RATE),
        channels: 1,
    })
}

fn parse_mime_rate(mime: &str) -> Option<u32> {
    mime.split(';')
        .filter_map(|p| p.trim().strip_prefix("rate="))
        .find_map(|r| r.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> GeminiProvider {
        GeminiProvider
    }

    #[test]
    fn setup_message_carries_voice_persona_and_tools() {
        let mut settings = Settings::default();
        settings.api_key = "k".into();
        settings.voice = "Kore".into();
        settings.persona = "Stay brief.".into();
        let tools = vec![ToolDeclaration {
            name: "add_task".into(),
            description: "Add a task".into(),
            parameters: json!({ "type": "object" }),
        }];

        let config = provider().connection_config(&settings, &tools);
        assert!(config.url.contains("key=k"));
        let setup = &config.setup_message["setup"];
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Kore"
        );
        assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "Stay brief.");
        assert_eq!(
            setup["tools"][0]["functionDeclarations"][0]["name"],
            "add_task"
        );
        assert!(setup.get("inputAudioTranscription").is_some());
    }

    #[test]
    fn combined_server_content_yields_events_in_dispatch_order() {
        let audio_b64 = BASE64.encode([0u8, 1, 2, 3]);
        let text = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [{ "inlineData": {
                        "mimeType": "audio/pcm;rate=24000",
                        "data": audio_b64,
                    }}],
                },
                "outputTranscription": { "text": "Hello" },
                "inputTranscription": { "text": "Hi" },
                "turnComplete": true,
                "interrupted": true,
            },
        })
        .to_string();

        let events = provider().parse_events(&text);
        assert_eq!(events.len(), 5);
        assert!(matches!(&events[0], ServerEvent::OutputTranscript(t) if t == "Hello"));
        assert!(matches!(&events[1], ServerEvent::InputTranscript(t) if t == "Hi"));
        assert!(matches!(events[2], ServerEvent::TurnComplete));
        assert!(matches!(
            &events[3],
            ServerEvent::Audio { sample_rate: 24000, channels: 1, data } if data.len() == 4
        ));
        assert!(matches!(events[4], ServerEvent::Interrupted));
    }

    #[test]
    fn tool_calls_parse_in_received_order() {
        let text = json!({
            "toolCall": {
                "functionCalls": [
                    { "id": "a", "name": "first", "args": { "x": 1 } },
                    { "id": "b", "name": "second" },
                ],
            },
        })
        .to_string();

        let events = provider().parse_events(&text);
        assert_eq!(events.len(), 2);
        assert!(
            matches!(&events[0], ServerEvent::ToolCall(req) if req.id == "a" && req.args["x"] == 1)
        );
        assert!(
            matches!(&events[1], ServerEvent::ToolCall(req) if req.id == "b" && req.args == json!({}))
        );
    }

    #[test]
    fn malformed_audio_blob_is_skipped_but_batch_survives() {
        let text = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [{ "inlineData": {
                        "mimeType": "audio/pcm;rate=24000",
                        "data": "not base64!!!",
                    }}],
                },
                "turnComplete": true,
            },
        })
        .to_string();

        let events = provider().parse_events(&text);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ServerEvent::TurnComplete));
    }

    #[test]
    fn setup_complete_is_recognized() {
        let events = provider().parse_events(&json!({ "setupComplete": {} }).to_string());
        assert!(matches!(events[0], ServerEvent::SetupComplete));
    }

    #[test]
    fn unparseable_frame_is_an_error_event() {
        let events = provider().parse_events("{nope");
        assert!(matches!(&events[0], ServerEvent::Error(_)));
    }

    #[test]
    fn mime_rate_parsing() {
        assert_eq!(parse_mime_rate("audio/pcm;rate=24000"), Some(24000));
        assert_eq!(parse_mime_rate("audio/pcm; rate=16000"), Some(16000));
        assert_eq!(parse_mime_rate("audio/pcm"), None);
    }

    #[test]
    fn audio_chunk_envelope_tags_capture_rate() {
        let value = provider().encode_audio_chunk(&[1, 2, 3, 4]);
        let chunk = &value["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], BASE64.encode([1u8, 2, 3, 4]));
    }

    #[test]
    fn tool_response_envelope_pairs_id_and_name() {
        let value = provider().encode_tool_response("id-1", "add_task", &json!({ "ok": true }));
        let resp = &value["toolResponse"]["functionResponses"][0];
        assert_eq!(resp["id"], "id-1");
        assert_eq!(resp["name"], "add_task");
        assert_eq!(resp["response"]["ok"], true);
    }
}
