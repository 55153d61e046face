use std::io::Read;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::{
    config::Config,
    error::AppError,
    models::{EncodedPayload, SessionContext},
    style::{format_prompt, Style},
};

/// Reads a file or blob fully and base64-encodes it.
pub fn encode_payload(mut source: impl Read) -> Result<String, AppError> {
    let mut raw = Vec::new();
    source.read_to_end(&mut raw).map_err(|e| AppError::PayloadRead(e.to_string()))?;
    Ok(encode_bytes(&raw))
}

pub fn encode_bytes(raw: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(raw)
}

/// Drops a `data:<mime>;base64,` prefix, leaving only the payload encoding.
pub fn strip_data_url(encoded: &str) -> &str {
    if encoded.starts_with("data:") {
        if let Some((_, payload)) = encoded.split_once(',') {
            return payload;
        }
    }
    encoded
}

pub fn decode_payload(encoded: &str) -> Result<Vec<u8>, AppError> {
    base64::engine::general_purpose::STANDARD
        .decode(strip_data_url(encoded).trim())
        .map_err(|e| AppError::PayloadRead(format!("invalid base64 payload: {}", e)))
}

// Helper function to truncate base64 data in JSON for cleaner logging
fn truncate_base64_in_json(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                if key == "data" {
                    if let Value::String(s) = val {
                        if s.len() > 100 {
                            *val = Value::String(format!("{}...[truncated {} chars]", &s[..50], s.len() - 50));
                        }
                    }
                } else {
                    truncate_base64_in_json(val);
                }
            }
        }
        Value::Array(arr) => {
            for val in arr.iter_mut() {
                truncate_base64_in_json(val);
            }
        }
        _ => {}
    }
}

/// Which instruction accompanies an audio payload. The request shape is the
/// same for all of them.
#[derive(Debug, Clone, Copy)]
pub enum Interpretation<'a> {
    MusicMood { context: Option<&'a str> },
    Speech { context: Option<&'a str> },
    Segment { ordinal: usize, total: usize },
    Ambient(&'a SessionContext),
}

impl Interpretation<'_> {
    pub fn instruction(&self) -> String {
        let extra = |context: Option<&str>| match context.map(str::trim).filter(|c| !c.is_empty()) {
            Some(c) => format!(" Take this additional context from the listener into account: {}.", c),
            None => String::new(),
        };
        match self {
            Interpretation::MusicMood { context } => format!(
                "Listen to this audio and describe the mood, energy, instruments and imagery it evokes. \
                 Turn that into one vivid, detailed prompt for an image generator describing a single scene.{} \
                 Reply with the prompt only, no preamble.",
                extra(*context)
            ),
            Interpretation::Speech { context } => format!(
                "Transcribe what is said in this audio and turn it into one vivid, detailed prompt for an image \
                 generator that depicts what the speaker describes.{} Reply with the prompt only, no preamble.",
                extra(*context)
            ),
            Interpretation::Segment { ordinal, total } => format!(
                "This audio is part {ordinal} of {total} of a longer recording. Describe the key moment, setting \
                 and emotion of this part as one detailed prompt for an image generator, as a single storyboard \
                 scene. Reply with the prompt only, no preamble."
            ),
            Interpretation::Ambient(ctx) => format!(
                "This is ambient sound captured around a person. Context:\n{}\n\
                 Infer what is happening around them from the sounds and the context, and write one detailed \
                 prompt for an image generator showing this moment from their life. Reply with the prompt only, \
                 no preamble.",
                ctx.describe()
            ),
        }
    }
}

/// Instruction sent alongside the base image (and optional remix image) of an edit.
pub fn edit_instruction(edit_text: &str, style: Style, has_remix: bool) -> String {
    let mut text = if edit_text.trim().is_empty() {
        "Re-render this image, keeping its subject and composition".to_string()
    } else {
        format!("Edit this image: {}", edit_text.trim())
    };
    if has_remix {
        text.push_str(". Blend in the subject, palette and elements of the second reference image");
    }
    format_prompt(&text, style)
}

/// The three capabilities of the generative backend, plus the two narrative summaries.
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn interpret_audio(&self, audio: &EncodedPayload, interpretation: Interpretation<'_>) -> Result<String, AppError>;

    async fn generate_image(&self, prompt: &str, style: Style) -> Result<EncodedPayload, AppError>;

    async fn edit_image(
        &self,
        base: &EncodedPayload,
        edit_text: &str,
        style: Style,
        remix: Option<&EncodedPayload>,
    ) -> Result<EncodedPayload, AppError>;

    async fn summarize_sequence(&self, prompts: &[String], context: &SessionContext) -> Result<String, AppError>;

    async fn summarize_audio(&self, audio: &EncodedPayload) -> Result<String, AppError>;
}

pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    text_model: String,
    image_model: String,
}

fn text_part(text: &str) -> Value {
    json!({ "text": text })
}

fn inline_part(payload: &EncodedPayload) -> Value {
    json!({ "inlineData": { "mimeType": payload.mime_type, "data": strip_data_url(&payload.data) } })
}

impl GeminiClient {
    pub fn new(api_key: String, config: &Config) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: config.api_base.trim_end_matches('/').to_string(),
            text_model: config.text_model.clone(),
            image_model: config.image_model.clone(),
        }
    }

    async fn perform_api_call(&self, model: &str, parts: Vec<Value>, generation_config: Value) -> Result<GeminiResponse, AppError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        info!("🔗 Making request to: {}", url);

        let request_body = json!({
            "contents": [{ "parts": parts }],
            "generationConfig": generation_config,
        });

        let mut logged = request_body.clone();
        truncate_base64_in_json(&mut logged);
        debug!("📤 Request body: {}", logged);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| AppError::Service(e.to_string()))?;

        let status = response.status();
        info!("📥 Response status: {}", status);

        let response_text = response.text().await.map_err(|e| AppError::Service(e.to_string()))?;
        if !status.is_success() {
            error!("❌ API Error response: {}", response_text);
            return Err(AppError::Service(format!("status={} body={}", status, response_text)));
        }

        if let Ok(mut json_value) = serde_json::from_str::<Value>(&response_text) {
            truncate_base64_in_json(&mut json_value);
            debug!("📥 Raw Gemini API response: {}", json_value);
        }

        serde_json::from_str(&response_text)
            .map_err(|e| AppError::Service(format!("parse error: {}", e)))
    }

    async fn text_call(&self, parts: Vec<Value>) -> Result<String, AppError> {
        let config = json!({ "temperature": 0.7, "topP": 0.95, "topK": 40 });
        let parsed = self.perform_api_call(&self.text_model, parts, config).await?;
        extract_text(&parsed)
    }

    async fn image_call(&self, parts: Vec<Value>) -> Result<EncodedPayload, AppError> {
        let config = json!({
            "responseModalities": ["TEXT", "IMAGE"],
            "temperature": 0.4,
            "topP": 0.95,
            "topK": 64,
            "candidateCount": 1
        });
        let parsed = self.perform_api_call(&self.image_model, parts, config).await?;
        let image = extract_first_image(&parsed)?;
        info!("🖼️ Extracted {} image ({} chars)", image.mime_type, image.data.len());
        Ok(image)
    }
}

#[async_trait]
impl GenerationService for GeminiClient {
    async fn interpret_audio(&self, audio: &EncodedPayload, interpretation: Interpretation<'_>) -> Result<String, AppError> {
        info!("🎧 Interpreting {} audio ({:?})", audio.mime_type, interpretation);
        let instruction = interpretation.instruction();
        self.text_call(vec![inline_part(audio), text_part(&instruction)]).await
    }

    async fn generate_image(&self, prompt: &str, style: Style) -> Result<EncodedPayload, AppError> {
        let prompt = format_prompt(prompt, style);
        info!("🎯 Generating image with prompt: {}", prompt.chars().take(100).collect::<String>());
        self.image_call(vec![text_part(&prompt)]).await
    }

    async fn edit_image(
        &self,
        base: &EncodedPayload,
        edit_text: &str,
        style: Style,
        remix: Option<&EncodedPayload>,
    ) -> Result<EncodedPayload, AppError> {
        let instruction = edit_instruction(edit_text, style, remix.is_some());
        info!("✏️ Editing image: {}", instruction);
        let mut parts = vec![inline_part(base)];
        if let Some(remix) = remix {
            parts.push(inline_part(remix));
        }
        parts.push(text_part(&instruction));
        self.image_call(parts).await
    }

    async fn summarize_sequence(&self, prompts: &[String], context: &SessionContext) -> Result<String, AppError> {
        let moments = prompts
            .iter()
            .enumerate()
            .map(|(i, p)| format!("{}. {}", i + 1, p))
            .collect::<Vec<_>>()
            .join("\n");
        let instruction = format!(
            "These are, in order, descriptions of moments captured from the ambient sound around one person.\n\
             Context:\n{}\n\nMoments:\n{}\n\n\
             Write a short narrative of this flow of life in Markdown: a title, then 3 to 5 paragraphs.",
            context.describe(),
            moments
        );
        self.text_call(vec![text_part(&instruction)])
            .await
            .map_err(|e| AppError::Summary(e.to_string()))
    }

    async fn summarize_audio(&self, audio: &EncodedPayload) -> Result<String, AppError> {
        let instruction = "Listen to this whole recording and write the story it tells in Markdown: \
                           a title, then 3 to 5 paragraphs following its arc from beginning to end.";
        self.text_call(vec![inline_part(audio), text_part(instruction)])
            .await
            .map_err(|e| AppError::Summary(e.to_string()))
    }
}

// --- Response Parsing Helpers ---

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
    #[serde(default)]
    block_reason_message: Option<String>,
    #[serde(default)]
    safety_ratings: Vec<SafetyRating>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Content,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    safety_ratings: Vec<SafetyRating>,
}

#[derive(Debug, Deserialize, Default)]
struct Content { #[serde(default)] parts: Vec<Part> }

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Part {
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
    Text { text: String },
    #[allow(dead_code)]
    Other(Value),
}

#[derive(Debug, Deserialize)]
struct InlineData {
    data: String,
    #[serde(rename = "mimeType")]
    mime_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SafetyRating {
    category: String,
    #[serde(default)]
    probability: Option<String>,
    #[serde(default)]
    blocked: bool,
}

const BLOCKING_FINISH_REASONS: [&str; 6] =
    ["SAFETY", "PROHIBITED_CONTENT", "BLOCKLIST", "SPII", "IMAGE_SAFETY", "RECITATION"];

fn flagged_categories(ratings: &[SafetyRating]) -> Vec<String> {
    ratings
        .iter()
        .filter(|r| r.blocked || matches!(r.probability.as_deref(), Some("HIGH") | Some("MEDIUM")))
        .map(|r| match &r.probability {
            Some(p) => format!("{} ({})", r.category, p),
            None => r.category.clone(),
        })
        .collect()
}

/// Block reason plus safety-category detail, when the service refused the request.
fn block_detail(resp: &GeminiResponse) -> Option<String> {
    let (reason, message, ratings) = if let Some(reason) = resp.prompt_feedback.as_ref().and_then(|f| f.block_reason.clone()) {
        let feedback = resp.prompt_feedback.as_ref()?;
        (reason, feedback.block_reason_message.clone(), &feedback.safety_ratings[..])
    } else {
        let candidate = resp
            .candidates
            .iter()
            .find(|c| c.finish_reason.as_deref().is_some_and(|r| BLOCKING_FINISH_REASONS.contains(&r)))?;
        (candidate.finish_reason.clone()?, None, &candidate.safety_ratings[..])
    };

    let mut detail = format!("reason: {}", reason);
    if let Some(message) = message {
        detail.push_str(&format!(" ({})", message));
    }
    let categories = flagged_categories(ratings);
    if !categories.is_empty() {
        detail.push_str(&format!("; categories: {}", categories.join(", ")));
    }
    Some(detail)
}

fn finish_reason(resp: &GeminiResponse) -> Option<&str> {
    resp.candidates.first().and_then(|c| c.finish_reason.as_deref())
}

fn extract_text(resp: &GeminiResponse) -> Result<String, AppError> {
    let text = resp
        .candidates
        .first()
        .map(|c| {
            c.content
                .parts
                .iter()
                .filter_map(|p| match p {
                    Part::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<String>()
        })
        .unwrap_or_default();
    let text = text.trim();

    if text.is_empty() {
        if let Some(detail) = block_detail(resp) {
            return Err(AppError::GenerationBlocked(detail));
        }
        let reason = finish_reason(resp).unwrap_or("none");
        return Err(AppError::EmptyResponse(format!("no text returned (finish reason: {})", reason)));
    }
    Ok(text.to_string())
}

fn extract_first_image(resp: &GeminiResponse) -> Result<EncodedPayload, AppError> {
    for c in &resp.candidates {
        for p in &c.content.parts {
            if let Part::Inline { inline_data } = p {
                return Ok(EncodedPayload {
                    data: inline_data.data.clone(),
                    mime_type: inline_data.mime_type.clone(),
                });
            }
        }
    }

    info!("⚠️ No inline image data found in response structure");
    let mut detail = if resp.candidates.is_empty() {
        "no candidates returned".to_string()
    } else {
        "no inline image in response".to_string()
    };
    if let Some(block) = block_detail(resp) {
        detail.push_str(&format!("; {}", block));
    } else if let Some(reason) = finish_reason(resp) {
        detail.push_str(&format!("; finish reason: {}", reason));
    }
    Err(AppError::NoImageProduced(detail))
}
