/// Upper bound for every audio/image upload and recording.
pub const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;
/// Storyboard input below this is treated as too short to segment.
pub const MIN_STORYBOARD_BYTES: usize = 1024 * 1024;

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: Option<String>,
    pub api_base: String,
    pub text_model: String,
    pub image_model: String,
    pub port: u16,
    /// Live-capture chunks smaller than this are treated as silence.
    pub live_min_chunk_bytes: usize,
    pub live_capture_mime: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            text_model: "gemini-2.5-flash".to_string(),
            image_model: "gemini-2.5-flash-image-preview".to_string(),
            port: 8080,
            live_min_chunk_bytes: 2_000,
            live_capture_mime: "audio/webm".to_string(),
        }
    }
}

impl Config {
    /// Reads configuration from the environment (after `.env` has been loaded).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            api_key: non_empty("GEMINI_API_KEY"),
            api_base: non_empty("GEMINI_API_BASE").unwrap_or(defaults.api_base),
            text_model: non_empty("GEMINI_TEXT_MODEL").unwrap_or(defaults.text_model),
            image_model: non_empty("GEMINI_IMAGE_MODEL").unwrap_or(defaults.image_model),
            port: non_empty("PORT").and_then(|v| v.parse().ok()).unwrap_or(defaults.port),
            live_min_chunk_bytes: non_empty("LIVE_MIN_CHUNK_BYTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.live_min_chunk_bytes),
            live_capture_mime: non_empty("LIVE_CAPTURE_MIME").unwrap_or(defaults.live_capture_mime),
        }
    }
}
