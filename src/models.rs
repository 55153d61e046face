use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::AppError, style::Style};

/// Stands in for a narrative summary the service failed to produce.
pub const SUMMARY_UNAVAILABLE: &str = "Summary unavailable.";

static LAST_IMAGE_ID: AtomicI64 = AtomicI64::new(0);

/// Millisecond timestamp id, bumped past the previous id when two images
/// land in the same millisecond.
pub fn next_image_id() -> i64 {
    let now = Utc::now().timestamp_millis();
    let mut prev = LAST_IMAGE_ID.load(Ordering::Acquire);
    loop {
        let candidate = now.max(prev + 1);
        match LAST_IMAGE_ID.compare_exchange(prev, candidate, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return candidate,
            Err(actual) => prev = actual,
        }
    }
}

/// Base64 payload plus the mime type it was read or returned with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedPayload {
    pub data: String,
    pub mime_type: String,
}

/// A file as it arrived from an upload or a recording.
#[derive(Debug, Clone)]
pub struct AudioFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedImage {
    pub id: i64,
    pub image_data: String,
    pub mime_type: String,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
}

impl GeneratedImage {
    pub fn new(image: EncodedPayload, prompt: String) -> Arc<Self> {
        Arc::new(Self {
            id: next_image_id(),
            image_data: image.data,
            mime_type: image.mime_type,
            prompt,
            created_at: Utc::now(),
        })
    }

    pub fn payload(&self) -> EncodedPayload {
        EncodedPayload { data: self.image_data.clone(), mime_type: self.mime_type.clone() }
    }
}

/// Append-only list of versions with one selected entry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImageHistory {
    entries: Vec<Arc<GeneratedImage>>,
    active: Option<usize>,
}

impl ImageHistory {
    /// Starts a new lineage from a root image.
    pub fn reset_with(&mut self, root: Arc<GeneratedImage>) {
        self.entries = vec![root];
        self.active = Some(0);
    }

    /// Appends a version and selects it.
    pub fn push(&mut self, image: Arc<GeneratedImage>) -> usize {
        self.entries.push(image);
        let index = self.entries.len() - 1;
        self.active = Some(index);
        index
    }

    pub fn select(&mut self, index: usize) -> Result<(), AppError> {
        if index >= self.entries.len() {
            return Err(AppError::Validation(format!(
                "history index {} out of range (have {})",
                index,
                self.entries.len()
            )));
        }
        self.active = Some(index);
        Ok(())
    }

    pub fn active(&self) -> Option<&Arc<GeneratedImage>> {
        self.active.and_then(|i| self.entries.get(i))
    }

    pub fn active_index(&self) -> Option<usize> { self.active }

    pub fn entries(&self) -> &[Arc<GeneratedImage>] { &self.entries }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

#[derive(Debug, Clone, Deserialize)]
struct RawContext {
    #[serde(default)] location: String,
    #[serde(default)] area_type: String,
    #[serde(default)] time_of_day: String,
    #[serde(default)] activity: String,
    #[serde(default)] gender: String,
    #[serde(default)] age: String,
}

/// Who and where the live capture is happening. Location, activity and age are required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawContext")]
pub struct SessionContext {
    location: String,
    area_type: String,
    time_of_day: String,
    activity: String,
    gender: String,
    age: String,
}

impl SessionContext {
    pub fn new(
        location: impl Into<String>,
        area_type: impl Into<String>,
        time_of_day: impl Into<String>,
        activity: impl Into<String>,
        gender: impl Into<String>,
        age: impl Into<String>,
    ) -> Result<Self, AppError> {
        let ctx = Self {
            location: location.into().trim().to_string(),
            area_type: area_type.into().trim().to_string(),
            time_of_day: time_of_day.into().trim().to_string(),
            activity: activity.into().trim().to_string(),
            gender: gender.into().trim().to_string(),
            age: age.into().trim().to_string(),
        };
        let missing: Vec<&str> = [("location", &ctx.location), ("activity", &ctx.activity), ("age", &ctx.age)]
            .into_iter()
            .filter(|(_, v)| v.is_empty())
            .map(|(name, _)| name)
            .collect();
        if !missing.is_empty() {
            return Err(AppError::Validation(format!("missing context: {}", missing.join(", "))));
        }
        Ok(ctx)
    }

    /// One `Label: value` line per filled-in field, for instructions.
    pub fn describe(&self) -> String {
        [
            ("Location", &self.location),
            ("Area type", &self.area_type),
            ("Time of day", &self.time_of_day),
            ("Activity", &self.activity),
            ("Gender", &self.gender),
            ("Age", &self.age),
        ]
        .into_iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(label, v)| format!("{}: {}", label, v))
        .collect::<Vec<_>>()
        .join("\n")
    }

    pub fn location(&self) -> &str { &self.location }
    pub fn activity(&self) -> &str { &self.activity }
}

impl TryFrom<RawContext> for SessionContext {
    type Error = AppError;

    fn try_from(raw: RawContext) -> Result<Self, Self::Error> {
        Self::new(raw.location, raw.area_type, raw.time_of_day, raw.activity, raw.gender, raw.age)
    }
}

/// Contiguous slice of an audio file with its 1-based position.
#[derive(Debug, Clone)]
pub struct CaptureSegment {
    pub data: Bytes,
    pub mime_type: String,
    pub ordinal: usize,
    pub total: usize,
}

/// An image tagged with the filename it gets in an exported archive.
#[derive(Debug, Clone, Serialize)]
pub struct NamedImage {
    pub filename: String,
    pub image: Arc<GeneratedImage>,
}

pub fn scene_filename(ordinal: usize) -> String { format!("scene_{:02}.jpg", ordinal) }

pub fn live_filename(ordinal: usize) -> String { format!("image_{}.jpeg", ordinal) }

#[derive(Debug, Clone, Serialize)]
pub struct StoryboardResult {
    pub scenes: Vec<NamedImage>,
    pub summary: String,
}

/// How a single-image session should read an audio source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioIntent {
    #[default]
    MusicMood,
    Speech,
}

// --- HTTP request bodies ---

#[derive(Debug, Deserialize)]
pub struct CredentialRequest {
    pub api_key: String,
}

#[derive(Debug, Deserialize)]
pub struct PromptRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub style: Style,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub intent: AudioIntent,
    #[serde(default)]
    pub confirm_discard: bool,
}

#[derive(Debug, Deserialize)]
pub struct SelectRequest {
    pub index: usize,
}

#[derive(Debug, Deserialize)]
pub struct CaptureErrorRequest {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn image(prompt: &str) -> Arc<GeneratedImage> {
        GeneratedImage::new(EncodedPayload { data: "AAAA".into(), mime_type: "image/png".into() }, prompt.into())
    }

    #[test]
    fn image_ids_are_strictly_increasing() {
        let ids: Vec<i64> = (0..500).map(|_| next_image_id()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn selecting_never_changes_history() {
        let mut history = ImageHistory::default();
        history.reset_with(image("root"));
        history.push(image("root\n\n---\n[Edit: more]"));
        let before: Vec<i64> = history.entries().iter().map(|e| e.id).collect();
        for _ in 0..3 {
            history.select(0).unwrap();
        }
        let after: Vec<i64> = history.entries().iter().map(|e| e.id).collect();
        assert_eq!(before, after);
        assert_eq!(history.active_index(), Some(0));
        assert!(history.select(2).is_err());
        assert_eq!(history.active_index(), Some(0));
    }

    #[test]
    fn context_requires_location_activity_and_age() {
        let err = SessionContext::new("", "urban", "", " ", "", "").unwrap_err();
        assert_eq!(err, AppError::Validation("missing context: location, activity, age".into()));

        let ctx: SessionContext = serde_json::from_str(
            r#"{"location":"Lisbon","activity":"walking","age":"34","time_of_day":"dusk"}"#,
        )
        .unwrap();
        assert_eq!(ctx.describe(), "Location: Lisbon\nTime of day: dusk\nActivity: walking\nAge: 34");

        assert!(serde_json::from_str::<SessionContext>(r#"{"location":"Lisbon"}"#).is_err());
    }

    #[test]
    fn archive_filenames() {
        assert_eq!(scene_filename(3), "scene_03.jpg");
        assert_eq!(scene_filename(12), "scene_12.jpg");
        assert_eq!(live_filename(7), "image_7.jpeg");
    }
}
