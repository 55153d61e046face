//! Long-form audio → sequential storyboard scenes + one narrative summary.

use std::{io::Cursor, sync::Arc};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{
    config::{MAX_UPLOAD_BYTES, MIN_STORYBOARD_BYTES},
    error::{check_size, AppError},
    gemini::{encode_bytes, GenerationService, Interpretation},
    models::{
        scene_filename, AudioFile, CaptureSegment, EncodedPayload, GeneratedImage, NamedImage, StoryboardResult,
        SUMMARY_UNAVAILABLE,
    },
    style::{format_prompt, Style},
};

/// Number of scenes for a recording of the given length.
pub fn segment_count(duration_secs: f64) -> usize {
    if duration_secs >= 1800.0 {
        7
    } else if duration_secs > 300.0 {
        5
    } else if duration_secs > 120.0 {
        4
    } else {
        3
    }
}

/// Splits the file into `count` contiguous byte ranges; the last one takes the remainder.
pub fn split_segments(file: &AudioFile, count: usize) -> Vec<CaptureSegment> {
    let count = count.max(1);
    let len = file.bytes.len();
    let size = len / count;
    (0..count)
        .map(|i| {
            let start = i * size;
            let end = if i + 1 == count { len } else { start + size };
            CaptureSegment {
                data: file.bytes.slice(start..end),
                mime_type: file.mime_type.clone(),
                ordinal: i + 1,
                total: count,
            }
        })
        .collect()
}

/// Reads the duration from the audio itself. WAV is decoded with `hound`;
/// other containers need a duration reported by the client that decoded them.
pub fn probe_duration(file: &AudioFile, reported_secs: Option<f64>) -> Result<f64, AppError> {
    match hound::WavReader::new(Cursor::new(&file.bytes[..])) {
        Ok(reader) => {
            let spec = reader.spec();
            if spec.sample_rate == 0 {
                return Err(AppError::PayloadRead("WAV header has a zero sample rate".into()));
            }
            Ok(reader.duration() as f64 / spec.sample_rate as f64)
        }
        Err(e) => match reported_secs {
            Some(secs) if secs.is_finite() && secs > 0.0 => Ok(secs),
            _ => Err(AppError::PayloadRead(format!(
                "could not read the duration of '{}' ({}): {}",
                file.name, file.mime_type, e
            ))),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StoryboardState {
    Idle,
    Processing { step: String, completed: usize, total: usize },
    Finished,
    Error { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StoryboardView {
    pub state: StoryboardState,
    /// Scenes produced so far; on error these stay visible until reset.
    pub scenes: Vec<NamedImage>,
    pub summary: Option<String>,
}

pub struct StoryboardPipeline {
    service: Arc<dyn GenerationService>,
    state: StoryboardState,
    scenes: Vec<NamedImage>,
    result: Option<StoryboardResult>,
    view: watch::Sender<StoryboardView>,
}

impl StoryboardPipeline {
    pub fn new(service: Arc<dyn GenerationService>) -> Self {
        let (view, _) = watch::channel(StoryboardView { state: StoryboardState::Idle, scenes: Vec::new(), summary: None });
        Self { service, state: StoryboardState::Idle, scenes: Vec::new(), result: None, view }
    }

    pub fn subscribe(&self) -> watch::Receiver<StoryboardView> {
        self.view.subscribe()
    }

    pub fn state(&self) -> &StoryboardState { &self.state }

    pub fn result(&self) -> Option<&StoryboardResult> { self.result.as_ref() }

    fn publish(&self) {
        self.view.send_replace(StoryboardView {
            state: self.state.clone(),
            scenes: self.scenes.clone(),
            summary: self.result.as_ref().map(|r| r.summary.clone()),
        });
    }

    fn set_state(&mut self, state: StoryboardState) {
        self.state = state;
        self.publish();
    }

    fn fail(&mut self, err: AppError) -> AppError {
        warn!("❌ Storyboard failed: {}", err);
        self.set_state(StoryboardState::Error { message: err.to_string() });
        err
    }

    /// Runs the whole pipeline for one uploaded file.
    pub async fn process_file(&mut self, file: AudioFile, reported_secs: Option<f64>) -> Result<StoryboardResult, AppError> {
        if matches!(self.state, StoryboardState::Processing { .. }) {
            return Err(AppError::SessionBusy);
        }
        self.reset();

        if let Err(e) = check_size(file.bytes.len(), Some(MIN_STORYBOARD_BYTES), MAX_UPLOAD_BYTES) {
            return Err(self.fail(e));
        }
        let duration = match probe_duration(&file, reported_secs) {
            Ok(d) => d,
            Err(e) => return Err(self.fail(e)),
        };
        let segments = split_segments(&file, segment_count(duration));
        let total = segments.len();
        info!("🎬 Storyboarding '{}' ({:.0}s) into {} scenes", file.name, duration, total);

        for segment in &segments {
            self.set_state(StoryboardState::Processing {
                step: format!("Analyzing scene {} of {}", segment.ordinal, total),
                completed: segment.ordinal - 1,
                total,
            });
            let audio = EncodedPayload { data: encode_bytes(&segment.data), mime_type: segment.mime_type.clone() };
            let interpretation = Interpretation::Segment { ordinal: segment.ordinal, total };
            let prompt = match self.service.interpret_audio(&audio, interpretation).await {
                Ok(p) => p,
                Err(e) => return Err(self.fail(e)),
            };

            self.set_state(StoryboardState::Processing {
                step: format!("Drawing scene {} of {}", segment.ordinal, total),
                completed: segment.ordinal - 1,
                total,
            });
            let image = match self.service.generate_image(&prompt, Style::BATCH).await {
                Ok(image) => image,
                Err(e) => return Err(self.fail(e)),
            };
            self.scenes.push(NamedImage {
                filename: scene_filename(segment.ordinal),
                image: GeneratedImage::new(image, format_prompt(&prompt, Style::BATCH)),
            });
            info!("✅ Scene {}/{} ready", segment.ordinal, total);
            self.publish();
        }

        self.set_state(StoryboardState::Processing { step: "Writing the story".into(), completed: total, total });
        let whole = EncodedPayload { data: encode_bytes(&file.bytes), mime_type: file.mime_type.clone() };
        let summary = match self.service.summarize_audio(&whole).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!("⚠️ Story summary unavailable: {}", e);
                SUMMARY_UNAVAILABLE.to_string()
            }
        };

        let result = StoryboardResult { scenes: self.scenes.clone(), summary };
        self.result = Some(result.clone());
        self.set_state(StoryboardState::Finished);
        Ok(result)
    }

    /// Back to Idle with nothing kept.
    pub fn reset(&mut self) {
        self.scenes.clear();
        self.result = None;
        self.set_state(StoryboardState::Idle);
    }
}
