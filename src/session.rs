//! Single-image creation and iterative edit/remix.
//!
//! A session is driven by exactly one caller at a time (`&mut self`); every
//! change is published as a [`SessionView`] so a renderer can follow the
//! state without touching the session itself.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{
    config::MAX_UPLOAD_BYTES,
    error::{check_size, AppError},
    gemini::{encode_bytes, GenerationService, Interpretation},
    models::{AudioFile, AudioIntent, EncodedPayload, GeneratedImage, ImageHistory},
    style::{format_prompt, Style},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Analyzing,
    Generating,
    Editing,
    Error(String),
}

impl SessionState {
    /// Idle and Error accept new actions; the rest mean a step is in flight.
    pub fn accepts_actions(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Error(_))
    }

    fn begin(&self, next: SessionState) -> Result<SessionState, AppError> {
        if self.accepts_actions() { Ok(next) } else { Err(AppError::SessionBusy) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioSourceKind {
    Recording,
    Upload,
}

#[derive(Debug, Clone)]
struct ArmedAudio {
    kind: AudioSourceKind,
    file: AudioFile,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArmedAudioView {
    pub kind: AudioSourceKind,
    pub name: String,
    pub size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub state: SessionState,
    pub prompt: String,
    pub armed_audio: Option<ArmedAudioView>,
    pub history: ImageHistory,
}

/// What an action did, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Applied,
    /// The caller declined to discard the current prompt.
    Declined,
    /// Nothing to do (e.g. an edit with no text and no style).
    Skipped,
}

/// `<prev>\n\n---\n[Filter: <style>]\n[Edit: <text>]`, each bracketed line
/// only when it carries something.
pub fn extend_lineage(previous: &str, edit_text: &str, style: Style) -> String {
    let mut lineage = format!("{}\n\n---", previous);
    if style != Style::Unspecified {
        lineage.push_str(&format!("\n[Filter: {}]", style.tag()));
    }
    let edit_text = edit_text.trim();
    if !edit_text.is_empty() {
        lineage.push_str(&format!("\n[Edit: {}]", edit_text));
    }
    lineage
}

pub struct ImageSession {
    service: Arc<dyn GenerationService>,
    state: SessionState,
    prompt: String,
    audio: Option<ArmedAudio>,
    history: ImageHistory,
    view: watch::Sender<SessionView>,
}

impl ImageSession {
    pub fn new(service: Arc<dyn GenerationService>) -> Self {
        let (view, _) = watch::channel(SessionView {
            state: SessionState::Idle,
            prompt: String::new(),
            armed_audio: None,
            history: ImageHistory::default(),
        });
        Self { service, state: SessionState::Idle, prompt: String::new(), audio: None, history: ImageHistory::default(), view }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.subscribe()
    }

    pub fn state(&self) -> &SessionState { &self.state }

    pub fn prompt(&self) -> &str { &self.prompt }

    pub fn history(&self) -> &ImageHistory { &self.history }

    pub fn has_audio(&self) -> bool { self.audio.is_some() }

    fn publish(&self) {
        let view = SessionView {
            state: self.state.clone(),
            prompt: self.prompt.clone(),
            armed_audio: self.audio.as_ref().map(|a| ArmedAudioView {
                kind: a.kind,
                name: a.file.name.clone(),
                size: a.file.bytes.len(),
            }),
            history: self.history.clone(),
        };
        self.view.send_replace(view);
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.publish();
    }

    fn fail(&mut self, err: AppError) -> AppError {
        warn!("❌ Session step failed: {}", err);
        self.set_state(SessionState::Error(err.to_string()));
        err
    }

    /// Typing a non-empty prompt disarms any audio source.
    pub fn set_prompt(&mut self, text: &str) {
        self.prompt = text.to_string();
        if !text.trim().is_empty() && self.audio.take().is_some() {
            info!("⌨️ Prompt typed, audio source cleared");
        }
        self.publish();
    }

    pub fn recording_completed(&mut self, file: AudioFile, confirm: impl FnOnce() -> bool) -> Result<Outcome, AppError> {
        self.arm(AudioSourceKind::Recording, file, confirm)
    }

    pub fn file_uploaded(&mut self, file: AudioFile, confirm: impl FnOnce() -> bool) -> Result<Outcome, AppError> {
        self.arm(AudioSourceKind::Upload, file, confirm)
    }

    fn arm(&mut self, kind: AudioSourceKind, file: AudioFile, confirm: impl FnOnce() -> bool) -> Result<Outcome, AppError> {
        if !self.state.accepts_actions() {
            return Err(AppError::SessionBusy);
        }
        check_size(file.bytes.len(), None, MAX_UPLOAD_BYTES)?;
        if !self.confirm_discard(confirm) {
            return Ok(Outcome::Declined);
        }
        info!("🎙️ Armed {:?} audio '{}' ({} bytes)", kind, file.name, file.bytes.len());
        self.audio = Some(ArmedAudio { kind, file });
        self.publish();
        Ok(Outcome::Applied)
    }

    /// Asks before an audio-triggered action throws away a typed prompt.
    fn confirm_discard(&mut self, confirm: impl FnOnce() -> bool) -> bool {
        if self.prompt.trim().is_empty() {
            return true;
        }
        if !confirm() {
            return false;
        }
        self.prompt.clear();
        true
    }

    /// Creates a root image from the prompt, or from the armed audio when the
    /// prompt is empty. A leftover stored prompt is never discarded here: the
    /// audio path then returns `Declined` and the caller must confirm through
    /// [`ImageSession::create_from_audio`].
    pub async fn create_from_text(&mut self, prompt: &str, style: Style) -> Result<Outcome, AppError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            if self.audio.is_some() {
                return self.create_from_audio(None, style, AudioIntent::default(), || false).await;
            }
            return Err(AppError::Validation("prompt required".into()));
        }

        self.state = self.state.begin(SessionState::Generating)?;
        self.prompt = prompt.to_string();
        self.audio = None;
        self.publish();
        self.generate_root(style).await
    }

    /// Interprets the armed audio into a prompt, surfaces it, then generates from it.
    pub async fn create_from_audio(
        &mut self,
        context: Option<&str>,
        style: Style,
        intent: AudioIntent,
        confirm: impl FnOnce() -> bool,
    ) -> Result<Outcome, AppError> {
        self.state.begin(SessionState::Analyzing)?;
        let armed = self
            .audio
            .clone()
            .ok_or_else(|| AppError::Validation("no audio source selected".into()))?;
        if !self.confirm_discard(confirm) {
            return Ok(Outcome::Declined);
        }

        self.set_state(SessionState::Analyzing);
        let payload = EncodedPayload { data: encode_bytes(&armed.file.bytes), mime_type: armed.file.mime_type.clone() };
        let interpretation = match intent {
            AudioIntent::MusicMood => Interpretation::MusicMood { context },
            AudioIntent::Speech => Interpretation::Speech { context },
        };
        let prompt = match self.service.interpret_audio(&payload, interpretation).await {
            Ok(prompt) => prompt,
            Err(e) => return Err(self.fail(e)),
        };
        info!("📝 Audio interpreted into prompt ({} chars)", prompt.len());

        self.prompt = prompt;
        self.state = SessionState::Generating;
        self.publish();
        let outcome = self.generate_root(style).await?;
        self.audio = None;
        self.publish();
        Ok(outcome)
    }

    async fn generate_root(&mut self, style: Style) -> Result<Outcome, AppError> {
        let prompt = self.prompt.clone();
        match self.service.generate_image(&prompt, style).await {
            Ok(image) => {
                self.history.reset_with(GeneratedImage::new(image, format_prompt(&prompt, style)));
                info!("✅ Root image generated");
                self.set_state(SessionState::Idle);
                Ok(Outcome::Applied)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Appends an edited version of the selected image and selects it.
    pub async fn edit_active(
        &mut self,
        edit_text: &str,
        style: Style,
        remix: Option<EncodedPayload>,
    ) -> Result<Outcome, AppError> {
        let next = self.state.begin(SessionState::Editing)?;
        if self.history.is_empty() {
            return Err(AppError::Validation("no image to edit yet".into()));
        }
        let base = self
            .history
            .active()
            .cloned()
            .ok_or_else(|| AppError::Validation("no image selected to edit".into()))?;
        if edit_text.trim().is_empty() && style == Style::Unspecified {
            return Ok(Outcome::Skipped);
        }

        self.set_state(next);
        match self.service.edit_image(&base.payload(), edit_text.trim(), style, remix.as_ref()).await {
            Ok(image) => {
                let lineage = extend_lineage(&base.prompt, edit_text, style);
                let index = self.history.push(GeneratedImage::new(image, lineage));
                info!("✅ Edit appended as version {}", index);
                self.set_state(SessionState::Idle);
                Ok(Outcome::Applied)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    pub fn select(&mut self, index: usize) -> Result<(), AppError> {
        self.history.select(index)?;
        self.publish();
        Ok(())
    }

    /// Clears the error message; history and prompt stay.
    pub fn acknowledge_error(&mut self) {
        if let SessionState::Error(_) = self.state {
            self.set_state(SessionState::Idle);
        }
    }
}
