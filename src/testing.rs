//! In-memory `GenerationService` used by the pipeline and route tests.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    error::AppError,
    gemini::{decode_payload, GenerationService, Interpretation},
    models::{EncodedPayload, SessionContext},
    style::Style,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Interpret { instruction: String, audio: Vec<u8> },
    Generate { prompt: String, style: Style },
    Edit { edit_text: String, style: Style, remix: bool },
    SummarizeSequence(Vec<String>),
    SummarizeAudio { bytes: usize },
}

#[derive(Default)]
pub struct FakeService {
    pub calls: Mutex<Vec<Call>>,
    pub generate_delay: Duration,
    /// 1-based index of the interpret call that fails.
    pub fail_interpret_at: Option<usize>,
    pub fail_generate: Option<AppError>,
    pub fail_summary: bool,
}

impl FakeService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    pub fn network_calls(&self) -> usize {
        self.calls.lock().len()
    }

    fn interpret_count(&self) -> usize {
        self.count(|c| matches!(c, Call::Interpret { .. }))
    }
}

fn fake_image(tag: &str) -> EncodedPayload {
    EncodedPayload { data: crate::gemini::encode_bytes(tag.as_bytes()), mime_type: "image/jpeg".into() }
}

#[async_trait]
impl GenerationService for FakeService {
    async fn interpret_audio(&self, audio: &EncodedPayload, interpretation: Interpretation<'_>) -> Result<String, AppError> {
        let bytes = decode_payload(&audio.data)?;
        self.calls.lock().push(Call::Interpret { instruction: interpretation.instruction(), audio: bytes });
        let n = self.interpret_count();
        if self.fail_interpret_at == Some(n) {
            return Err(AppError::GenerationBlocked("reason: SAFETY".into()));
        }
        Ok(format!("prompt {}", n))
    }

    async fn generate_image(&self, prompt: &str, style: Style) -> Result<EncodedPayload, AppError> {
        self.calls.lock().push(Call::Generate { prompt: prompt.to_string(), style });
        if !self.generate_delay.is_zero() {
            tokio::time::sleep(self.generate_delay).await;
        }
        if let Some(err) = &self.fail_generate {
            return Err(err.clone());
        }
        Ok(fake_image(prompt))
    }

    async fn edit_image(
        &self,
        _base: &EncodedPayload,
        edit_text: &str,
        style: Style,
        remix: Option<&EncodedPayload>,
    ) -> Result<EncodedPayload, AppError> {
        self.calls.lock().push(Call::Edit { edit_text: edit_text.to_string(), style, remix: remix.is_some() });
        if let Some(err) = &self.fail_generate {
            return Err(err.clone());
        }
        Ok(fake_image(edit_text))
    }

    async fn summarize_sequence(&self, prompts: &[String], _context: &SessionContext) -> Result<String, AppError> {
        self.calls.lock().push(Call::SummarizeSequence(prompts.to_vec()));
        if self.fail_summary {
            return Err(AppError::Summary("quota exceeded".into()));
        }
        Ok(format!("# Flow of life\n\n{} moments.", prompts.len()))
    }

    async fn summarize_audio(&self, audio: &EncodedPayload) -> Result<String, AppError> {
        let bytes = decode_payload(&audio.data)?.len();
        self.calls.lock().push(Call::SummarizeAudio { bytes });
        if self.fail_summary {
            return Err(AppError::Summary("quota exceeded".into()));
        }
        Ok("# The story\n\nIt went well.".to_string())
    }
}
