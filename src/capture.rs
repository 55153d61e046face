use bytes::Bytes;
use parking_lot::Mutex;
use tracing::info;

use crate::{config::MAX_UPLOAD_BYTES, error::AppError};

/// A microphone-like source: claimed exclusively, drained in windows, released on exit.
pub trait CaptureDevice: Send + Sync {
    /// Claims the device. Fails if it is already held or access was denied.
    fn acquire(&self) -> Result<(), AppError>;
    /// Everything buffered since the previous call; the buffer is left empty.
    fn take_chunk(&self) -> Bytes;
    /// Stops capturing and drops anything still buffered.
    fn release(&self);
    fn mime_type(&self) -> &str;
}

#[derive(Default)]
struct BufferState {
    active: bool,
    buffer: Vec<u8>,
}

/// Capture device fed from the outside (the browser streams its microphone
/// recorder output to the server in small pushes).
pub struct BufferedCapture {
    mime_type: String,
    state: Mutex<BufferState>,
}

impl BufferedCapture {
    pub fn new(mime_type: impl Into<String>) -> Self {
        Self { mime_type: mime_type.into(), state: Mutex::new(BufferState::default()) }
    }

    pub fn push(&self, data: &[u8]) -> Result<(), AppError> {
        let mut state = self.state.lock();
        if !state.active {
            return Err(AppError::Capture("capture is not running".into()));
        }
        if state.buffer.len() + data.len() > MAX_UPLOAD_BYTES {
            return Err(AppError::Validation(format!(
                "buffered audio would reach {} bytes, exceeding the maximum of {} bytes",
                state.buffer.len() + data.len(),
                MAX_UPLOAD_BYTES
            )));
        }
        state.buffer.extend_from_slice(data);
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }
}

impl CaptureDevice for BufferedCapture {
    fn acquire(&self) -> Result<(), AppError> {
        let mut state = self.state.lock();
        if state.active {
            return Err(AppError::Capture("capture device is already in use".into()));
        }
        state.active = true;
        state.buffer.clear();
        info!("🎙️ Capture device acquired");
        Ok(())
    }

    fn take_chunk(&self) -> Bytes {
        Bytes::from(std::mem::take(&mut self.state.lock().buffer))
    }

    fn release(&self) {
        let mut state = self.state.lock();
        if state.active {
            info!("🔇 Capture device released");
        }
        state.active = false;
        state.buffer.clear();
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }
}
