//! Timed ambient capture: one image per capture interval until a target is
//! reached or the user stops, then a narrative of the whole run.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    capture::CaptureDevice,
    error::AppError,
    gemini::{encode_bytes, GenerationService, Interpretation},
    models::{live_filename, EncodedPayload, GeneratedImage, NamedImage, SessionContext, SUMMARY_UNAVAILABLE},
    style::{format_prompt, Style},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TargetMode {
    Count { image_count: u32 },
    Duration { minutes: u32 },
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveConfig {
    pub context: SessionContext,
    pub target: TargetMode,
    pub interval_secs: u64,
}

impl LiveConfig {
    pub fn target_count(&self) -> usize {
        match self.target {
            TargetMode::Count { image_count } => image_count as usize,
            TargetMode::Duration { minutes } if self.interval_secs > 0 => {
                (minutes as u64 * 60 / self.interval_secs) as usize
            }
            TargetMode::Duration { .. } => 0,
        }
    }

    /// Checks the run can produce at least one image and returns the target.
    pub fn validate(&self) -> Result<usize, AppError> {
        if self.interval_secs == 0 {
            return Err(AppError::Validation("capture interval must be at least 1 second".into()));
        }
        match self.target_count() {
            0 => Err(AppError::Validation(
                "target is zero images; raise the count or duration, or shorten the interval".into(),
            )),
            n => Ok(n),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LiveState {
    Config,
    Recording,
    /// Capture has stopped and the summary is being written.
    Generating,
    Finished,
    Error { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveView {
    pub state: LiveState,
    pub images: Vec<NamedImage>,
    pub target: usize,
    pub seconds_to_next_capture: u64,
    pub processing: bool,
    pub summary: Option<String>,
}

struct Run {
    state: LiveState,
    context: Option<SessionContext>,
    images: Vec<NamedImage>,
    prompts: Vec<String>,
    target: usize,
    interval_secs: u64,
    countdown: u64,
    summary: Option<String>,
}

impl Run {
    fn empty() -> Self {
        Self {
            state: LiveState::Config,
            context: None,
            images: Vec::new(),
            prompts: Vec::new(),
            target: 0,
            interval_secs: 0,
            countdown: 0,
            summary: None,
        }
    }
}

struct Inner {
    service: Arc<dyn GenerationService>,
    device: Arc<dyn CaptureDevice>,
    min_chunk_bytes: usize,
    run: Mutex<Run>,
    /// Set while a tick's chunk is being interpreted and drawn.
    in_flight: AtomicBool,
    /// Bumped by every start; work tagged with an older value is discarded.
    generation: AtomicU64,
    stop: watch::Sender<bool>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    processing: Mutex<Option<JoinHandle<()>>>,
    view: watch::Sender<LiveView>,
}

#[derive(Clone)]
pub struct LivePipeline {
    inner: Arc<Inner>,
}

impl LivePipeline {
    pub fn new(service: Arc<dyn GenerationService>, device: Arc<dyn CaptureDevice>, min_chunk_bytes: usize) -> Self {
        let (stop, _) = watch::channel(true);
        let (view, _) = watch::channel(LiveView {
            state: LiveState::Config,
            images: Vec::new(),
            target: 0,
            seconds_to_next_capture: 0,
            processing: false,
            summary: None,
        });
        Self {
            inner: Arc::new(Inner {
                service,
                device,
                min_chunk_bytes,
                run: Mutex::new(Run::empty()),
                in_flight: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                stop,
                timers: Mutex::new(Vec::new()),
                processing: Mutex::new(None),
                view,
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LiveView> {
        self.inner.view.subscribe()
    }

    pub fn state(&self) -> LiveState {
        self.inner.run.lock().state.clone()
    }

    /// Validates the configuration, claims the device and starts both timers.
    pub fn start(&self, config: LiveConfig) -> Result<usize, AppError> {
        let inner = &self.inner;
        let target = config.validate()?;
        {
            let mut run = inner.run.lock();
            if run.state != LiveState::Config {
                return Err(AppError::SessionBusy);
            }
            if inner.processing_pending() {
                return Err(AppError::SessionBusy);
            }
            if let Err(e) = inner.device.acquire() {
                drop(run);
                inner.fail(e.clone());
                return Err(e);
            }
            *run = Run {
                state: LiveState::Recording,
                context: Some(config.context.clone()),
                target,
                interval_secs: config.interval_secs,
                countdown: config.interval_secs,
                ..Run::empty()
            };
            inner.generation.fetch_add(1, Ordering::AcqRel);
        }
        inner.in_flight.store(false, Ordering::Release);
        inner.stop.send_replace(false);

        let interval = Duration::from_secs(config.interval_secs);
        let ticker = tokio::spawn(tick_loop(inner.clone(), interval, inner.stop.subscribe()));
        let countdown = tokio::spawn(countdown_loop(inner.clone(), inner.stop.subscribe()));
        inner.timers.lock().extend([ticker, countdown]);

        info!(
            "⏺️ Live capture started at {} ({}): {} images every {}s",
            config.context.location(),
            config.context.activity(),
            target,
            config.interval_secs
        );
        inner.publish();
        Ok(target)
    }

    /// Manual stop. Waits for an in-flight tick, then summarizes, or returns
    /// to Config when nothing was captured.
    pub async fn stop(&self) -> Result<(), AppError> {
        let inner = &self.inner;
        if inner.run.lock().state != LiveState::Recording {
            return Err(AppError::Validation("capture is not running".into()));
        }
        inner.halt_capture();

        let pending = inner.processing.lock().take();
        if let Some(handle) = pending {
            if let Err(e) = handle.await {
                warn!("⚠️ In-flight capture task ended abnormally: {}", e);
            }
        }

        let captured = {
            let mut run = inner.run.lock();
            if run.state != LiveState::Recording {
                return Ok(());
            }
            if run.images.is_empty() {
                *run = Run::empty();
                None
            } else {
                Some(run.images.len())
            }
        };
        match captured {
            None => {
                info!("⏹️ Stopped with no images; back to config");
                inner.publish();
            }
            Some(n) => {
                info!("⏹️ Stopped after {} images", n);
                inner.finalize().await;
            }
        }
        Ok(())
    }

    /// Hard capture failure reported by the client (e.g. microphone permission denied).
    /// Only a run that is configuring or recording can fail this way.
    pub fn capture_failed(&self, reason: &str) -> Result<(), AppError> {
        let state = self.state();
        if !matches!(state, LiveState::Config | LiveState::Recording) {
            return Err(AppError::Validation(format!(
                "capture failure ignored: run is {:?}, not configuring or recording",
                state
            )));
        }
        self.inner.halt_capture();
        self.inner.fail(AppError::Capture(reason.to_string()));
        Ok(())
    }

    /// Clears everything and returns to Config. Not allowed mid-run.
    pub fn reset(&self) -> Result<(), AppError> {
        let inner = &self.inner;
        {
            let mut run = inner.run.lock();
            if matches!(run.state, LiveState::Recording | LiveState::Generating) {
                return Err(AppError::SessionBusy);
            }
            *run = Run::empty();
        }
        inner.cancel_processing();
        inner.publish();
        Ok(())
    }

    /// Stops capture and cancels pending work so the pipeline can be dropped.
    /// Refused while the summary is being written.
    pub fn discard(&self) -> Result<(), AppError> {
        if self.state() == LiveState::Generating {
            return Err(AppError::SessionBusy);
        }
        self.inner.halt_capture();
        self.inner.cancel_processing();
        info!("🗑️ Live run discarded");
        Ok(())
    }

    /// Images and summary once the run has finished.
    pub fn finished_run(&self) -> Option<(Vec<NamedImage>, String)> {
        let run = self.inner.run.lock();
        match (&run.state, &run.summary) {
            (LiveState::Finished, Some(summary)) => Some((run.images.clone(), summary.clone())),
            _ => None,
        }
    }
}

async fn tick_loop(inner: Arc<Inner>, interval: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => inner.on_tick(),
        }
    }
    debug!("Tick loop ended");
}

async fn countdown_loop(inner: Arc<Inner>, mut stop: watch::Receiver<bool>) {
    let mut second = time::interval_at(Instant::now() + Duration::from_secs(1), Duration::from_secs(1));
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = second.tick() => {
                {
                    let mut run = inner.run.lock();
                    run.countdown = if run.countdown <= 1 { run.interval_secs } else { run.countdown - 1 };
                }
                inner.publish();
            }
        }
    }
}

impl Inner {
    fn publish(&self) {
        let run = self.run.lock();
        let view = LiveView {
            state: run.state.clone(),
            images: run.images.clone(),
            target: run.target,
            seconds_to_next_capture: run.countdown,
            processing: self.in_flight.load(Ordering::Acquire),
            summary: run.summary.clone(),
        };
        drop(run);
        self.view.send_replace(view);
    }

    fn fail(&self, err: AppError) {
        warn!("❌ Live capture failed: {}", err);
        self.run.lock().state = LiveState::Error { message: err.to_string() };
        self.publish();
    }

    /// Signals stop, cancels both timers and releases the device. Idempotent.
    fn halt_capture(&self) {
        self.stop.send_replace(true);
        for handle in self.timers.lock().drain(..) {
            handle.abort();
        }
        self.device.release();
    }

    fn processing_pending(&self) -> bool {
        self.processing.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Aborts an in-flight tick left over from an abandoned run.
    fn cancel_processing(&self) {
        if let Some(handle) = self.processing.lock().take() {
            handle.abort();
        }
        self.in_flight.store(false, Ordering::Release);
    }

    /// Extracts the window since the last tick, unless the previous tick is
    /// still being processed, in which case this tick does nothing.
    fn on_tick(self: &Arc<Self>) {
        if *self.stop.borrow() {
            return;
        }
        if self.in_flight.swap(true, Ordering::AcqRel) {
            debug!("Previous capture still processing; skipping tick");
            return;
        }
        let chunk = self.device.take_chunk();
        if chunk.len() < self.min_chunk_bytes {
            debug!("Discarding {} byte chunk as silence", chunk.len());
            self.in_flight.store(false, Ordering::Release);
            return;
        }

        let generation = self.generation.load(Ordering::Acquire);
        let inner = self.clone();
        let handle = tokio::spawn(async move {
            inner.process_chunk(chunk, generation).await;
            if inner.generation.load(Ordering::Acquire) == generation {
                inner.in_flight.store(false, Ordering::Release);
                inner.publish();
            }
        });
        *self.processing.lock() = Some(handle);
        self.publish();
    }

    /// True while `generation` is the run that is still recording.
    fn is_current(&self, run: &Run, generation: u64) -> bool {
        run.state == LiveState::Recording && self.generation.load(Ordering::Acquire) == generation
    }

    async fn process_chunk(self: &Arc<Self>, chunk: Bytes, generation: u64) {
        let Some(context) = self.run.lock().context.clone() else { return };
        let audio = EncodedPayload { data: encode_bytes(&chunk), mime_type: self.device.mime_type().to_string() };

        let generated = async {
            let prompt = self.service.interpret_audio(&audio, Interpretation::Ambient(&context)).await?;
            let image = self.service.generate_image(&prompt, Style::BATCH).await?;
            Ok::<_, AppError>((prompt, image))
        }
        .await;

        let (prompt, image) = match generated {
            Ok(done) => done,
            Err(e) => {
                let current = self.is_current(&self.run.lock(), generation);
                if current {
                    self.halt_capture();
                    self.fail(e);
                } else {
                    debug!("Dropping failure from a finished run: {}", e);
                }
                return;
            }
        };

        let reached_target = {
            let mut run = self.run.lock();
            if !self.is_current(&run, generation) {
                debug!("Dropping image from a finished run");
                return;
            }
            let ordinal = run.images.len() + 1;
            run.images.push(NamedImage {
                filename: live_filename(ordinal),
                image: GeneratedImage::new(image, format_prompt(&prompt, Style::BATCH)),
            });
            run.prompts.push(prompt);
            info!("✅ Captured image {}/{}", ordinal, run.target);
            ordinal >= run.target
        };
        self.publish();

        // A manual stop already signalled owns the shutdown.
        if reached_target && !*self.stop.borrow() {
            info!("🎯 Target reached; stopping capture");
            self.halt_capture();
            self.finalize().await;
        }
    }

    /// Recording → Generating → Finished. Runs at most once per run.
    async fn finalize(&self) {
        let (prompts, context) = {
            let mut run = self.run.lock();
            if run.state != LiveState::Recording {
                return;
            }
            run.state = LiveState::Generating;
            (run.prompts.clone(), run.context.clone())
        };
        self.publish();

        let summary = match context {
            Some(ctx) => match self.service.summarize_sequence(&prompts, &ctx).await {
                Ok(summary) => summary,
                Err(e) => {
                    warn!("⚠️ Live summary unavailable: {}", e);
                    SUMMARY_UNAVAILABLE.to_string()
                }
            },
            None => SUMMARY_UNAVAILABLE.to_string(),
        };

        {
            let mut run = self.run.lock();
            run.summary = Some(summary);
            run.state = LiveState::Finished;
        }
        info!("🏁 Live run finished");
        self.publish();
    }
}
