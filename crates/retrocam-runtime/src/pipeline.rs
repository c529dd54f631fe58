use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use retrocam_core::{
    default_seed, plan_for, CoreError, EffectsBackend, ImageBackend, PipelineOutput, PipelineRequest, PipelineSettings, PipelineStage,
    TelemetryEvent, TelemetryEventType, TelemetrySink,
};
use retrocam_effects::CpuEffects;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::LocalImageBackend;

/// Sequential decode → plan → resample → effects → encode.
///
/// CPU work runs on the blocking pool; every stage races the cancellation
/// token and the optional per-stage timeout.
#[derive(Clone)]
pub struct Pipeline {
    images: Arc<dyn ImageBackend>,
    effects: Arc<dyn EffectsBackend>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(Arc::new(LocalImageBackend), Arc::new(CpuEffects))
    }
}

impl Pipeline {
    pub fn new(images: Arc<dyn ImageBackend>, effects: Arc<dyn EffectsBackend>) -> Self {
        Self {
            images,
            effects,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub async fn run(&self, request: PipelineRequest, cancel: &CancellationToken) -> Result<PipelineOutput, CoreError> {
        let start = Instant::now();
        self.emit(TelemetryEventType::PipelineStart, None, None, None);
        let result = self.run_stages(request, cancel).await;
        let elapsed = Some(start.elapsed().as_millis() as u64);
        match &result {
            Ok(output) => {
                log::info!(
                    "processed {}x{} -> {}x{} {} ({} bytes)",
                    output.plan.source.width,
                    output.plan.source.height,
                    output.blob.width,
                    output.blob.height,
                    output.blob.format.mime_type(),
                    output.blob.bytes.len()
                );
                self.emit(
                    TelemetryEventType::PipelineSuccess,
                    None,
                    elapsed,
                    Some(format!("{}x{}", output.blob.width, output.blob.height)),
                );
            }
            Err(CoreError::Cancelled) => {
                log::debug!("pipeline cancelled");
                self.emit(TelemetryEventType::PipelineCancelled, None, elapsed, None);
            }
            Err(err) => self.emit(TelemetryEventType::PipelineError, None, elapsed, Some(err.to_string())),
        }
        result
    }

    /// Reads `path` and runs the pipeline on its bytes.
    pub async fn run_file(
        &self,
        path: &Path,
        settings: PipelineSettings,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutput, CoreError> {
        let started = Instant::now();
        let input_bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
            bytes = crate::read_input(path) => bytes?,
        };
        self.stage_done(PipelineStage::Read, started, Some(format!("{} bytes", input_bytes.len())));
        self.run(PipelineRequest { input_bytes, settings }, cancel).await
    }

    async fn run_stages(&self, request: PipelineRequest, cancel: &CancellationToken) -> Result<PipelineOutput, CoreError> {
        let PipelineRequest { input_bytes, settings } = request;
        let timeout = settings.stage_timeout;

        let images = Arc::clone(&self.images);
        let max_decoded_pixels = settings.max_decoded_pixels;
        let source = self
            .stage(PipelineStage::Decode, cancel, timeout, move || {
                images.decode(&input_bytes, max_decoded_pixels)
            })
            .await?;

        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let started = Instant::now();
        let plan = plan_for(source.size(), &settings)?;
        self.stage_done(
            PipelineStage::Plan,
            started,
            Some(format!(
                "{}x{} -> {}x{} scale={:.4} clamped={}",
                plan.source.width, plan.source.height, plan.target.width, plan.target.height, plan.scale_factor, plan.clamped
            )),
        );

        let source_format = source.format.clone();
        let images = Arc::clone(&self.images);
        let (target, filter) = (plan.target, settings.filter);
        let resampled = self
            .stage(PipelineStage::Resample, cancel, timeout, move || {
                images.resample(&source, target, filter)
            })
            .await?;

        let effects = Arc::clone(&self.effects);
        let chain = settings.chain.clone();
        let seed = settings.seed.unwrap_or_else(|| default_seed(plan.target));
        let processed = self
            .stage(PipelineStage::Effects, cancel, timeout, move || effects.apply(resampled, &chain, seed))
            .await?;

        let images = Arc::clone(&self.images);
        let (format, quality) = (settings.format, settings.quality);
        let blob = self
            .stage(PipelineStage::Encode, cancel, timeout, move || images.encode(&processed, format, quality))
            .await?;

        Ok(PipelineOutput {
            blob,
            plan,
            source_format,
            seed,
        })
    }

    async fn stage<T, F>(
        &self,
        stage: PipelineStage,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
        work: F,
    ) -> Result<T, CoreError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, CoreError> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let started = Instant::now();
        let handle = tokio::task::spawn_blocking(work);
        let joined = async move {
            match handle.await {
                Ok(result) => result,
                Err(err) => Err(CoreError::Internal(format!("{} stage failed: {}", stage.label(), err))),
            }
        };
        let bounded = async move {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, joined).await {
                    Ok(result) => result,
                    Err(_) => Err(CoreError::Timeout { stage, after: limit }),
                },
                None => joined.await,
            }
        };
        let value = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CoreError::Cancelled),
            result = bounded => result,
        }?;
        self.stage_done(stage, started, None);
        Ok(value)
    }

    fn stage_done(&self, stage: PipelineStage, started: Instant, detail: Option<String>) {
        let elapsed = started.elapsed().as_millis() as u64;
        log::debug!("{} stage finished in {}ms", stage.label(), elapsed);
        self.emit(TelemetryEventType::StageSuccess, Some(stage), Some(elapsed), detail);
    }

    fn emit(&self, event_type: TelemetryEventType, stage: Option<PipelineStage>, duration_ms: Option<u64>, detail: Option<String>) {
        if let Some(sink) = &self.telemetry {
            sink.emit(TelemetryEvent {
                event_type,
                stage,
                duration_ms,
                detail,
            });
        }
    }
}

/// Runs one job at a time from the caller's point of view: submitting a new
/// job cancels whichever job was submitted before it.
pub struct LatestOnly {
    pipeline: Pipeline,
    slot: Mutex<JobSlot>,
}

#[derive(Default)]
struct JobSlot {
    next_id: u64,
    active: Option<(u64, CancellationToken)>,
}

impl LatestOnly {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            slot: Mutex::new(JobSlot::default()),
        }
    }

    pub async fn submit(&self, request: PipelineRequest) -> Result<PipelineOutput, CoreError> {
        let token = CancellationToken::new();
        let id = {
            let mut slot = self.slot.lock().await;
            let id = slot.next_id;
            slot.next_id += 1;
            if let Some((previous_id, previous)) = slot.active.replace((id, token.clone())) {
                log::debug!("cancelling superseded job {}", previous_id);
                previous.cancel();
            }
            id
        };

        let result = self.pipeline.run(request, &token).await;

        let mut slot = self.slot.lock().await;
        if matches!(slot.active, Some((active_id, _)) if active_id == id) {
            slot.active = None;
        }
        result
    }

    /// Cancels the running job, if any. Returns whether one was running.
    pub async fn cancel_current(&self) -> bool {
        match self.slot.lock().await.active.take() {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}
