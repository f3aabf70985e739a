//! Sequencing of model load, detection, render and export per submission.

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio::sync::watch;

use crate::epoch::{Epoch, EpochCounter};
use crate::error::{PipelineError, PipelineResult};
use crate::export::{ExportSink, DEFAULT_OUTPUT_NAME};
use crate::pipeline::{
    DetectKey, Detected, DetectionCache, DetectionState, ModelCache, ModelLoader, OverlayCache,
    SourceImage,
};
use crate::render::{RenderOutcome, RenderSnapshot, RenderStage};

/// Handle for one accepted (image, threshold) submission.
#[derive(Debug, Clone)]
pub struct Ticket {
    epoch: Epoch,
    key: DetectKey,
    source: SourceImage,
}

impl Ticket {
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn key(&self) -> &DetectKey {
        &self.key
    }
}

pub fn validate_confidence(value: f32) -> PipelineResult<f32> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(PipelineError::InvalidThreshold { value })
    }
}

/// Drives the detection-to-composite pipeline.
///
/// Every `submit` starts a new epoch. Work started for an older epoch keeps
/// running but can no longer touch the state, the surface or the ready flag.
pub struct Nounifier<L: ModelLoader> {
    models: Arc<ModelCache<L>>,
    overlay: OverlayCache,
    epochs: EpochCounter,
    detections: DetectionCache,
    stage: RenderStage,
    current_uri: Mutex<Option<String>>,
    state: watch::Sender<DetectionState>,
}

impl<L: ModelLoader> Nounifier<L> {
    /// `models` may be shared with other sessions; it loads at most once.
    pub fn new(models: Arc<ModelCache<L>>, overlay: OverlayCache) -> Self {
        let (state, _) = watch::channel(DetectionState::Idle);
        Self {
            models,
            overlay,
            epochs: EpochCounter::new(),
            detections: DetectionCache::new(),
            stage: RenderStage::new(),
            current_uri: Mutex::new(None),
            state,
        }
    }

    pub fn models(&self) -> &Arc<ModelCache<L>> {
        &self.models
    }

    pub fn current_epoch(&self) -> Epoch {
        self.epochs.current()
    }

    /// Accept new inputs. Anything in flight for earlier inputs goes stale.
    ///
    /// The previous surface stays visible as provisional when only the
    /// threshold changed; a different image drops it.
    pub fn submit(&self, source: SourceImage, min_confidence: f32) -> PipelineResult<Ticket> {
        let min_confidence = validate_confidence(min_confidence)?;

        let same_image = {
            let mut uri = self.current_uri.lock().unwrap_or_else(|e| e.into_inner());
            let same = uri.as_deref() == Some(source.uri());
            *uri = Some(source.uri().to_string());
            same
        };

        let epoch = self.epochs.advance();
        self.stage.begin(epoch, same_image);
        self.state.send_replace(DetectionState::Idle);
        info!(
            "epoch {}: {} at min confidence {}",
            epoch,
            source.uri(),
            min_confidence
        );

        Ok(Ticket {
            epoch,
            key: DetectKey::new(source.uri(), min_confidence),
            source,
        })
    }

    /// Load models, detect, then render for `ticket`.
    ///
    /// Returns `Stale` without side effects if a newer submission arrived at
    /// any point.
    pub async fn process(&self, ticket: &Ticket) -> PipelineResult<RenderOutcome> {
        let result = self.process_inner(ticket).await;
        match &result {
            Err(e) if e.is_stale() => debug!("discarding stale work for epoch {}", ticket.epoch),
            Err(e) => warn!("epoch {}: {}", ticket.epoch, e),
            Ok(_) => {}
        }
        result
    }

    async fn process_inner(&self, ticket: &Ticket) -> PipelineResult<RenderOutcome> {
        let epoch = ticket.epoch;
        self.epochs.ensure_current(epoch)?;

        self.transition(epoch, DetectionState::ModelLoading);
        let model = match self.models.ready().await {
            Ok(model) => model,
            Err(e) => return Err(self.fail(epoch, e)),
        };
        self.epochs.ensure_current(epoch)?;

        self.transition(epoch, DetectionState::Detecting);
        let Detected { image, faces } =
            match self.detections.detect(&ticket.key, &ticket.source, model).await {
                Ok(detected) => detected,
                Err(e) => return Err(self.fail(epoch, e)),
            };
        self.epochs.ensure_current(epoch)?;
        self.transition(epoch, DetectionState::Succeeded { faces: faces.len() });

        let overlay = match self.overlay.get().await {
            Ok(overlay) => overlay,
            Err(e) => {
                self.epochs.ensure_current(epoch)?;
                return Err(e);
            }
        };
        self.stage
            .render(epoch, &self.epochs, &image, &overlay, &faces)
            .await
    }

    /// Convenience for `submit` followed by `process`.
    pub async fn run(&self, source: SourceImage, min_confidence: f32) -> PipelineResult<RenderOutcome> {
        let ticket = self.submit(source, min_confidence)?;
        self.process(&ticket).await
    }

    fn transition(&self, epoch: Epoch, state: DetectionState) {
        if self.epochs.is_current(epoch) {
            debug!("epoch {}: {:?}", epoch, state);
            self.state.send_replace(state);
        }
    }

    fn fail(&self, epoch: Epoch, error: PipelineError) -> PipelineError {
        if !self.epochs.is_current(epoch) {
            return PipelineError::Stale { epoch };
        }
        self.transition(
            epoch,
            DetectionState::Failed {
                error: error.clone(),
            },
        );
        error
    }

    pub fn state(&self) -> DetectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DetectionState> {
        self.state.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.stage.is_ready_for(self.epochs.current())
    }

    pub fn snapshot(&self) -> RenderSnapshot {
        self.stage.snapshot()
    }

    pub fn export_png(&self) -> PipelineResult<Vec<u8>> {
        self.stage.export_png(&self.epochs)
    }

    /// Hand the finished PNG to `sink` as [`DEFAULT_OUTPUT_NAME`].
    pub fn export_to<S: ExportSink + ?Sized>(&self, sink: &mut S) -> PipelineResult<()> {
        let png = self.export_png()?;
        sink.accept(DEFAULT_OUTPUT_NAME, &png)
            .map_err(|e| PipelineError::export(format!("{:#}", e)))
    }
}
