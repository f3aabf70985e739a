//! Raster composition for one epoch and the ready gate for export.

use std::sync::Mutex;

use image::{DynamicImage, RgbaImage};
use log::{debug, info, warn};
use nounify_vision::{DetectionResult, OverlayAsset, OverlayTransform, RasterSurface};

use crate::epoch::{Epoch, EpochCounter};
use crate::error::{PipelineError, PipelineResult};

/// What happened to one face of a detection result.
#[derive(Debug, Clone, PartialEq)]
pub enum FaceOutcome {
    Drawn(OverlayTransform),
    Skipped { reason: String },
}

/// Per-face results of one render, in detector order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderOutcome {
    pub faces: Vec<FaceOutcome>,
}

impl RenderOutcome {
    pub fn drawn(&self) -> usize {
        self.faces
            .iter()
            .filter(|f| matches!(f, FaceOutcome::Drawn(_)))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.faces.len() - self.drawn()
    }
}

/// Read-only view of what a front end should display.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderSnapshot {
    pub epoch: Epoch,
    pub ready: bool,
    pub image: Option<RgbaImage>,
    pub outcome: Option<RenderOutcome>,
}

impl RenderSnapshot {
    /// A visible surface that must not be mistaken for the final result.
    pub fn is_provisional(&self) -> bool {
        !self.ready && self.image.is_some()
    }
}

#[derive(Default)]
struct Staged {
    epoch: Epoch,
    surface: Option<RasterSurface>,
    ready: bool,
    outcome: Option<RenderOutcome>,
}

/// Owner of the surface and ready flag.
///
/// A render draws into a private surface and swaps it in only if its epoch
/// is still current, so the staged surface is never partially updated.
#[derive(Default)]
pub struct RenderStage {
    staged: Mutex<Staged>,
}

impl RenderStage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Staged> {
        self.staged.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand the stage to a new epoch. The ready flag drops immediately; the
    /// previous surface is either dropped or kept on screen as provisional.
    pub fn begin(&self, epoch: Epoch, keep_surface: bool) {
        let mut staged = self.lock();
        staged.epoch = epoch;
        staged.ready = false;
        staged.outcome = None;
        if !keep_surface {
            staged.surface = None;
        }
    }

    pub async fn render(
        &self,
        epoch: Epoch,
        epochs: &EpochCounter,
        background: &DynamicImage,
        overlay: &OverlayAsset,
        faces: &DetectionResult,
    ) -> PipelineResult<RenderOutcome> {
        epochs.ensure_current(epoch)?;

        let mut surface = RasterSurface::from_background(background);
        let mut outcome = RenderOutcome::default();

        for (index, landmarks) in faces.iter().enumerate() {
            tokio::task::yield_now().await;
            epochs.ensure_current(epoch)?;

            match OverlayTransform::from_landmarks(landmarks) {
                Ok(transform) => {
                    debug!("face {}: {:?}", index, transform);
                    surface.draw_overlay(overlay, &transform);
                    outcome.faces.push(FaceOutcome::Drawn(transform));
                }
                Err(e) => {
                    warn!("skipping face {}: {}", index, e);
                    outcome.faces.push(FaceOutcome::Skipped {
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.commit(epoch, epochs, surface, outcome.clone())?;
        info!(
            "render for epoch {} ready: {} drawn, {} skipped",
            epoch,
            outcome.drawn(),
            outcome.skipped()
        );
        Ok(outcome)
    }

    fn commit(
        &self,
        epoch: Epoch,
        epochs: &EpochCounter,
        surface: RasterSurface,
        outcome: RenderOutcome,
    ) -> PipelineResult<()> {
        let mut staged = self.lock();
        if staged.epoch != epoch || !epochs.is_current(epoch) {
            return Err(PipelineError::Stale { epoch });
        }
        staged.surface = Some(surface);
        staged.outcome = Some(outcome);
        staged.ready = true;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    pub fn is_ready_for(&self, epoch: Epoch) -> bool {
        let staged = self.lock();
        staged.ready && staged.epoch == epoch
    }

    pub fn snapshot(&self) -> RenderSnapshot {
        let staged = self.lock();
        RenderSnapshot {
            epoch: staged.epoch,
            ready: staged.ready,
            image: staged.surface.as_ref().map(|s| s.image().clone()),
            outcome: staged.outcome.clone(),
        }
    }

    /// PNG of the finished surface. Refused unless the current epoch's
    /// render is complete.
    pub fn export_png(&self, epochs: &EpochCounter) -> PipelineResult<Vec<u8>> {
        let staged = self.lock();
        if !staged.ready || !epochs.is_current(staged.epoch) {
            return Err(PipelineError::NotReady);
        }
        let surface = staged.surface.as_ref().ok_or(PipelineError::NotReady)?;
        surface.encode_png().map_err(PipelineError::export)
    }
}
