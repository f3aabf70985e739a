pub mod config;
pub mod epoch;
pub mod error;
pub mod export;
pub mod pipeline;
pub mod render;
pub mod session;

pub use epoch::{Epoch, EpochCounter};
pub use error::{PipelineError, PipelineResult};
pub use export::{ExportSink, FileSink, MemorySink, DEFAULT_OUTPUT_NAME};
pub use pipeline::{
    DetectKey, DetectionState, FaceModel, ModelCache, ModelLoader, OnnxLoader, OverlayCache,
    SourceImage,
};
pub use render::{FaceOutcome, RenderOutcome, RenderSnapshot};
pub use session::{Nounifier, Ticket};

// Re-export vision types for convenience
pub use nounify_vision::{
    DetectionResult, LandmarkSet, OverlayAsset, OverlayTransform, Point, RasterSurface,
};
