pub mod compositor;
pub mod error;
pub mod face;
pub mod geometry;
pub mod model;
pub mod yunet;

// Re-export commonly used types
pub use compositor::{Canvas, OverlayAsset, RasterSurface};
pub use error::{Eye, VisionError};
pub use face::OnnxFaceModel;
pub use geometry::{DetectionResult, LandmarkSet, OverlayTransform, Point};
pub use model::ModelPaths;
