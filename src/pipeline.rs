//! Model readiness and keyed face detection.
//!
//! Both the model load and each detection are compute-bound, so they run on
//! tokio's blocking pool and are awaited from the cooperative task.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use image::DynamicImage;
use log::{debug, info, warn};
use nounify_vision::{DetectionResult, ModelPaths, OnnxFaceModel, OverlayAsset};
use tokio::sync::OnceCell;

use crate::error::{PipelineError, PipelineResult};

/// Detector producing eye landmarks for every face above a confidence.
pub trait FaceModel: Send + Sync + 'static {
    fn detect(&self, image: &DynamicImage, min_confidence: f32) -> anyhow::Result<DetectionResult>;
}

/// Loads a [`FaceModel`] and all of its artifacts.
pub trait ModelLoader: Send + Sync + 'static {
    type Model: FaceModel;

    fn load(&self) -> anyhow::Result<Self::Model>;
}

impl FaceModel for OnnxFaceModel {
    fn detect(&self, image: &DynamicImage, min_confidence: f32) -> anyhow::Result<DetectionResult> {
        OnnxFaceModel::detect(self, image, min_confidence)
    }
}

/// Loads the ONNX detector and landmark predictor from disk.
#[derive(Debug, Clone)]
pub struct OnnxLoader {
    paths: ModelPaths,
}

impl OnnxLoader {
    pub fn new(paths: ModelPaths) -> Self {
        Self { paths }
    }

    pub fn in_dir(base: impl AsRef<Path>) -> Self {
        Self::new(ModelPaths::in_dir(base))
    }
}

impl ModelLoader for OnnxLoader {
    type Model = OnnxFaceModel;

    fn load(&self) -> anyhow::Result<OnnxFaceModel> {
        OnnxFaceModel::load(&self.paths)
    }
}

/// Write-once model slot.
///
/// The first `ready()` loads the model; every later call shares it. A failed
/// load is kept as well, so detection stays unavailable for the lifetime of
/// the cache instead of retrying.
pub struct ModelCache<L: ModelLoader> {
    loader: Arc<L>,
    model: OnceCell<PipelineResult<Arc<L::Model>>>,
}

impl<L: ModelLoader> ModelCache<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader: Arc::new(loader),
            model: OnceCell::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.model.get(), Some(Ok(_)))
    }

    pub async fn ready(&self) -> PipelineResult<Arc<L::Model>> {
        self.model
            .get_or_init(|| async {
                info!("loading face models");
                let loader = Arc::clone(&self.loader);
                match tokio::task::spawn_blocking(move || loader.load()).await {
                    Ok(Ok(model)) => {
                        info!("face models ready");
                        Ok(Arc::new(model))
                    }
                    Ok(Err(e)) => {
                        warn!("face models failed to load: {:#}", e);
                        Err(PipelineError::model_load(format!("{:#}", e)))
                    }
                    Err(e) => Err(PipelineError::model_load(e)),
                }
            })
            .await
            .clone()
    }
}

enum OverlaySource {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
}

/// Write-once overlay asset. Draws await it, so nothing is ever drawn from a
/// half-decoded asset.
pub struct OverlayCache {
    source: OverlaySource,
    asset: OnceCell<PipelineResult<Arc<OverlayAsset>>>,
}

impl OverlayCache {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            source: OverlaySource::Path(path.into()),
            asset: OnceCell::new(),
        }
    }

    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            source: OverlaySource::Bytes(bytes.into()),
            asset: OnceCell::new(),
        }
    }

    pub fn preloaded(asset: OverlayAsset) -> Self {
        Self {
            source: OverlaySource::Bytes(Arc::from(Vec::new())),
            asset: OnceCell::new_with(Some(Ok(Arc::new(asset)))),
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.asset.get(), Some(Ok(_)))
    }

    pub async fn get(&self) -> PipelineResult<Arc<OverlayAsset>> {
        self.asset
            .get_or_init(|| async {
                let bytes: Arc<[u8]> = match &self.source {
                    OverlaySource::Path(path) => match tokio::fs::read(path).await {
                        Ok(bytes) => bytes.into(),
                        Err(e) => {
                            return Err(PipelineError::asset(format!(
                                "reading {}: {}",
                                path.display(),
                                e
                            )))
                        }
                    },
                    OverlaySource::Bytes(bytes) => Arc::clone(bytes),
                };
                let decoded =
                    tokio::task::spawn_blocking(move || OverlayAsset::from_bytes(&bytes)).await;
                match decoded {
                    Ok(Ok(asset)) => Ok(Arc::new(asset)),
                    Ok(Err(e)) => Err(PipelineError::asset(e)),
                    Err(e) => Err(PipelineError::asset(e)),
                }
            })
            .await
            .clone()
    }
}

/// Encoded source image plus the URI that identifies it.
#[derive(Debug, Clone)]
pub struct SourceImage {
    uri: String,
    bytes: Arc<[u8]>,
}

impl SourceImage {
    pub fn from_bytes(uri: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            uri: uri.into(),
            bytes: bytes.into(),
        }
    }

    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        Ok(Self::from_bytes(path.display().to_string(), bytes))
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Identity of one detection request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DetectKey {
    uri: String,
    min_confidence_bits: u32,
}

impl DetectKey {
    pub fn new(uri: impl Into<String>, min_confidence: f32) -> Self {
        Self {
            uri: uri.into(),
            min_confidence_bits: min_confidence.to_bits(),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn min_confidence(&self) -> f32 {
        f32::from_bits(self.min_confidence_bits)
    }
}

/// Decoded source image together with the faces found in it.
#[derive(Debug, Clone)]
pub struct Detected {
    pub image: Arc<DynamicImage>,
    pub faces: Arc<DetectionResult>,
}

/// Per-submission detection lifecycle.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DetectionState {
    #[default]
    Idle,
    ModelLoading,
    Detecting,
    Succeeded { faces: usize },
    Failed { error: PipelineError },
}

type DetectionCell = Arc<OnceCell<PipelineResult<Detected>>>;

/// Finished detections kept around for resubmission.
const RETAINED_DETECTIONS: usize = 8;

/// Deduplicates detections by [`DetectKey`].
///
/// Callers with the same key share one in-flight computation, however many
/// other keys were submitted in between. Finished entries are pruned once
/// more than [`RETAINED_DETECTIONS`] keys are held; in-flight entries stay
/// until they finish. A completed failure is not reused, so resubmitting the
/// same input retries.
#[derive(Default)]
pub struct DetectionCache {
    cells: Mutex<HashMap<DetectKey, DetectionCell>>,
}

impl DetectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell_for(&self, key: &DetectKey) -> DetectionCell {
        let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        cells.retain(|_, cell| !matches!(cell.get(), Some(Err(_))));

        if let Some(cell) = cells.get(key) {
            debug!("joining detection for {}", key.uri());
            return Arc::clone(cell);
        }

        if cells.len() >= RETAINED_DETECTIONS {
            // Abandoned cells (no caller left awaiting them) go as well.
            cells.retain(|_, cell| !cell.initialized() && Arc::strong_count(cell) > 1);
        }

        let cell: DetectionCell = Arc::new(OnceCell::new());
        cells.insert(key.clone(), Arc::clone(&cell));
        cell
    }

    /// Number of keys currently held, finished or in flight.
    pub fn len(&self) -> usize {
        self.cells.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn detect<M: FaceModel>(
        &self,
        key: &DetectKey,
        source: &SourceImage,
        model: Arc<M>,
    ) -> PipelineResult<Detected> {
        let cell = self.cell_for(key);
        cell.get_or_init(|| run_detection(Arc::clone(&source.bytes), key.min_confidence(), model))
            .await
            .clone()
    }
}

/// Decode on the blocking pool; the decoded image is the render background.
pub async fn decode_image(bytes: Arc<[u8]>) -> PipelineResult<DynamicImage> {
    match tokio::task::spawn_blocking(move || image::load_from_memory(&bytes)).await {
        Ok(Ok(image)) => Ok(image),
        Ok(Err(e)) => Err(PipelineError::detection(format!("decoding source image: {}", e))),
        Err(e) => Err(PipelineError::detection(e)),
    }
}

async fn run_detection<M: FaceModel>(
    bytes: Arc<[u8]>,
    min_confidence: f32,
    model: Arc<M>,
) -> PipelineResult<Detected> {
    let image = Arc::new(decode_image(bytes).await?);
    debug!(
        "decoded source image {}x{}",
        image.width(),
        image.height()
    );

    let input = Arc::clone(&image);
    let faces = match tokio::task::spawn_blocking(move || model.detect(&input, min_confidence)).await
    {
        Ok(Ok(faces)) => faces,
        Ok(Err(e)) => return Err(PipelineError::detection(format!("{:#}", e))),
        Err(e) => return Err(PipelineError::detection(e)),
    };
    info!("detected {} face(s)", faces.len());

    Ok(Detected {
        image,
        faces: Arc::new(faces),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLoader {
        loads: Arc<AtomicUsize>,
        fail: bool,
    }

    #[derive(Debug)]
    struct NoFaces;

    impl FaceModel for NoFaces {
        fn detect(&self, _: &DynamicImage, _: f32) -> anyhow::Result<DetectionResult> {
            Ok(Vec::new())
        }
    }

    impl ModelLoader for CountingLoader {
        type Model = NoFaces;

        fn load(&self) -> anyhow::Result<NoFaces> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("weights missing");
            }
            Ok(NoFaces)
        }
    }

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        DynamicImage::new_rgb8(w, h)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[tokio::test]
    async fn model_loads_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let cache = ModelCache::new(CountingLoader {
            loads: Arc::clone(&loads),
            fail: false,
        });
        assert!(!cache.is_ready());

        let (a, b) = tokio::join!(cache.ready(), cache.ready());
        assert!(a.is_ok() && b.is_ok());
        cache.ready().await.unwrap();

        assert!(cache.is_ready());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_load_is_not_retried() {
        let loads = Arc::new(AtomicUsize::new(0));
        let cache = ModelCache::new(CountingLoader {
            loads: Arc::clone(&loads),
            fail: true,
        });

        let first = cache.ready().await.unwrap_err();
        let second = cache.ready().await.unwrap_err();
        assert!(matches!(first, PipelineError::ModelLoad { .. }));
        assert_eq!(first, second);
        assert!(!cache.is_ready());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn overlay_from_bad_bytes_fails() {
        let cache = OverlayCache::from_bytes(vec![1u8, 2, 3]);
        assert!(matches!(
            cache.get().await,
            Err(PipelineError::Asset { .. })
        ));
        assert!(!cache.is_loaded());
    }

    #[tokio::test]
    async fn overlay_from_png_loads() {
        let cache = OverlayCache::from_bytes(png_bytes(150, 80));
        let asset = cache.get().await.unwrap();
        assert_eq!(asset.image().dimensions(), (150, 80));
        assert!(cache.is_loaded());
    }

    #[tokio::test]
    async fn missing_overlay_file_fails() {
        let cache = OverlayCache::from_path("/nonexistent/glasses-red.png");
        assert!(matches!(
            cache.get().await,
            Err(PipelineError::Asset { .. })
        ));
    }

    #[tokio::test]
    async fn undecodable_source_is_detection_failure() {
        let cache = DetectionCache::new();
        let source = SourceImage::from_bytes("broken", vec![0u8; 16]);
        let key = DetectKey::new(source.uri(), 0.3);
        let err = cache
            .detect(&key, &source, Arc::new(NoFaces))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Detection { .. }));
    }

    #[tokio::test]
    async fn zero_faces_is_success() {
        let cache = DetectionCache::new();
        let source = SourceImage::from_bytes("blank.png", png_bytes(8, 6));
        let key = DetectKey::new(source.uri(), 0.3);
        let detected = cache.detect(&key, &source, Arc::new(NoFaces)).await.unwrap();
        assert!(detected.faces.is_empty());
        assert_eq!((detected.image.width(), detected.image.height()), (8, 6));
    }

    struct FailingModel {
        calls: Arc<AtomicUsize>,
    }

    impl FaceModel for FailingModel {
        fn detect(&self, _: &DynamicImage, _: f32) -> anyhow::Result<DetectionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("inference failed")
        }
    }

    #[tokio::test]
    async fn failed_detection_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let model = Arc::new(FailingModel {
            calls: Arc::clone(&calls),
        });
        let cache = DetectionCache::new();
        let source = SourceImage::from_bytes("a.png", png_bytes(4, 4));
        let key = DetectKey::new(source.uri(), 0.3);

        assert!(cache.detect(&key, &source, Arc::clone(&model)).await.is_err());
        assert!(cache.detect(&key, &source, model).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn earlier_keys_survive_later_ones() {
        let cache = DetectionCache::new();
        let a = SourceImage::from_bytes("a.png", png_bytes(4, 4));
        let b = SourceImage::from_bytes("b.png", png_bytes(6, 6));
        let key_a = DetectKey::new(a.uri(), 0.3);
        let key_b = DetectKey::new(b.uri(), 0.3);

        cache.detect(&key_a, &a, Arc::new(NoFaces)).await.unwrap();
        cache.detect(&key_b, &b, Arc::new(NoFaces)).await.unwrap();
        assert_eq!(cache.len(), 2);

        // Still cached, so the failing model is never consulted.
        let calls = Arc::new(AtomicUsize::new(0));
        let failing = Arc::new(FailingModel {
            calls: Arc::clone(&calls),
        });
        assert!(cache.detect(&key_a, &a, failing).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn finished_keys_are_bounded() {
        let cache = DetectionCache::new();
        for i in 0..(RETAINED_DETECTIONS + 3) {
            let source = SourceImage::from_bytes(format!("{}.png", i), png_bytes(2, 2));
            let key = DetectKey::new(source.uri(), 0.3);
            cache.detect(&key, &source, Arc::new(NoFaces)).await.unwrap();
            assert!(cache.len() <= RETAINED_DETECTIONS);
        }
    }

    #[test]
    fn key_round_trips_threshold() {
        let key = DetectKey::new("a.png", 0.3);
        assert_eq!(key.min_confidence(), 0.3);
        assert_ne!(key, DetectKey::new("a.png", 0.31));
        assert_ne!(key, DetectKey::new("b.png", 0.3));
    }
}
