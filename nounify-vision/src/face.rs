use std::sync::Mutex;

use anyhow::{Context, Result};
use image::{imageops::FilterType, DynamicImage, GenericImageView, RgbImage};
use ndarray::Array4;
use ort::{session::Session, value::Value};

use crate::geometry::{DetectionResult, LandmarkSet, Point};
use crate::model::{self, ModelPaths};
use crate::yunet;

/// YuNet expects a fixed `[1, 3, 640, 640]` BGR input.
pub const DETECTOR_INPUT: u32 = 640;
/// The landmark predictor expects a `[1, 3, 112, 112]` RGB input in `[0, 1]`.
pub const LANDMARK_INPUT: u32 = 112;
pub const LANDMARK_COUNT: usize = 68;

const NMS_IOU: f32 = 0.3;
/// Margin added around the detector box before landmark prediction.
const CROP_GROW: f32 = 0.1;

/// Coarse face box in source-image pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: [f32; 4], // x, y, w, h
    pub score: f32,
    pub landmarks: [f32; 10], // 5 points: x1,y1,...,x5,y5
}

/// Pack an RGB image into a planar NCHW tensor.
fn to_nchw(img: &RgbImage, bgr: bool, scale: f32) -> Result<Array4<f32>> {
    let (w, h) = img.dimensions();
    let plane = (w * h) as usize;
    let mut data = vec![0.0f32; 3 * plane];
    let order: [usize; 3] = if bgr { [2, 1, 0] } else { [0, 1, 2] };

    for (i, px) in img.pixels().enumerate() {
        for (c, &src) in order.iter().enumerate() {
            data[c * plane + i] = px[src] as f32 * scale;
        }
    }

    Ok(Array4::from_shape_vec((1, 3, h as usize, w as usize), data)?)
}

/// Detect face boxes with YuNet, most confident first.
pub fn detect_faces(
    session: &mut Session,
    img: &DynamicImage,
    score_threshold: f32,
    nms_threshold: f32,
) -> Result<Vec<Detection>> {
    // Letterbox into a square canvas to avoid distortion
    let target = DETECTOR_INPUT;
    let (orig_w, orig_h) = img.dimensions();
    if orig_w == 0 || orig_h == 0 {
        anyhow::bail!("image has zero size ({}x{})", orig_w, orig_h);
    }
    let scale = target as f32 / orig_w.max(orig_h) as f32;
    let new_w = ((orig_w as f32 * scale) as u32).clamp(1, target);
    let new_h = ((orig_h as f32 * scale) as u32).clamp(1, target);
    let resized = img.resize_exact(new_w, new_h, FilterType::Triangle);

    let mut canvas = DynamicImage::new_rgb8(target, target);
    let offset_x = (target - new_w) / 2;
    let offset_y = (target - new_h) / 2;
    image::imageops::overlay(&mut canvas, &resized, offset_x as i64, offset_y as i64);

    let input = Value::from_array(to_nchw(&canvas.to_rgb8(), true, 1.0)?)?;
    let outputs = session.run(ort::inputs![input])?;

    let mut owned: Vec<(Vec<i64>, Vec<f32>)> = Vec::new();
    for (_name, output) in outputs.iter() {
        let (shape, data) = output.try_extract_tensor::<f32>()?;
        owned.push((shape.iter().copied().collect(), data.to_vec()));
    }
    let refs: Vec<(&[i64], &[f32])> = owned
        .iter()
        .map(|(s, d)| (s.as_slice(), d.as_slice()))
        .collect();

    let strides = yunet::parse_outputs(&refs, target as usize)?;
    let raw = yunet::decode_detections(&strides, score_threshold, target as usize)?;

    // Undo the letterbox
    let (ox, oy) = (offset_x as f32, offset_y as f32);
    let detections: Vec<Detection> = raw
        .into_iter()
        .map(|d| {
            let mut landmarks = [0.0f32; 10];
            for i in 0..5 {
                landmarks[i * 2] = (d.landmarks[i * 2] - ox) / scale;
                landmarks[i * 2 + 1] = (d.landmarks[i * 2 + 1] - oy) / scale;
            }
            Detection {
                bbox: [
                    (d.bbox[0] - ox) / scale,
                    (d.bbox[1] - oy) / scale,
                    d.bbox[2] / scale,
                    d.bbox[3] / scale,
                ],
                score: d.score,
                landmarks,
            }
        })
        .collect();

    Ok(nms(&detections, nms_threshold))
}

/// Non-maximum suppression; output is sorted by descending score.
pub fn nms(detections: &[Detection], iou_threshold: f32) -> Vec<Detection> {
    let mut sorted = detections.to_vec();
    sorted.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<Detection> = Vec::new();
    for candidate in sorted {
        if keep
            .iter()
            .all(|kept| compute_iou(&kept.bbox, &candidate.bbox) <= iou_threshold)
        {
            keep.push(candidate);
        }
    }
    keep
}

fn compute_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = (a[0] + a[2]).min(b[0] + b[2]);
    let y2 = (a[1] + a[3]).min(b[1] + b[3]);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let inter = (x2 - x1) * (y2 - y1);
    inter / (a[2] * a[3] + b[2] * b[3] - inter)
}

/// Square crop around a detection, clamped to the image: `(x, y, w, h)`.
pub fn landmark_crop(dims: (u32, u32), bbox: &[f32; 4]) -> Option<(u32, u32, u32, u32)> {
    let (img_w, img_h) = dims;
    let side = bbox[2].max(bbox[3]) * (1.0 + CROP_GROW);
    let cx = bbox[0] + bbox[2] / 2.0;
    let cy = bbox[1] + bbox[3] / 2.0;

    let x0 = (cx - side / 2.0).floor().clamp(0.0, img_w as f32) as u32;
    let y0 = (cy - side / 2.0).floor().clamp(0.0, img_h as f32) as u32;
    let x1 = (cx + side / 2.0).ceil().clamp(0.0, img_w as f32) as u32;
    let y1 = (cy + side / 2.0).ceil().clamp(0.0, img_h as f32) as u32;

    (x1 > x0 && y1 > y0).then(|| (x0, y0, x1 - x0, y1 - y0))
}

/// Predict 68 landmarks for one face, in source-image pixels.
pub fn predict_landmarks(
    session: &mut Session,
    img: &DynamicImage,
    detection: &Detection,
) -> Result<Vec<Point>> {
    let (x, y, w, h) = landmark_crop(img.dimensions(), &detection.bbox)
        .context("face box lies outside the image")?;
    let crop = img
        .crop_imm(x, y, w, h)
        .resize_exact(LANDMARK_INPUT, LANDMARK_INPUT, FilterType::Triangle)
        .to_rgb8();

    let input = Value::from_array(to_nchw(&crop, false, 1.0 / 255.0)?)?;
    let outputs = session.run(ort::inputs![input])?;
    let (_shape, data) = outputs[0].try_extract_tensor::<f32>()?;

    if data.len() < LANDMARK_COUNT * 2 {
        anyhow::bail!(
            "landmark model produced {} values, expected {}",
            data.len(),
            LANDMARK_COUNT * 2
        );
    }

    Ok(data[..LANDMARK_COUNT * 2]
        .chunks_exact(2)
        .map(|p| Point::new(x as f32 + p[0] * w as f32, y as f32 + p[1] * h as f32))
        .collect())
}

/// Coarse detector plus landmark predictor, both ONNX sessions.
pub struct OnnxFaceModel {
    detector: Mutex<Session>,
    landmarker: Mutex<Session>,
}

impl OnnxFaceModel {
    pub fn load(paths: &ModelPaths) -> Result<Self> {
        Ok(Self {
            detector: Mutex::new(model::detector_session(paths)?),
            landmarker: Mutex::new(model::landmark_session(paths)?),
        })
    }

    /// Landmark sets for every face scoring at least `min_confidence`.
    pub fn detect(&self, img: &DynamicImage, min_confidence: f32) -> Result<DetectionResult> {
        let boxes = {
            let mut detector = self
                .detector
                .lock()
                .map_err(|_| anyhow::anyhow!("detector session poisoned"))?;
            detect_faces(&mut detector, img, min_confidence, NMS_IOU).context("detecting faces")?
        };
        log::debug!("detector found {} face(s)", boxes.len());

        let mut landmarker = self
            .landmarker
            .lock()
            .map_err(|_| anyhow::anyhow!("landmark session poisoned"))?;

        boxes
            .iter()
            .map(|det| -> Result<LandmarkSet> {
                let points = predict_landmarks(&mut landmarker, img, det)
                    .with_context(|| format!("predicting landmarks for face at {:?}", det.bbox))?;
                Ok(LandmarkSet::from_68(&points)?)
            })
            .collect()
    }
}
