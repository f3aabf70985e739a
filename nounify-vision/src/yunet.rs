//! YuNet detector post-processing.
//!
//! YuNet is anchor-free. For each stride (8, 16, 32) it emits four tensors:
//! cls `[1, H*W, 1]`, obj `[1, H*W, 1]`, bbox `[1, H*W, 4]` and
//! kps `[1, H*W, 10]`, ordered cls_8, cls_16, cls_32, obj_8, ... kps_32.
//!
//! Per grid cell `(row, col)`:
//! ```text
//! score = sqrt(cls * obj)
//! cx = (col + dx) * stride        w = exp(dw) * stride
//! cy = (row + dy) * stride        h = exp(dh) * stride
//! ```

use anyhow::Result;
use ndarray::Array2;

pub const STRIDES: [usize; 3] = [8, 16, 32];

/// Detection in input-canvas pixels, before undoing the letterbox.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub bbox: [f32; 4], // x, y, w, h
    pub score: f32,
    pub landmarks: [f32; 10], // 5 points: x1,y1,...,x5,y5
}

/// Per-stride tensors, each `[H*W, channels]`.
#[derive(Debug, Clone)]
pub struct StrideOutputs {
    pub scores: Array2<f32>,
    pub bboxes: Array2<f32>,
    pub keypoints: Array2<f32>,
}

fn tensor(
    outputs: &[(&[i64], &[f32])],
    index: usize,
    rows: usize,
    cols: usize,
    what: &str,
) -> Result<Array2<f32>> {
    let Some((shape, data)) = outputs.get(index) else {
        anyhow::bail!("missing {} output at index {}", what, index);
    };
    if shape.len() != 3 || shape[0] != 1 || shape[1] as usize != rows || shape[2] as usize != cols
    {
        anyhow::bail!(
            "unexpected {} shape at index {}: {:?}, expected [1, {}, {}]",
            what,
            index,
            shape,
            rows,
            cols
        );
    }
    Ok(Array2::from_shape_vec((rows, cols), data.to_vec())?)
}

/// Split the 12 raw outputs into per-stride score/bbox/keypoint tensors.
pub fn parse_outputs(outputs: &[(&[i64], &[f32])], input_size: usize) -> Result<Vec<StrideOutputs>> {
    let n = STRIDES.len();
    STRIDES
        .iter()
        .enumerate()
        .map(|(i, &stride)| {
            let cells = (input_size / stride) * (input_size / stride);
            let cls = tensor(outputs, i, cells, 1, "cls")?;
            let obj = tensor(outputs, i + n, cells, 1, "obj")?;
            let mut scores = cls;
            scores.zip_mut_with(&obj, |c, o| {
                *c = ((*c).clamp(0.0, 1.0) * (*o).clamp(0.0, 1.0)).sqrt();
            });
            Ok(StrideOutputs {
                scores,
                bboxes: tensor(outputs, i + 2 * n, cells, 4, "bbox")?,
                keypoints: tensor(outputs, i + 3 * n, cells, 10, "kps")?,
            })
        })
        .collect()
}

/// Decode every grid cell scoring at least `score_threshold`.
pub fn decode_detections(
    strides: &[StrideOutputs],
    score_threshold: f32,
    input_size: usize,
) -> Result<Vec<RawDetection>> {
    if strides.len() != STRIDES.len() {
        anyhow::bail!("expected {} strides, got {}", STRIDES.len(), strides.len());
    }

    let mut detections = Vec::new();
    for (outputs, &stride) in strides.iter().zip(STRIDES.iter()) {
        let grid = input_size / stride;
        if outputs.scores.nrows() != grid * grid {
            anyhow::bail!(
                "expected {} cells for stride {}, got {}",
                grid * grid,
                stride,
                outputs.scores.nrows()
            );
        }
        let s = stride as f32;

        for row in 0..grid {
            for col in 0..grid {
                let idx = row * grid + col;
                let score = outputs.scores[[idx, 0]];
                if score < score_threshold {
                    continue;
                }

                let b = outputs.bboxes.row(idx);
                let cx = (col as f32 + b[0]) * s;
                let cy = (row as f32 + b[1]) * s;
                let w = b[2].exp() * s;
                let h = b[3].exp() * s;

                let k = outputs.keypoints.row(idx);
                let mut landmarks = [0.0f32; 10];
                for p in 0..5 {
                    landmarks[p * 2] = (col as f32 + k[p * 2]) * s;
                    landmarks[p * 2 + 1] = (row as f32 + k[p * 2 + 1]) * s;
                }

                detections.push(RawDetection {
                    bbox: [cx - w / 2.0, cy - h / 2.0, w, h],
                    score,
                    landmarks,
                });
            }
        }
    }

    Ok(detections)
}
