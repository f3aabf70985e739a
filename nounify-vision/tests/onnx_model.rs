//! Needs the detector and landmark models on disk:
//!
//! ```text
//! NOUNIFY_MODEL_DIR=models NOUNIFY_TEST_IMAGE=faces/group.jpg \
//!     cargo test -p nounify-vision --test onnx_model -- --ignored
//! ```
use anyhow::{Context, Result};
use nounify_vision::{ModelPaths, OnnxFaceModel, OverlayTransform};

fn model_dir() -> String {
    std::env::var("NOUNIFY_MODEL_DIR").unwrap_or_else(|_| "models".to_string())
}

#[test]
#[ignore = "requires ONNX model files"]
fn test_models_load() -> Result<()> {
    let _model = OnnxFaceModel::load(&ModelPaths::in_dir(model_dir()))?;
    println!("✓ Models loaded");
    Ok(())
}

#[test]
#[ignore = "requires ONNX model files"]
fn test_blank_image_has_no_faces() -> Result<()> {
    let model = OnnxFaceModel::load(&ModelPaths::in_dir(model_dir()))?;
    let blank = image::DynamicImage::new_rgb8(320, 240);
    let faces = model.detect(&blank, 0.3)?;
    assert!(faces.is_empty(), "found {} face(s) in a blank image", faces.len());
    Ok(())
}

#[test]
#[ignore = "requires ONNX model files and NOUNIFY_TEST_IMAGE"]
fn test_detects_eyes_in_photo() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = std::env::var("NOUNIFY_TEST_IMAGE").context("NOUNIFY_TEST_IMAGE not set")?;
    let img = image::open(&path).with_context(|| format!("opening {}", path))?;
    let model = OnnxFaceModel::load(&ModelPaths::in_dir(model_dir()))?;

    let faces = model.detect(&img, 0.3)?;
    println!("Found {} face(s) in {}", faces.len(), path);
    assert!(!faces.is_empty());

    for (i, face) in faces.iter().enumerate() {
        assert_eq!(face.left_eye().len(), 6);
        assert_eq!(face.right_eye().len(), 6);
        let t = OverlayTransform::from_landmarks(face)?;
        println!(
            "Face {}: anchor ({:.1}, {:.1}) width {:.1} angle {:.3}",
            i, t.anchor.x, t.anchor.y, t.width, t.angle_radians
        );
        assert!(t.anchor.x >= 0.0 && t.anchor.x <= img.width() as f32);
        assert!(t.anchor.y >= 0.0 && t.anchor.y <= img.height() as f32);
    }

    // Raising the threshold never finds more faces.
    let strict = model.detect(&img, 0.9)?;
    assert!(strict.len() <= faces.len());
    Ok(())
}
