use std::fmt;

/// Which eye a landmark problem was found on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eye {
    Left,
    Right,
}

impl fmt::Display for Eye {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eye::Left => f.write_str("left"),
            Eye::Right => f.write_str("right"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("invalid landmarks for {eye} eye: {reason}")]
    InvalidLandmarks { eye: Eye, reason: &'static str },

    #[error("invalid overlay asset: {reason}")]
    InvalidAsset { reason: String },

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl VisionError {
    pub fn invalid_landmarks(eye: Eye, reason: &'static str) -> Self {
        Self::InvalidLandmarks { eye, reason }
    }
}
