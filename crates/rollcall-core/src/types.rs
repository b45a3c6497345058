use serde::{Deserialize, Serialize};

/// Label returned for faces that match no enrolled identity.
///
/// Reserved: it can never be registered as a real label.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Face embedding vector produced by an external model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        euclidean_distance(&self.values, &other.values)
    }
}

/// Euclidean distance over the common prefix of two vectors.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// A detected face, expressed as (top, right, bottom, left) pixel edges.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub left: f32,
    pub confidence: f32,
}

/// Integer pixel window inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl FaceRegion {
    pub fn new(top: f32, right: f32, bottom: f32, left: f32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
            confidence: 1.0,
        }
    }

    /// Build a region from an (x, y, width, height) box.
    pub fn from_xywh(x: f32, y: f32, width: f32, height: f32, confidence: f32) -> Self {
        Self {
            top: y,
            right: x + width,
            bottom: y + height,
            left: x,
            confidence,
        }
    }

    pub fn width(&self) -> f32 {
        (self.right - self.left).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.bottom - self.top).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.left + self.right) / 2.0,
            (self.top + self.bottom) / 2.0,
        )
    }

    /// Intersection-over-Union between two regions.
    pub fn iou(&self, other: &FaceRegion) -> f32 {
        let x1 = self.left.max(other.left);
        let y1 = self.top.max(other.top);
        let x2 = self.right.min(other.right);
        let y2 = self.bottom.min(other.bottom);

        let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union_area = self.area() + other.area() - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }

    /// Clip the region to a `width` x `height` frame.
    ///
    /// Returns `None` when nothing of the region lies inside the frame.
    pub fn clamped(&self, width: u32, height: u32) -> Option<PixelRect> {
        let x0 = self.left.max(0.0).floor() as usize;
        let y0 = self.top.max(0.0).floor() as usize;
        let x1 = (self.right.max(0.0).ceil() as usize).min(width as usize);
        let y1 = (self.bottom.max(0.0).ceil() as usize).min(height as usize);

        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(PixelRect {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
        })
    }
}
