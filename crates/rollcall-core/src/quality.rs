//! Face image quality gate applied before registration.

use crate::frame::{Crop, Frame};
use crate::types::FaceRegion;
use serde::Serialize;

/// Overall score at or above which a face may be enrolled.
pub const MIN_ACCEPTABLE_QUALITY: f32 = 0.5;

const SHARP_VARIANCE: f32 = 100.0;
const ACCEPTABLE_VARIANCE: f32 = 50.0;
const GOOD_FACE_AREA: f32 = 10_000.0;
const ACCEPTABLE_FACE_AREA: f32 = 6_400.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FaceQuality {
    pub brightness: f32,
    pub sharpness: f32,
    pub size: f32,
    /// Mean of the three component scores.
    pub overall: f32,
    /// Raw measurements behind the scores, for logging.
    pub mean_brightness: f32,
    pub laplacian_variance: f32,
}

impl FaceQuality {
    /// Score the face `region` of `frame`. A region outside the frame scores zero.
    pub fn assess(frame: &Frame, region: &FaceRegion) -> Self {
        let area = region.area();
        let Some(crop) = frame.crop(region) else {
            return Self {
                brightness: 0.0,
                sharpness: 0.0,
                size: 0.0,
                overall: 0.0,
                mean_brightness: 0.0,
                laplacian_variance: 0.0,
            };
        };

        let mean_brightness = crop.mean();
        let laplacian_variance = laplacian_variance(&crop);

        let brightness = brightness_score(mean_brightness);
        let sharpness = sharpness_score(laplacian_variance);
        let size = size_score(area);
        Self {
            brightness,
            sharpness,
            size,
            overall: (brightness + sharpness + size) / 3.0,
            mean_brightness,
            laplacian_variance,
        }
    }

    pub fn is_acceptable(&self) -> bool {
        self.overall >= MIN_ACCEPTABLE_QUALITY
    }
}

fn brightness_score(mean: f32) -> f32 {
    if (80.0..=180.0).contains(&mean) {
        1.0
    } else if (50.0..80.0).contains(&mean) || (180.0..=200.0).contains(&mean) {
        0.6
    } else {
        0.3
    }
}

fn sharpness_score(variance: f32) -> f32 {
    if variance > SHARP_VARIANCE {
        1.0
    } else if variance > ACCEPTABLE_VARIANCE {
        0.7
    } else {
        0.3
    }
}

fn size_score(area: f32) -> f32 {
    if area >= GOOD_FACE_AREA {
        1.0
    } else if area >= ACCEPTABLE_FACE_AREA {
        0.8
    } else {
        0.4
    }
}

/// Variance of the 4-neighbour Laplacian over the interior pixels.
fn laplacian_variance(crop: &Crop) -> f32 {
    if crop.width < 3 || crop.height < 3 {
        return 0.0;
    }
    let mut responses = Vec::with_capacity((crop.width - 2) * (crop.height - 2));
    for y in 1..crop.height - 1 {
        for x in 1..crop.width - 1 {
            let center = crop.pixel(x, y) as f32;
            let lap = crop.pixel(x - 1, y) as f32
                + crop.pixel(x + 1, y) as f32
                + crop.pixel(x, y - 1) as f32
                + crop.pixel(x, y + 1) as f32
                - 4.0 * center;
            responses.push(lap);
        }
    }
    let n = responses.len() as f32;
    let mean = responses.iter().sum::<f32>() / n;
    responses.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n
}
