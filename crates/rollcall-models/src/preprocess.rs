//! Shared tensor preparation for the ONNX models.

use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use rollcall_core::{FaceRegion, Frame};

/// Wrap a frame's grayscale buffer as an image.
pub fn frame_image(frame: &Frame) -> Option<GrayImage> {
    GrayImage::from_raw(frame.width, frame.height, frame.data.clone())
}

/// Resize the whole frame to `width` x `height`.
pub fn resize_frame(frame: &Frame, width: u32, height: u32) -> Option<GrayImage> {
    let img = frame_image(frame)?;
    Some(imageops::resize(&img, width, height, FilterType::Triangle))
}

/// Cut `region` (clipped to the frame) and resize it to `size` x `size`.
pub fn face_patch(frame: &Frame, region: &FaceRegion, size: u32) -> Option<GrayImage> {
    let crop = frame.crop(region)?;
    let img = GrayImage::from_raw(crop.width as u32, crop.height as u32, crop.data)?;
    Some(imageops::resize(&img, size, size, FilterType::Triangle))
}

/// NCHW tensor of `(pixel - mean) / std`, the gray channel repeated `channels` times.
pub fn to_nchw(img: &GrayImage, mean: f32, std: f32, channels: usize) -> Array4<f32> {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, channels, h, w));
    for (x, y, pixel) in img.enumerate_pixels() {
        let value = (pixel.0[0] as f32 - mean) / std;
        for c in 0..channels {
            tensor[[0, c, y as usize, x as usize]] = value;
        }
    }
    tensor
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum > 0.0 {
        exps.iter().map(|v| v / sum).collect()
    } else {
        exps
    }
}

pub fn l2_normalize(values: Vec<f32>) -> Vec<f32> {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.into_iter().map(|v| v / norm).collect()
    } else {
        values
    }
}
