//! Grayscale frame type shared by capture, analysis and display.

use crate::types::{FaceRegion, PixelRect};
use std::time::Instant;

/// A captured grayscale camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    pub sequence: u32,
}

/// A rectangular grayscale patch cut out of a frame.
#[derive(Debug, Clone)]
pub struct Crop {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Self {
        Self {
            data,
            width,
            height,
            timestamp: Instant::now(),
            sequence,
        }
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    /// Copy the pixels of `region` (clipped to the frame) into a new buffer.
    pub fn crop(&self, region: &FaceRegion) -> Option<Crop> {
        let rect = region.clamped(self.width, self.height)?;
        self.crop_rect(rect)
    }

    pub fn crop_rect(&self, rect: PixelRect) -> Option<Crop> {
        let w = self.width as usize;
        if rect.x + rect.width > w
            || rect.y + rect.height > self.height as usize
            || self.data.len() < w * self.height as usize
        {
            return None;
        }
        let mut data = Vec::with_capacity(rect.width * rect.height);
        for y in rect.y..rect.y + rect.height {
            let row = y * w;
            data.extend_from_slice(&self.data[row + rect.x..row + rect.x + rect.width]);
        }
        Some(Crop {
            data,
            width: rect.width,
            height: rect.height,
        })
    }

    /// Draw a rectangle outline of the given intensity around `region`.
    pub fn draw_rect(&mut self, region: &FaceRegion, value: u8, thickness: usize) {
        let Some(rect) = region.clamped(self.width, self.height) else {
            return;
        };
        let w = self.width as usize;
        if self.data.len() < w * self.height as usize {
            return;
        }
        let t = thickness.max(1);
        let x_end = rect.x + rect.width;
        let y_end = rect.y + rect.height;

        for y in rect.y..y_end {
            let on_horizontal_edge = y < rect.y + t || y + t >= y_end;
            for x in rect.x..x_end {
                let on_vertical_edge = x < rect.x + t || x + t >= x_end;
                if on_horizontal_edge || on_vertical_edge {
                    self.data[y * w + x] = value;
                }
            }
        }
    }
}

impl Crop {
    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    pub fn pixel(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }
}
