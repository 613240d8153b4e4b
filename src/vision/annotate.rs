use crate::vision::classes::DetectionClass;
use crate::vision::detector::Detection;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageResult, Rgb, RgbImage};
use serde::{Deserialize, Serialize};

const BOX_THICKNESS: u32 = 3;
const LABEL_HEIGHT: u32 = 14;
const LABEL_MIN_WIDTH: u32 = 12;

/// Fire and smoke counts for one frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionCounts {
    pub fire: u32,
    pub smoke: u32,
}

impl DetectionCounts {
    pub fn is_clear(&self) -> bool {
        self.fire == 0 && self.smoke == 0
    }
}

pub fn count(detections: &[Detection]) -> DetectionCounts {
    detections
        .iter()
        .fold(DetectionCounts::default(), |mut counts, d| {
            match d.class {
                DetectionClass::Fire => counts.fire += 1,
                DetectionClass::Smoke => counts.smoke += 1,
                DetectionClass::Light | DetectionClass::NoFire => {}
            }
            counts
        })
}

/// Highest confidence among detections of `class`
pub fn max_confidence(detections: &[Detection], class: DetectionClass) -> Option<f64> {
    detections
        .iter()
        .filter(|d| d.class == class)
        .map(|d| d.confidence)
        .fold(None, |best, c| Some(best.map_or(c, |b: f64| b.max(c))))
}

/// Draws boxes and confidence tabs for fire and smoke detections.
pub fn annotate(image: &mut RgbImage, detections: &[Detection]) {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return;
    }

    for detection in detections.iter().filter(|d| d.class.is_counted()) {
        let color = detection.class.color();
        let x1 = clamp(detection.bbox.x1.min(detection.bbox.x2), width);
        let x2 = clamp(detection.bbox.x1.max(detection.bbox.x2), width);
        let y1 = clamp(detection.bbox.y1.min(detection.bbox.y2), height);
        let y2 = clamp(detection.bbox.y1.max(detection.bbox.y2), height);

        draw_box(image, x1, y1, x2, y2, color);

        let box_width = x2 - x1 + 1;
        let tab_width = ((box_width as f64) * detection.confidence.clamp(0.0, 1.0)) as u32;
        let tab_width = tab_width.max(LABEL_MIN_WIDTH).min(width - x1);
        // Sits above the box, or just inside it at the top edge
        let (tab_top, tab_bottom) = if y1 >= LABEL_HEIGHT {
            (y1 - LABEL_HEIGHT, y1.saturating_sub(1))
        } else {
            (y1, (y1 + LABEL_HEIGHT - 1).min(height - 1))
        };
        fill_rect(image, x1, tab_top, x1 + tab_width - 1, tab_bottom, color);
    }
}

/// Encodes an RGB image as baseline JPEG
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> ImageResult<Bytes> {
    let mut buf = Vec::with_capacity((image.width() * image.height() / 4) as usize);
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100)).encode_image(image)?;
    Ok(Bytes::from(buf))
}

fn clamp(value: f64, limit: u32) -> u32 {
    if value.is_nan() || value <= 0.0 {
        0
    } else {
        (value as u32).min(limit - 1)
    }
}

fn draw_box(image: &mut RgbImage, x1: u32, y1: u32, x2: u32, y2: u32, color: Rgb<u8>) {
    for t in 0..BOX_THICKNESS {
        let (left, right) = (x1.saturating_add(t).min(x2), x2.saturating_sub(t).max(x1));
        let (top, bottom) = (y1.saturating_add(t).min(y2), y2.saturating_sub(t).max(y1));
        for x in left..=right {
            image.put_pixel(x, top, color);
            image.put_pixel(x, bottom, color);
        }
        for y in top..=bottom {
            image.put_pixel(left, y, color);
            image.put_pixel(right, y, color);
        }
    }
}

fn fill_rect(image: &mut RgbImage, x1: u32, y1: u32, x2: u32, y2: u32, color: Rgb<u8>) {
    for y in y1..=y2 {
        for x in x1..=x2 {
            image.put_pixel(x, y, color);
        }
    }
}
