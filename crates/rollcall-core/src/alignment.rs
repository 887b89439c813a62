//! Face alignment for the recognizer.
//!
//! Maps a detected face onto the canonical 112×112 ArcFace layout with a
//! least-squares similarity transform (scale, rotation, translation) fitted
//! to the five detected landmarks.

use crate::types::BoundingBox;
use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Similarity transform `dst = [a -b; b a] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Closed-form least-squares fit from `src` points to `dst` points.
    ///
    /// Returns `None` when the source points are degenerate (all equal).
    fn fit(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts
                .iter()
                .fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (smx, smy) = mean(src);
        let (dmx, dmy) = mean(dst);

        let mut var = 0.0f32;
        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        for ((sx, sy), (dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (sx - smx, sy - smy);
            let (dx, dy) = (dx - dmx, dy - dmy);
            var += sx * sx + sy * sy;
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
        }
        if var < 1e-6 {
            return None;
        }

        let a = dot / var;
        let b = cross / var;
        Some(Self {
            a,
            b,
            tx: dmx - (a * smx - b * smy),
            ty: dmy - (b * smx + a * smy),
        })
    }

    #[cfg(test)]
    fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// Map a destination point back into source coordinates.
    fn invert(&self, (x, y): (f32, f32)) -> (f32, f32) {
        let det = self.a * self.a + self.b * self.b;
        let (dx, dy) = (x - self.tx, y - self.ty);
        (
            (self.a * dx + self.b * dy) / det,
            (-self.b * dx + self.a * dy) / det,
        )
    }
}

/// Bilinear sample with black outside the image.
fn sample(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (w, h) = (image.width() as i64, image.height() as i64);

    let px = |xi: i64, yi: i64| -> [f32; 3] {
        if xi >= 0 && yi >= 0 && xi < w && yi < h {
            image.get_pixel(xi as u32, yi as u32).0.map(f32::from)
        } else {
            [0.0; 3]
        }
    };

    let (x0, y0) = (x0 as i64, y0 as i64);
    let tl = px(x0, y0);
    let tr = px(x0 + 1, y0);
    let bl = px(x0, y0 + 1);
    let br = px(x0 + 1, y0 + 1);

    Rgb(std::array::from_fn(|c| {
        let top = tl[c] * (1.0 - fx) + tr[c] * fx;
        let bottom = bl[c] * (1.0 - fx) + br[c] * fx;
        (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
    }))
}

/// Align a face to the canonical 112×112 crop using its landmarks.
///
/// Falls back to [`crop_face`] if the landmarks are degenerate.
pub fn align_face(image: &RgbImage, face: &BoundingBox, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let Some(transform) = Similarity::fit(landmarks, &REFERENCE_LANDMARKS) else {
        tracing::debug!("degenerate landmarks; using box crop");
        return crop_face(image, face);
    };

    RgbImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |ox, oy| {
        let (sx, sy) = transform.invert((ox as f32, oy as f32));
        sample(image, sx, sy)
    })
}

/// Crop a square around the bounding box and resize it to 112×112.
pub fn crop_face(image: &RgbImage, face: &BoundingBox) -> RgbImage {
    let side = face.width.max(face.height).max(1.0);
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;
    let x0 = cx - side / 2.0;
    let y0 = cy - side / 2.0;
    let step = side / ALIGNED_SIZE as f32;

    RgbImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |ox, oy| {
        sample(image, x0 + ox as f32 * step, y0 + oy as f32 * step)
    })
}
