//! Per-frame feedback: detection overlays written as a preview image.

use image::{Rgb, RgbImage};
use rollcall_core::{BoundingBox, Identity};
use std::path::PathBuf;

const KNOWN_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([220, 0, 0]);
const BORDER: u32 = 2;
const MARKER_BAND: u32 = 14;

/// One matched face, in full-frame coordinates.
#[derive(Debug, Clone)]
pub struct Annotation {
    pub bbox: BoundingBox,
    pub identity: Identity,
    pub distance: f32,
}

/// Renders the outcome of one processed frame.
pub trait Feedback {
    fn render(&mut self, frame: &RgbImage, annotations: &[Annotation])
        -> Result<(), image::ImageError>;
}

/// Draws boxes onto a copy of the frame and saves it to `path`.
///
/// Known identities are outlined green, unknown faces red, each with a filled
/// band of the same colour along the bottom edge of the box as a marker. Names
/// go to the debug event, not the image. With no path configured only the
/// debug event is emitted.
pub struct PreviewWriter {
    path: Option<PathBuf>,
}

impl PreviewWriter {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

impl Feedback for PreviewWriter {
    fn render(
        &mut self,
        frame: &RgbImage,
        annotations: &[Annotation],
    ) -> Result<(), image::ImageError> {
        if !annotations.is_empty() {
            let labels: Vec<String> = annotations.iter().map(|a| a.identity.to_string()).collect();
            tracing::debug!(faces = annotations.len(), labels = ?labels, "frame rendered");
        }

        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut canvas = frame.clone();
        for annotation in annotations {
            draw_annotation(&mut canvas, annotation);
        }
        canvas.save(path)
    }
}

fn color_for(identity: &Identity) -> Rgb<u8> {
    if identity.is_known() {
        KNOWN_COLOR
    } else {
        UNKNOWN_COLOR
    }
}

/// Outline the box and fill an identity-coloured marker band inside its bottom edge.
pub fn draw_annotation(canvas: &mut RgbImage, annotation: &Annotation) {
    let (w, h) = canvas.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let color = color_for(&annotation.identity);
    let b = &annotation.bbox;

    let left = (b.x.max(0.0) as u32).min(w - 1);
    let top = (b.y.max(0.0) as u32).min(h - 1);
    let right = ((b.x + b.width).max(0.0) as u32).min(w - 1);
    let bottom = ((b.y + b.height).max(0.0) as u32).min(h - 1);
    if right <= left || bottom <= top {
        return;
    }

    let mut fill = |x0: u32, y0: u32, x1: u32, y1: u32| {
        for y in y0..=y1.min(h - 1) {
            for x in x0..=x1.min(w - 1) {
                canvas.put_pixel(x, y, color);
            }
        }
    };

    fill(left, top, right, (top + BORDER - 1).min(bottom));
    fill(left, bottom.saturating_sub(BORDER - 1), right, bottom);
    fill(left, top, (left + BORDER - 1).min(right), bottom);
    fill(right.saturating_sub(BORDER - 1), top, right, bottom);

    let band_top = bottom.saturating_sub(MARKER_BAND).max(top);
    fill(left, band_top, right, bottom);
}
