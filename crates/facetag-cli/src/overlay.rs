//! Annotation of frames: per-face boxes and captions plus the fixed guide.

use crate::config::{DisplayConfig, GuideRect};
use ab_glyph::{FontVec, PxScale};
use facetag_core::{FaceBox, FaceOutcome};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

pub const FACE_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
pub const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
pub const GUIDE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

/// Caption baseline sits this many pixels above the box.
const CAPTION_OFFSET: i32 = 10;

pub struct Overlay {
    font: Option<FontVec>,
    scale: PxScale,
    guide: Option<GuideRect>,
}

impl Overlay {
    /// Build from display settings. A missing or unreadable font is not
    /// fatal: boxes are still drawn and captions go to the log.
    pub fn from_config(display: &DisplayConfig) -> Self {
        let font = display.font.as_ref().and_then(|path| {
            let loaded = std::fs::read(path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| FontVec::try_from_vec(bytes).map_err(|e| e.to_string()));
            match loaded {
                Ok(font) => Some(font),
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "overlay font unavailable, captions will only be logged");
                    None
                }
            }
        });
        if display.font.is_none() {
            tracing::warn!("no overlay font configured, captions will only be logged");
        }

        Self {
            font,
            scale: PxScale::from(display.font_size),
            guide: display.guide,
        }
    }

    /// Draw every successful outcome, then the guide rectangle.
    pub fn draw(&self, image: &mut RgbImage, outcomes: &[FaceOutcome]) {
        for result in outcomes.iter().flatten() {
            draw_box(image, &result.face_box, FACE_COLOR);
            let caption = result.caption();
            match &self.font {
                Some(font) => {
                    let (_, text_h) = text_size(self.scale, font, &caption);
                    let y = result.face_box.y - CAPTION_OFFSET - text_h as i32;
                    draw_text_mut(image, TEXT_COLOR, result.face_box.x, y, self.scale, font, &caption);
                }
                None => tracing::info!(%caption, x = result.face_box.x, y = result.face_box.y, "face"),
            }
        }

        if let Some(guide) = self.guide {
            if guide.width > 0 && guide.height > 0 {
                let rect = Rect::at(guide.x, guide.y).of_size(guide.width, guide.height);
                draw_hollow_rect_mut(image, rect, GUIDE_COLOR);
            }
        }
    }
}

/// Outline a face box. Negative extents are drawn towards the origin;
/// degenerate boxes are skipped.
pub fn draw_box(image: &mut RgbImage, face: &FaceBox, color: Rgb<u8>) {
    let Some(rect) = normalized_rect(face) else {
        return;
    };
    draw_hollow_rect_mut(image, rect, color);
}

fn normalized_rect(face: &FaceBox) -> Option<Rect> {
    if face.width == 0 || face.height == 0 {
        return None;
    }
    let x = face.x.min(face.x + face.width);
    let y = face.y.min(face.y + face.height);
    Some(Rect::at(x, y).of_size(face.width.unsigned_abs(), face.height.unsigned_abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use facetag_core::pipeline::PipelineError;
    use facetag_core::IdentificationResult;

    fn no_font(guide: Option<GuideRect>) -> Overlay {
        Overlay {
            font: None,
            scale: PxScale::from(24.0),
            guide,
        }
    }

    fn result(face_box: FaceBox) -> FaceOutcome {
        Ok(IdentificationResult {
            face_box,
            label: "J".into(),
            confidence: 0.8,
            distance: 1.0,
        })
    }

    #[test]
    fn test_face_box_outline_is_blue() {
        let mut img = RgbImage::new(100, 100);
        no_font(None).draw(&mut img, &[result(FaceBox { x: 10, y: 20, width: 30, height: 40 })]);
        assert_eq!(*img.get_pixel(10, 20), FACE_COLOR);
        assert_eq!(*img.get_pixel(39, 59), FACE_COLOR);
        assert_eq!(*img.get_pixel(25, 40), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_guide_rectangle_drawn_without_faces() {
        let mut img = RgbImage::new(640, 480);
        let guide = GuideRect { x: 220, y: 170, width: 230, height: 230 };
        no_font(Some(guide)).draw(&mut img, &[]);
        assert_eq!(*img.get_pixel(220, 170), GUIDE_COLOR);
        assert_eq!(*img.get_pixel(449, 399), GUIDE_COLOR);
        assert_eq!(*img.get_pixel(300, 300), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_failed_faces_not_drawn() {
        let mut img = RgbImage::new(50, 50);
        let failed: FaceOutcome = Err(PipelineError::Acceptance(
            facetag_core::acceptance::AcceptanceError::NoAnchor,
        ));
        no_font(None).draw(&mut img, &[failed]);
        assert!(img.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }

    #[test]
    fn test_negative_extents_normalized() {
        let rect = normalized_rect(&FaceBox { x: 50, y: 50, width: -20, height: -10 }).unwrap();
        assert_eq!((rect.left(), rect.top(), rect.width(), rect.height()), (30, 40, 20, 10));
        assert!(normalized_rect(&FaceBox { x: 1, y: 1, width: 0, height: 5 }).is_none());
    }

    #[test]
    fn test_missing_font_is_not_fatal() {
        let display = DisplayConfig {
            font: Some("/nonexistent/font.ttf".into()),
            ..DisplayConfig::default()
        };
        let overlay = Overlay::from_config(&display);
        assert!(overlay.font.is_none());
        let mut img = RgbImage::new(100, 100);
        overlay.draw(&mut img, &[result(FaceBox { x: 5, y: 30, width: 20, height: 20 })]);
        assert_eq!(*img.get_pixel(5, 30), FACE_COLOR);
    }
}
