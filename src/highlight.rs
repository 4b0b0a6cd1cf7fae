//! Highlight-overlay rendering and screenshot scaling.
//!
//! Draws numbered bounding boxes onto a copy of the raw screenshot so the
//! model can map element indices to on-screen locations. Label text requires
//! a font; when no system font can be loaded the overlay degrades to
//! boxes-only rather than failing the capture.

use std::io::Cursor;
use std::sync::OnceLock;

use ab_glyph::{FontVec, PxScale};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::{DynamicImage, Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect as ImageRect;
use thiserror::Error;

use crate::types::InteractiveElement;

/// Rotating palette for bounding boxes; adjacent indices get distinct colors.
const PALETTE: [Rgba<u8>; 8] = [
    Rgba([229, 57, 53, 255]),
    Rgba([30, 136, 229, 255]),
    Rgba([67, 160, 71, 255]),
    Rgba([251, 140, 0, 255]),
    Rgba([142, 36, 170, 255]),
    Rgba([0, 172, 193, 255]),
    Rgba([216, 27, 96, 255]),
    Rgba([121, 85, 72, 255]),
];

const LABEL_SCALE: f32 = 16.0;
const LABEL_HEIGHT: u32 = 18;
/// Downward shift applied when a label's box collides with an existing one.
const LABEL_SHIFT: i32 = 6;

/// Longest edge of the scaled-down screenshot used in compacted messages.
const SCALED_MAX_EDGE: u32 = 800;

#[derive(Debug, Error)]
pub enum HighlightError {
    #[error("screenshot is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("screenshot could not be decoded: {0}")]
    Decode(#[from] image::ImageError),
}

static LABEL_FONT: OnceLock<Option<FontVec>> = OnceLock::new();

/// Best-effort font lookup from well-known system locations. Missing fonts
/// degrade the overlay to boxes-only.
fn label_font() -> Option<&'static FontVec> {
    LABEL_FONT
        .get_or_init(|| {
            const CANDIDATES: [&str; 4] = [
                "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
                "/usr/share/fonts/TTF/DejaVuSans.ttf",
                "/usr/share/fonts/dejavu/DejaVuSans.ttf",
                "/System/Library/Fonts/Helvetica.ttc",
            ];
            CANDIDATES.iter().find_map(|path| {
                std::fs::read(path)
                    .ok()
                    .and_then(|bytes| FontVec::try_from_vec(bytes).ok())
            })
        })
        .as_ref()
}

/// Render numbered highlight boxes for every element onto a copy of the raw
/// screenshot. Input and output are base64-encoded PNGs.
pub fn draw_highlights(
    screenshot_b64: &str,
    elements: &[InteractiveElement],
) -> Result<String, HighlightError> {
    let bytes = BASE64.decode(screenshot_b64)?;
    let mut image = image::load_from_memory(&bytes)?.to_rgba8();

    let font = label_font();
    let scale = PxScale {
        x: LABEL_SCALE,
        y: LABEL_SCALE,
    };
    let mut placed_labels: Vec<ImageRect> = Vec::new();

    for element in elements {
        let color = PALETTE[element.index % PALETTE.len()];
        let rect = &element.viewport_rect;

        let x = rect.left.round() as i32;
        let y = rect.top.round() as i32;
        let width = rect.width.round().max(1.0) as u32;
        let height = rect.height.round().max(1.0) as u32;

        if x >= image.width() as i32 || y >= image.height() as i32 {
            continue;
        }

        draw_box(&mut image, x, y, width, height, color);

        let label = element.index.to_string();
        let label_width = (label.len() as u32) * 10 + 6;
        let label_rect = place_label(
            &placed_labels,
            x,
            y,
            width,
            label_width,
            image.width(),
            image.height(),
        );
        placed_labels.push(label_rect);

        draw_filled_rect_mut(&mut image, label_rect, color);
        if let Some(font) = font {
            draw_text_mut(
                &mut image,
                Rgba([255, 255, 255, 255]),
                label_rect.left() + 3,
                label_rect.top() + 1,
                scale,
                font,
                &label,
            );
        }
    }

    encode_png(image)
}

fn draw_box(image: &mut RgbaImage, x: i32, y: i32, width: u32, height: u32, color: Rgba<u8>) {
    let rect = ImageRect::at(x, y).of_size(width, height);
    draw_hollow_rect_mut(image, rect, color);
    if width > 2 && height > 2 {
        let inner = ImageRect::at(x + 1, y + 1).of_size(width - 2, height - 2);
        draw_hollow_rect_mut(image, inner, color);
    }
}

/// Pick a label position at the element's inner top-right corner, shifting
/// downward in small steps while the label's box would overlap one already
/// placed.
fn place_label(
    placed: &[ImageRect],
    box_x: i32,
    box_y: i32,
    box_width: u32,
    label_width: u32,
    image_width: u32,
    image_height: u32,
) -> ImageRect {
    let mut x = box_x + box_width as i32 - label_width as i32;
    if x < 0 {
        x = box_x.max(0);
    }
    if x + label_width as i32 > image_width as i32 {
        x = (image_width as i32 - label_width as i32).max(0);
    }

    let mut y = box_y.max(0);
    let max_y = (image_height as i32 - LABEL_HEIGHT as i32).max(0);

    loop {
        let candidate = ImageRect::at(x, y.min(max_y)).of_size(label_width, LABEL_HEIGHT);
        let collides = placed.iter().any(|existing| rects_overlap(existing, &candidate));
        if !collides || y >= max_y {
            return candidate;
        }
        y += LABEL_SHIFT;
    }
}

fn rects_overlap(a: &ImageRect, b: &ImageRect) -> bool {
    a.left() < b.left() + b.width() as i32
        && b.left() < a.left() + a.width() as i32
        && a.top() < b.top() + b.height() as i32
        && b.top() < a.top() + a.height() as i32
}

/// Downscale a screenshot so its longest edge is at most 800px, for the
/// compacted state messages. Already-small images pass through re-encoded.
pub fn scale_screenshot(screenshot_b64: &str) -> Result<String, HighlightError> {
    let bytes = BASE64.decode(screenshot_b64)?;
    let image = image::load_from_memory(&bytes)?;

    if image.width() <= SCALED_MAX_EDGE && image.height() <= SCALED_MAX_EDGE {
        return encode_png(image.to_rgba8());
    }

    let scaled = image.thumbnail(SCALED_MAX_EDGE, SCALED_MAX_EDGE);
    encode_png(scaled.to_rgba8())
}

fn encode_png(image: RgbaImage) -> Result<String, HighlightError> {
    let mut buffer = Vec::new();
    DynamicImage::ImageRgba8(image).write_to(&mut Cursor::new(&mut buffer), image::ImageFormat::Png)?;
    Ok(BASE64.encode(buffer))
}
