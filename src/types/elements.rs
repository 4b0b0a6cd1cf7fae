use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in a single coordinate space (viewport or page
/// pixels). Invariant: `right >= left`, `bottom >= top`, and the width/height
/// fields mirror the corner deltas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ElementRect {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub width: f64,
    pub height: f64,
}

impl ElementRect {
    /// Build a rect from two corners, deriving the width/height fields.
    pub fn from_corners(left: f64, top: f64, right: f64, bottom: f64) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
            width: right - left,
            height: bottom - top,
        }
    }

    pub fn area(&self) -> f64 {
        self.width * self.height
    }
}

/// Click target point, defaulting to the rect center.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// One actionable element discovered on the page.
///
/// `index` is the only identifier the model ever sees; it is reassigned on
/// every snapshot and is not stable across steps. `source_id` is the stable
/// `data-agent-id` attribute injected into the live DOM (or a synthetic
/// `cv-<n>` / `cell-<r>-<c>` / `row_<n>` / `column_<label>` id for vision
/// detections) and is used internally to re-locate the element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractiveElement {
    pub index: usize,
    pub source_id: String,
    pub tag_name: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,
    pub viewport_rect: ElementRect,
    pub page_rect: ElementRect,
    pub center: Point,
    /// Static priority used as the filter tie-break; constant for now and
    /// reserved as a confidence-scoring hook.
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub z_index: i64,
}

fn default_weight() -> f64 {
    1.0
}

impl InteractiveElement {
    /// Whether this element is a grid row/column helper produced by the
    /// spreadsheet detection mode. Helpers are excluded from the textual
    /// element listing shown to the model.
    pub fn is_grid_helper(&self) -> bool {
        self.source_id.starts_with("row_") || self.source_id.starts_with("column_")
    }
}

/// Current viewport geometry plus the off-screen content extents used to tell
/// the model whether more content exists above or below the fold. The two
/// scroll-distance fields are always >= 0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub scroll_x: f64,
    #[serde(default)]
    pub scroll_y: f64,
    #[serde(default = "default_dpr")]
    pub device_pixel_ratio: f64,
    #[serde(default)]
    pub scroll_distance_above_viewport: f64,
    #[serde(default)]
    pub scroll_distance_below_viewport: f64,
}

fn default_dpr() -> f64 {
    1.0
}

/// One open browser tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: usize,
    pub url: String,
    pub title: String,
}

/// Immutable snapshot of the browser at one point in the step loop.
///
/// Exactly one snapshot is "current" at a time; a fresh capture fully
/// replaces it. Elements are keyed by their freshly assigned index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BrowserState {
    pub url: String,
    pub tabs: Vec<TabInfo>,
    pub viewport: Viewport,
    /// Raw screenshot, base64-encoded PNG.
    pub screenshot: String,
    /// Screenshot with numbered highlight overlays, base64-encoded PNG.
    pub screenshot_with_highlights: String,
    pub interactive_elements: HashMap<usize, InteractiveElement>,
}
