//! Vision-model element detection.
//!
//! Wraps an optional remote detection endpoint behind a trait so perception
//! works identically with or without computer vision. Remote failures are
//! retried with exponential backoff and then degrade to an empty detection
//! set; CV is an enhancement, never a dependency.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::time::sleep;

use crate::types::{ElementRect, InteractiveElement, Point};

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 500;

/// Errors surfaced by detector implementations. Callers of
/// [`detect_with_retry`] never see these; they are logged and swallowed.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("detection request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected detection response: {0}")]
    Response(String),
}

/// Boundary trait for vision-based element detection.
///
/// `detect_grid` selects the dense spreadsheet mode that yields uniform cell
/// elements plus row/column header helpers instead of discrete UI controls.
#[async_trait]
pub trait ElementDetector: Send + Sync {
    async fn detect(
        &self,
        image_b64: &str,
        detect_grid: bool,
    ) -> Result<Vec<InteractiveElement>, DetectorError>;
}

/// Run detection with bounded exponential backoff, degrading to an empty
/// list once retries are exhausted.
pub async fn detect_with_retry(
    detector: &dyn ElementDetector,
    image_b64: &str,
    detect_grid: bool,
    logger: &crate::logging::AgentLogger,
) -> Vec<InteractiveElement> {
    let mut delay = Duration::from_millis(BASE_BACKOFF_MS);

    for attempt in 1..=MAX_ATTEMPTS {
        match detector.detect(image_b64, detect_grid).await {
            Ok(elements) => {
                logger.debug(
                    format!("vision detector returned {} elements", elements.len()),
                    Some("detector"),
                    None,
                );
                return elements;
            }
            Err(err) if attempt < MAX_ATTEMPTS => {
                logger.debug(
                    format!("detection attempt {attempt} failed: {err}; retrying"),
                    Some("detector"),
                    None,
                );
                sleep(delay).await;
                delay *= 2;
            }
            Err(err) => {
                logger.error(
                    format!("detection failed after {MAX_ATTEMPTS} attempts: {err}"),
                    Some("detector"),
                    None,
                );
            }
        }
    }

    Vec::new()
}

/// Raw box returned by the remote endpoint: `[x1, y1, x2, y2]` plus a class
/// label and confidence.
#[derive(Debug, Deserialize)]
struct RawDetection {
    #[serde(rename = "box")]
    bbox: [f64; 4],
    #[serde(default)]
    class_name: String,
    #[serde(default)]
    confidence: f64,
}

#[derive(Debug, Deserialize)]
struct DetectionResponse {
    #[serde(default)]
    detections: Vec<RawDetection>,
}

/// HTTP adapter for a remote vision-detection service.
pub struct RemoteDetector {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteDetector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ElementDetector for RemoteDetector {
    async fn detect(
        &self,
        image_b64: &str,
        detect_grid: bool,
    ) -> Result<Vec<InteractiveElement>, DetectorError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({
                "image": image_b64,
                "mode": if detect_grid { "grid" } else { "elements" },
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DetectorError::Response(format!(
                "endpoint returned {}",
                response.status()
            )));
        }

        let parsed: DetectionResponse = response.json().await?;
        let elements = if detect_grid {
            grid_elements_from_detections(&parsed.detections)
        } else {
            cv_elements_from_detections(&parsed.detections)
        };
        Ok(elements)
    }
}

/// Shape generic detections into interactive elements with synthetic `cv-<n>`
/// ids so downstream logic can distinguish them from DOM-sourced elements.
fn cv_elements_from_detections(detections: &[RawDetection]) -> Vec<InteractiveElement> {
    detections
        .iter()
        .enumerate()
        .map(|(i, det)| {
            detection_element(
                format!("cv-{i}"),
                "element",
                det.bbox,
                det.confidence,
                &det.class_name,
            )
        })
        .collect()
}

/// Shape grid detections. Cells become `cell-<row>-<col>`; the service also
/// reports `row`/`column` header boxes, which become `row_<label>` and
/// `column_<label>` helper elements consumed by the spreadsheet click action.
fn grid_elements_from_detections(detections: &[RawDetection]) -> Vec<InteractiveElement> {
    let mut elements = Vec::with_capacity(detections.len());
    let mut cell_counter = 0usize;

    for det in detections {
        let (source_id, tag_name) = match det.class_name.split_once(':') {
            Some(("row", label)) => (format!("row_{label}"), "row"),
            Some(("column", label)) => (format!("column_{label}"), "column"),
            _ => {
                let row = cell_counter / GRID_COLUMNS_HINT;
                let col = cell_counter % GRID_COLUMNS_HINT;
                cell_counter += 1;
                (format!("cell-{row}-{col}"), "cell")
            }
        };
        elements.push(detection_element(
            source_id,
            tag_name,
            det.bbox,
            det.confidence,
            &det.class_name,
        ));
    }

    elements
}

/// Column count used only to derive synthetic cell ids when the service does
/// not label cells itself.
const GRID_COLUMNS_HINT: usize = 26;

fn detection_element(
    source_id: String,
    tag_name: &str,
    bbox: [f64; 4],
    confidence: f64,
    class_name: &str,
) -> InteractiveElement {
    let [x1, y1, x2, y2] = bbox;
    let rect = ElementRect::from_corners(x1, y1, x2, y2);
    let mut attributes = HashMap::new();
    if !class_name.is_empty() {
        attributes.insert("data-cv-class".to_string(), class_name.to_string());
    }
    if confidence > 0.0 {
        attributes.insert("data-cv-confidence".to_string(), format!("{confidence:.3}"));
    }

    InteractiveElement {
        index: 0,
        source_id,
        tag_name: tag_name.to_string(),
        text: String::new(),
        attributes,
        input_type: None,
        viewport_rect: rect,
        page_rect: rect,
        center: Point {
            x: (x1 + x2) / 2.0,
            y: (y1 + y2) / 2.0,
        },
        weight: 1.0,
        z_index: 0,
    }
}
