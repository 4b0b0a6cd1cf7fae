//! Browser state capture.
//!
//! Coordinates screenshot capture, DOM element discovery, optional vision
//! detection, highlight rendering, and tab enumeration into one consistent
//! [`BrowserState`]. Captures issued mid-navigation are flaky (the discovery
//! script may run against a half-loaded DOM), so the whole sequence is
//! wrapped in a bounded retry and falls back to the last known-good state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::time::sleep;

use crate::browser::{BrowserDriver, BrowserDriverError};
use crate::detector::{ElementDetector, detect_with_retry};
use crate::dom_scripts;
use crate::geometry;
use crate::highlight;
use crate::logging::AgentLogger;
use crate::types::{BrowserState, InteractiveElement, Viewport};

const CAPTURE_ATTEMPTS: u32 = 3;
const CAPTURE_BACKOFF_MS: u64 = 500;

/// Hosts whose pages get the dense-grid detection mode.
const SPREADSHEET_URL_PATTERNS: [&str; 3] = [
    "docs.google.com/spreadsheets",
    "sheets.googleusercontent.com",
    ".sharepoint.com/:x:",
];

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Driver(#[from] BrowserDriverError),
    #[error("element discovery returned an unexpected payload: {0}")]
    Discovery(#[from] serde_json::Error),
}

/// Payload returned by the embedded element-discovery script.
#[derive(Debug, Deserialize)]
struct DiscoveryPayload {
    viewport: Viewport,
    #[serde(default)]
    elements: Vec<InteractiveElement>,
}

/// Produces [`BrowserState`] snapshots from the live browser.
pub struct StateSnapshotter {
    driver: Arc<dyn BrowserDriver>,
    detector: Option<Arc<dyn ElementDetector>>,
    logger: Arc<AgentLogger>,
}

impl StateSnapshotter {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        detector: Option<Arc<dyn ElementDetector>>,
        logger: Arc<AgentLogger>,
    ) -> Self {
        Self {
            driver,
            detector,
            logger,
        }
    }

    /// Capture a snapshot with bounded retries. When every attempt fails the
    /// previous known-good state is returned if one exists; otherwise the
    /// last error propagates.
    pub async fn capture(
        &self,
        previous: Option<&BrowserState>,
    ) -> Result<BrowserState, SnapshotError> {
        let mut delay = Duration::from_millis(CAPTURE_BACKOFF_MS);
        let mut last_error: Option<SnapshotError> = None;

        for attempt in 1..=CAPTURE_ATTEMPTS {
            match self.capture_once().await {
                Ok(state) => return Ok(state),
                Err(err) => {
                    self.logger.debug(
                        format!("state capture attempt {attempt} failed: {err}"),
                        Some("snapshot"),
                        None,
                    );
                    last_error = Some(err);
                    if attempt < CAPTURE_ATTEMPTS {
                        sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        if let Some(previous) = previous {
            self.logger.error(
                "state capture failed; falling back to previous state",
                Some("snapshot"),
                None,
            );
            return Ok(previous.clone());
        }

        Err(last_error.unwrap_or(SnapshotError::Driver(BrowserDriverError::NotInitialized)))
    }

    async fn capture_once(&self) -> Result<BrowserState, SnapshotError> {
        let url = self.driver.current_url().await?;
        let detect_grid = is_spreadsheet_url(&url);

        let screenshot = self.capture_screenshot().await?;

        // DOM discovery and vision detection both read the same page/shot,
        // so they run concurrently and join before fusion.
        let discovery_future = self.discover_elements();
        let (discovery, cv_elements) = match &self.detector {
            Some(detector) => {
                let detection_future =
                    detect_with_retry(detector.as_ref(), &screenshot, detect_grid, &self.logger);
                let (discovery, detections) = tokio::join!(discovery_future, detection_future);
                (discovery?, detections)
            }
            None => (discovery_future.await?, Vec::new()),
        };

        let fused = geometry::fuse_elements(discovery.elements, cv_elements);

        let screenshot_with_highlights = match highlight::draw_highlights(&screenshot, &fused) {
            Ok(highlighted) => highlighted,
            Err(err) => {
                self.logger.debug(
                    format!("highlight rendering failed: {err}; using raw screenshot"),
                    Some("snapshot"),
                    None,
                );
                screenshot.clone()
            }
        };

        let tabs = self.driver.list_tabs().await?;

        let interactive_elements: HashMap<usize, InteractiveElement> = fused
            .into_iter()
            .map(|element| (element.index, element))
            .collect();

        self.logger.debug(
            format!(
                "captured state: {} elements, {} tabs, url={url}",
                interactive_elements.len(),
                tabs.len()
            ),
            Some("snapshot"),
            None,
        );

        Ok(BrowserState {
            url,
            tabs,
            viewport: discovery.viewport,
            screenshot,
            screenshot_with_highlights,
            interactive_elements,
        })
    }

    /// Low-level protocol screenshot first for latency; fall back to the
    /// higher-level capture on failure.
    async fn capture_screenshot(&self) -> Result<String, SnapshotError> {
        match self.driver.screenshot_cdp().await {
            Ok(data) => Ok(data),
            Err(err) => {
                self.logger.debug(
                    format!("CDP screenshot failed: {err}; using fallback"),
                    Some("snapshot"),
                    None,
                );
                Ok(self.driver.screenshot().await?)
            }
        }
    }

    async fn discover_elements(&self) -> Result<DiscoveryPayload, SnapshotError> {
        let value = self
            .driver
            .evaluate(dom_scripts::element_discovery_script())
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Whether the URL points at a spreadsheet-like page that needs grid
/// detection instead of discrete controls.
pub fn is_spreadsheet_url(url: &str) -> bool {
    SPREADSHEET_URL_PATTERNS
        .iter()
        .any(|pattern| url.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{LaunchPlan, LoadPhase};
    use crate::config::Verbosity;
    use crate::types::TabInfo;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Mutex;

    struct ScriptedDriver {
        /// Discovery payloads served in order; `Err` entries simulate
        /// mid-navigation flakes.
        discovery_results: Mutex<Vec<Result<Value, BrowserDriverError>>>,
        cdp_screenshot_fails: bool,
        screenshot_calls: Mutex<usize>,
    }

    impl ScriptedDriver {
        fn new(results: Vec<Result<Value, BrowserDriverError>>) -> Self {
            Self {
                discovery_results: Mutex::new(results),
                cdp_screenshot_fails: false,
                screenshot_calls: Mutex::new(0),
            }
        }
    }

    fn discovery_payload() -> Value {
        json!({
            "viewport": {
                "width": 1280.0,
                "height": 900.0,
                "scrollX": 0.0,
                "scrollY": 0.0,
                "devicePixelRatio": 1.0,
                "scrollDistanceAboveViewport": 0.0,
                "scrollDistanceBelowViewport": 600.0
            },
            "elements": [{
                "index": 0,
                "sourceId": "agent-0",
                "tagName": "button",
                "text": "Go",
                "attributes": {},
                "viewportRect": {
                    "left": 10.0, "top": 10.0, "right": 60.0, "bottom": 30.0,
                    "width": 50.0, "height": 20.0
                },
                "pageRect": {
                    "left": 10.0, "top": 10.0, "right": 60.0, "bottom": 30.0,
                    "width": 50.0, "height": 20.0
                },
                "center": { "x": 35.0, "y": 20.0 },
                "weight": 1.0,
                "zIndex": 0
            }]
        })
    }

    fn tiny_png_b64() -> String {
        use base64::Engine;
        use image::{Rgba, RgbaImage};
        let image = RgbaImage::from_pixel(64, 64, Rgba([255, 255, 255, 255]));
        let mut buffer = Vec::new();
        image::DynamicImage::ImageRgba8(image)
            .write_to(
                &mut std::io::Cursor::new(&mut buffer),
                image::ImageFormat::Png,
            )
            .expect("encode");
        base64::engine::general_purpose::STANDARD.encode(buffer)
    }

    #[async_trait]
    impl BrowserDriver for ScriptedDriver {
        async fn launch(&self, _plan: &LaunchPlan) -> Result<(), BrowserDriverError> {
            Ok(())
        }
        async fn navigate(&self, _url: &str) -> Result<(), BrowserDriverError> {
            Ok(())
        }
        async fn go_back(&self) -> Result<(), BrowserDriverError> {
            Ok(())
        }
        async fn go_forward(&self) -> Result<(), BrowserDriverError> {
            Ok(())
        }
        async fn reload(&self) -> Result<(), BrowserDriverError> {
            Ok(())
        }
        async fn current_url(&self) -> Result<String, BrowserDriverError> {
            Ok("https://example.com".into())
        }
        async fn list_tabs(&self) -> Result<Vec<TabInfo>, BrowserDriverError> {
            Ok(vec![TabInfo {
                id: 0,
                url: "https://example.com".into(),
                title: "Example".into(),
            }])
        }
        async fn switch_tab(&self, _index: usize) -> Result<(), BrowserDriverError> {
            Ok(())
        }
        async fn new_tab(&self, _url: Option<&str>) -> Result<(), BrowserDriverError> {
            Ok(())
        }
        async fn close_current_tab(&self) -> Result<(), BrowserDriverError> {
            Ok(())
        }
        async fn mouse_move(&self, _x: f64, _y: f64) -> Result<(), BrowserDriverError> {
            Ok(())
        }
        async fn mouse_click(&self, _x: f64, _y: f64) -> Result<(), BrowserDriverError> {
            Ok(())
        }
        async fn mouse_wheel(&self, _dx: f64, _dy: f64) -> Result<(), BrowserDriverError> {
            Ok(())
        }
        async fn type_text(&self, _text: &str) -> Result<(), BrowserDriverError> {
            Ok(())
        }
        async fn press_key(&self, _key: &str) -> Result<(), BrowserDriverError> {
            Ok(())
        }
        async fn evaluate(&self, _script: &str) -> Result<Value, BrowserDriverError> {
            self.discovery_results
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(BrowserDriverError::NotInitialized))
        }
        async fn screenshot_cdp(&self) -> Result<String, BrowserDriverError> {
            if self.cdp_screenshot_fails {
                return Err(BrowserDriverError::Message("cdp capture glitch".into()));
            }
            Ok(tiny_png_b64())
        }
        async fn screenshot(&self) -> Result<String, BrowserDriverError> {
            *self.screenshot_calls.lock().unwrap() += 1;
            Ok(tiny_png_b64())
        }
        async fn wait_for_load(
            &self,
            _phase: LoadPhase,
            _timeout: Duration,
        ) -> Result<(), BrowserDriverError> {
            Ok(())
        }
        async fn storage_state(&self) -> Result<Value, BrowserDriverError> {
            Ok(Value::Null)
        }
        async fn close(&self) -> Result<(), BrowserDriverError> {
            Ok(())
        }
    }

    fn snapshotter(driver: ScriptedDriver) -> StateSnapshotter {
        StateSnapshotter::new(
            Arc::new(driver),
            None,
            Arc::new(AgentLogger::new(Verbosity::Minimal)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn capture_assembles_state() {
        let driver = ScriptedDriver::new(vec![Ok(discovery_payload())]);
        let state = snapshotter(driver).capture(None).await.expect("capture");

        assert_eq!(state.url, "https://example.com");
        assert_eq!(state.interactive_elements.len(), 1);
        assert_eq!(state.tabs.len(), 1);
        assert!(!state.screenshot.is_empty());
        assert!(!state.screenshot_with_highlights.is_empty());
        assert_eq!(state.viewport.scroll_distance_below_viewport, 600.0);
    }

    #[tokio::test(start_paused = true)]
    async fn capture_retries_flaky_discovery() {
        // Results pop from the end: two failures then a success.
        let driver = ScriptedDriver::new(vec![
            Ok(discovery_payload()),
            Err(BrowserDriverError::Message("mid-navigation".into())),
            Err(BrowserDriverError::Message("mid-navigation".into())),
        ]);
        let state = snapshotter(driver).capture(None).await.expect("capture");
        assert_eq!(state.interactive_elements.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn capture_falls_back_to_previous_state() {
        let driver = ScriptedDriver::new(vec![
            Err(BrowserDriverError::Message("broken".into())),
            Err(BrowserDriverError::Message("broken".into())),
            Err(BrowserDriverError::Message("broken".into())),
        ]);
        let previous = BrowserState {
            url: "https://previous.example".into(),
            ..BrowserState::default()
        };

        let state = snapshotter(driver)
            .capture(Some(&previous))
            .await
            .expect("fallback");
        assert_eq!(state.url, "https://previous.example");
    }

    #[tokio::test(start_paused = true)]
    async fn capture_propagates_error_without_fallback() {
        let driver = ScriptedDriver::new(vec![
            Err(BrowserDriverError::Message("broken".into())),
            Err(BrowserDriverError::Message("broken".into())),
            Err(BrowserDriverError::Message("broken".into())),
        ]);
        let result = snapshotter(driver).capture(None).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cdp_screenshot_failure_uses_fallback_channel() {
        let mut driver = ScriptedDriver::new(vec![Ok(discovery_payload())]);
        driver.cdp_screenshot_fails = true;
        let driver = Arc::new(driver);
        let snapshotter = StateSnapshotter::new(
            driver.clone(),
            None,
            Arc::new(AgentLogger::new(Verbosity::Minimal)),
        );

        snapshotter.capture(None).await.expect("capture");
        assert_eq!(*driver.screenshot_calls.lock().unwrap(), 1);
    }

    #[test]
    fn spreadsheet_url_detection() {
        assert!(is_spreadsheet_url(
            "https://docs.google.com/spreadsheets/d/abc/edit"
        ));
        assert!(!is_spreadsheet_url("https://docs.google.com/document/d/abc"));
        assert!(!is_spreadsheet_url("https://example.com"));
    }
}
