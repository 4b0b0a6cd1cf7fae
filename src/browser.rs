//! Browser boundary primitives.
//!
//! Defines the [`BrowserDriver`] trait that abstracts the automation engine
//! (navigation, tab lifecycle, input injection, script evaluation, and
//! screenshot capture) plus the [`Browser`] session wrapper that owns the
//! driver, the state snapshotter, and the current [`BrowserState`].

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::PilotConfig;
use crate::detector::ElementDetector;
use crate::logging::AgentLogger;
use crate::snapshot::{SnapshotError, StateSnapshotter};
use crate::types::{BrowserState, TabInfo};

/// Errors surfaced by driver implementations.
#[derive(Debug, Error)]
pub enum BrowserDriverError {
    #[error("browser runtime has not been initialised")]
    NotInitialized,
    #[error("no open tab at index {0}")]
    NoSuchTab(usize),
    #[error("operation not supported by this driver: {0}")]
    Unsupported(&'static str),
    #[error("{0}")]
    Message(String),
}

/// Page-load phases a caller can wait on. `NetworkIdle` is bounded: exceeding
/// its timeout is reported as success-with-warning by callers, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    DomContentLoaded,
    Load,
    NetworkIdle,
}

/// How the driver obtains a browser to control.
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchStrategy {
    /// Attach to an already-running browser over CDP.
    AttachCdp { url: String },
    /// Launch a new local browser process.
    Launch,
}

/// Normalised launch parameters derived from the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub strategy: LaunchStrategy,
    pub headless: bool,
    pub chrome_executable: Option<PathBuf>,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub args: Vec<String>,
}

impl LaunchPlan {
    pub fn from_config(config: &PilotConfig) -> Self {
        let strategy = match &config.cdp_url {
            Some(url) => LaunchStrategy::AttachCdp { url: url.clone() },
            None => LaunchStrategy::Launch,
        };
        Self {
            strategy,
            headless: config.headless,
            chrome_executable: config.chrome_executable.clone(),
            viewport_width: config.viewport_width,
            viewport_height: config.viewport_height,
            args: config.browser_args.clone(),
        }
    }
}

/// Abstraction over the browser automation engine.
///
/// All methods act on the currently focused tab unless stated otherwise.
/// Implementations must be safe to call from a single logical flow at a time;
/// no internal ordering guarantees are needed beyond that.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(&self, plan: &LaunchPlan) -> Result<(), BrowserDriverError>;

    async fn navigate(&self, url: &str) -> Result<(), BrowserDriverError>;

    async fn go_back(&self) -> Result<(), BrowserDriverError>;

    async fn go_forward(&self) -> Result<(), BrowserDriverError>;

    async fn reload(&self) -> Result<(), BrowserDriverError>;

    async fn current_url(&self) -> Result<String, BrowserDriverError>;

    async fn list_tabs(&self) -> Result<Vec<TabInfo>, BrowserDriverError>;

    async fn switch_tab(&self, index: usize) -> Result<(), BrowserDriverError>;

    async fn new_tab(&self, url: Option<&str>) -> Result<(), BrowserDriverError>;

    async fn close_current_tab(&self) -> Result<(), BrowserDriverError>;

    async fn mouse_move(&self, x: f64, y: f64) -> Result<(), BrowserDriverError>;

    async fn mouse_click(&self, x: f64, y: f64) -> Result<(), BrowserDriverError>;

    async fn mouse_wheel(&self, delta_x: f64, delta_y: f64) -> Result<(), BrowserDriverError>;

    async fn type_text(&self, text: &str) -> Result<(), BrowserDriverError>;

    /// Press a key or chord, e.g. `"Enter"` or `"Control+a"`.
    async fn press_key(&self, key: &str) -> Result<(), BrowserDriverError>;

    /// Evaluate a script expression in the page, returning its JSON value.
    async fn evaluate(&self, script: &str) -> Result<Value, BrowserDriverError>;

    /// Raw low-level protocol screenshot (base64 PNG) — the fast path.
    async fn screenshot_cdp(&self) -> Result<String, BrowserDriverError>;

    /// Higher-level screenshot fallback (base64 PNG).
    async fn screenshot(&self) -> Result<String, BrowserDriverError>;

    async fn wait_for_load(
        &self,
        phase: LoadPhase,
        timeout: Duration,
    ) -> Result<(), BrowserDriverError>;

    /// Persistent storage state (cookies etc.) as an opaque JSON value.
    async fn storage_state(&self) -> Result<Value, BrowserDriverError>;

    async fn close(&self) -> Result<(), BrowserDriverError>;
}

/// A live browsing session: driver + snapshotter + the current state.
///
/// Exactly one [`BrowserState`] is current at a time; a successful capture
/// fully replaces it, and a failed capture falls back to the previous one.
/// `close` is idempotent and releases the underlying browser exactly once.
pub struct Browser {
    driver: Arc<dyn BrowserDriver>,
    snapshotter: StateSnapshotter,
    state: Mutex<Option<BrowserState>>,
    closed: AtomicBool,
    logger: Arc<AgentLogger>,
}

impl Browser {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        detector: Option<Arc<dyn ElementDetector>>,
        logger: Arc<AgentLogger>,
    ) -> Self {
        let snapshotter = StateSnapshotter::new(driver.clone(), detector, logger.clone());
        Self {
            driver,
            snapshotter,
            state: Mutex::new(None),
            closed: AtomicBool::new(false),
            logger,
        }
    }

    pub fn driver(&self) -> Arc<dyn BrowserDriver> {
        self.driver.clone()
    }

    pub async fn launch(&self, plan: &LaunchPlan) -> Result<(), BrowserDriverError> {
        self.driver.launch(plan).await
    }

    /// Capture a fresh state snapshot and make it current.
    pub async fn capture_state(&self) -> Result<BrowserState, SnapshotError> {
        let mut guard = self.state.lock().await;
        let captured = self.snapshotter.capture(guard.as_ref()).await?;
        *guard = Some(captured.clone());
        Ok(captured)
    }

    /// Clone of the current state, if one has been captured.
    pub async fn state(&self) -> Option<BrowserState> {
        self.state.lock().await.clone()
    }

    /// Fetch the browser's persisted storage state; failures degrade to
    /// `None` since the run output can live without it.
    pub async fn storage_state(&self) -> Option<Value> {
        match self.driver.storage_state().await {
            Ok(value) => Some(value),
            Err(err) => {
                self.logger.debug(
                    format!("failed to fetch storage state: {err}"),
                    Some("browser"),
                    None,
                );
                None
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn set_state_for_tests(&self, state: BrowserState) {
        *self.state.lock().await = Some(state);
    }

    /// Release the underlying browser. Safe to call more than once; only the
    /// first call reaches the driver.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.driver.close().await {
            self.logger.error(
                format!("failed to close browser: {err}"),
                Some("browser"),
                None,
            );
        }
    }
}
