//! Chromiumoxide-based browser driver.
//!
//! Implements [`BrowserDriver`](crate::browser::BrowserDriver) on top of the
//! `chromiumoxide` crate: local launches or CDP attachment, tab tracking,
//! typed CDP input injection, raw protocol screenshots, and a quiet-window
//! network-idle waiter.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams,
    DispatchMouseEventType, InsertTextParams, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::network::{
    self, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, CaptureScreenshotFormat, CaptureScreenshotParams,
    GetNavigationHistoryParams, NavigateToHistoryEntryParams, ReloadParams,
};
use chromiumoxide::page::Page as ChromiumPage;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};

use crate::browser::{BrowserDriver, BrowserDriverError, LaunchPlan, LaunchStrategy, LoadPhase};
use crate::dom_scripts;
use crate::types::TabInfo;

const READY_STATE_POLL: Duration = Duration::from_millis(100);
const NETWORK_QUIET_WINDOW: Duration = Duration::from_millis(500);

pub struct ChromiumoxideDriver {
    state: Mutex<Option<DriverState>>,
}

struct DriverState {
    browser: Browser,
    _handler: JoinHandle<()>,
    /// Open tabs in user-visible order; `current` indexes into it.
    pages: Vec<ChromiumPage>,
    current: usize,
    /// Wheel events dispatch at the pointer's last known position.
    last_mouse: (f64, f64),
}

impl ChromiumoxideDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }

    async fn current_page(&self) -> Result<ChromiumPage, BrowserDriverError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(BrowserDriverError::NotInitialized)?;
        state
            .pages
            .get(state.current)
            .cloned()
            .ok_or(BrowserDriverError::NoSuchTab(state.current))
    }

    /// Pick up pages opened outside our own `new_tab` calls (e.g.
    /// `target=_blank` links) while preserving the known tab order.
    async fn refresh_pages(&self) -> Result<(), BrowserDriverError> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(BrowserDriverError::NotInitialized)?;

        let live = state
            .browser
            .pages()
            .await
            .map_err(map_chromiumoxide_error)?;
        let live_ids: Vec<String> = live
            .iter()
            .map(|page| page.target_id().as_ref().to_string())
            .collect();

        let current_id = state
            .pages
            .get(state.current)
            .map(|page| page.target_id().as_ref().to_string());

        let mut merged: Vec<ChromiumPage> = state
            .pages
            .iter()
            .filter(|page| live_ids.contains(&page.target_id().as_ref().to_string()))
            .cloned()
            .collect();
        for page in live {
            let id = page.target_id().as_ref().to_string();
            if !merged
                .iter()
                .any(|known| known.target_id().as_ref().to_string() == id)
            {
                merged.push(page);
            }
        }

        state.current = current_id
            .and_then(|id| {
                merged
                    .iter()
                    .position(|page| page.target_id().as_ref().to_string() == id)
            })
            .unwrap_or_else(|| merged.len().saturating_sub(1));
        state.pages = merged;
        Ok(())
    }

    async fn register_page(&self, page: ChromiumPage) -> Result<(), BrowserDriverError> {
        apply_init_script(&page).await?;
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(BrowserDriverError::NotInitialized)?;
        state.pages.push(page);
        state.current = state.pages.len() - 1;
        Ok(())
    }
}

impl Default for ChromiumoxideDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserDriver for ChromiumoxideDriver {
    async fn launch(&self, plan: &LaunchPlan) -> Result<(), BrowserDriverError> {
        if self.state.lock().await.is_some() {
            return Ok(());
        }

        let (browser, handler) = match &plan.strategy {
            LaunchStrategy::AttachCdp { url } => Browser::connect(url)
                .await
                .map_err(map_chromiumoxide_error)?,
            LaunchStrategy::Launch => {
                let config = build_config(plan)?;
                Browser::launch(config)
                    .await
                    .map_err(map_chromiumoxide_error)?
            }
        };

        let handler_task = spawn_handler(handler);
        {
            let mut guard = self.state.lock().await;
            *guard = Some(DriverState {
                browser,
                _handler: handler_task,
                pages: Vec::new(),
                current: 0,
                last_mouse: (0.0, 0.0),
            });
        }

        // Start from one blank tab so the current-page invariant holds.
        let page = {
            let guard = self.state.lock().await;
            let state = guard.as_ref().ok_or(BrowserDriverError::NotInitialized)?;
            state
                .browser
                .new_page("about:blank")
                .await
                .map_err(map_chromiumoxide_error)?
        };
        self.register_page(page).await?;
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), BrowserDriverError> {
        let page = self.current_page().await?;
        page.goto(url).await.map_err(map_chromiumoxide_error)?;
        Ok(())
    }

    async fn go_back(&self) -> Result<(), BrowserDriverError> {
        self.navigate_history(-1).await
    }

    async fn go_forward(&self) -> Result<(), BrowserDriverError> {
        self.navigate_history(1).await
    }

    async fn reload(&self) -> Result<(), BrowserDriverError> {
        let page = self.current_page().await?;
        page.execute(ReloadParams::default())
            .await
            .map_err(map_chromiumoxide_error)?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BrowserDriverError> {
        let page = self.current_page().await?;
        let url = page.url().await.map_err(map_chromiumoxide_error)?;
        Ok(url.unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn list_tabs(&self) -> Result<Vec<TabInfo>, BrowserDriverError> {
        self.refresh_pages().await?;
        let pages = {
            let guard = self.state.lock().await;
            let state = guard.as_ref().ok_or(BrowserDriverError::NotInitialized)?;
            state.pages.clone()
        };

        let mut tabs = Vec::with_capacity(pages.len());
        for (id, page) in pages.iter().enumerate() {
            let url = page
                .url()
                .await
                .map_err(map_chromiumoxide_error)?
                .unwrap_or_default();
            let title = page
                .get_title()
                .await
                .map_err(map_chromiumoxide_error)?
                .unwrap_or_default();
            tabs.push(TabInfo { id, url, title });
        }
        Ok(tabs)
    }

    async fn switch_tab(&self, index: usize) -> Result<(), BrowserDriverError> {
        self.refresh_pages().await?;
        let page = {
            let mut guard = self.state.lock().await;
            let state = guard.as_mut().ok_or(BrowserDriverError::NotInitialized)?;
            let page = state
                .pages
                .get(index)
                .cloned()
                .ok_or(BrowserDriverError::NoSuchTab(index))?;
            state.current = index;
            page
        };
        page.bring_to_front()
            .await
            .map_err(map_chromiumoxide_error)?;
        Ok(())
    }

    async fn new_tab(&self, url: Option<&str>) -> Result<(), BrowserDriverError> {
        let page = {
            let guard = self.state.lock().await;
            let state = guard.as_ref().ok_or(BrowserDriverError::NotInitialized)?;
            state
                .browser
                .new_page(url.unwrap_or("about:blank"))
                .await
                .map_err(map_chromiumoxide_error)?
        };
        self.register_page(page).await
    }

    async fn close_current_tab(&self) -> Result<(), BrowserDriverError> {
        let page = {
            let mut guard = self.state.lock().await;
            let state = guard.as_mut().ok_or(BrowserDriverError::NotInitialized)?;
            if state.pages.is_empty() {
                return Err(BrowserDriverError::NoSuchTab(0));
            }
            let page = state.pages.remove(state.current);
            state.current = state.current.saturating_sub(1);
            page
        };
        page.close().await.map_err(map_chromiumoxide_error)?;
        Ok(())
    }

    async fn mouse_move(&self, x: f64, y: f64) -> Result<(), BrowserDriverError> {
        let page = self.current_page().await?;
        {
            let mut guard = self.state.lock().await;
            if let Some(state) = guard.as_mut() {
                state.last_mouse = (x, y);
            }
        }
        let params = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseMoved)
            .x(x)
            .y(y)
            .build()
            .map_err(BrowserDriverError::Message)?;
        page.execute(params).await.map_err(map_chromiumoxide_error)?;
        Ok(())
    }

    async fn mouse_click(&self, x: f64, y: f64) -> Result<(), BrowserDriverError> {
        let page = self.current_page().await?;
        for event_type in [
            DispatchMouseEventType::MousePressed,
            DispatchMouseEventType::MouseReleased,
        ] {
            let params = DispatchMouseEventParams::builder()
                .r#type(event_type)
                .x(x)
                .y(y)
                .button(MouseButton::Left)
                .click_count(1)
                .build()
                .map_err(BrowserDriverError::Message)?;
            page.execute(params).await.map_err(map_chromiumoxide_error)?;
        }
        Ok(())
    }

    async fn mouse_wheel(&self, delta_x: f64, delta_y: f64) -> Result<(), BrowserDriverError> {
        let page = self.current_page().await?;
        let (x, y) = {
            let guard = self.state.lock().await;
            guard.as_ref().map(|state| state.last_mouse).unwrap_or((0.0, 0.0))
        };
        let params = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseWheel)
            .x(x)
            .y(y)
            .delta_x(delta_x)
            .delta_y(delta_y)
            .build()
            .map_err(BrowserDriverError::Message)?;
        page.execute(params).await.map_err(map_chromiumoxide_error)?;
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<(), BrowserDriverError> {
        let page = self.current_page().await?;
        let params = InsertTextParams {
            text: text.to_string(),
        };
        page.execute(params).await.map_err(map_chromiumoxide_error)?;
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<(), BrowserDriverError> {
        let page = self.current_page().await?;
        let chord = KeyChord::parse(key);

        for event_type in [DispatchKeyEventType::KeyDown, DispatchKeyEventType::KeyUp] {
            let is_down = matches!(event_type, DispatchKeyEventType::KeyDown);
            let mut builder = DispatchKeyEventParams::builder()
                .r#type(event_type)
                .key(chord.key.clone())
                .code(chord.code.clone())
                .modifiers(chord.modifiers)
                .windows_virtual_key_code(chord.virtual_key_code);
            if is_down {
                if let Some(text) = &chord.text {
                    builder = builder.text(text.clone());
                }
            }
            let params = builder.build().map_err(BrowserDriverError::Message)?;
            page.execute(params).await.map_err(map_chromiumoxide_error)?;
        }
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<Value, BrowserDriverError> {
        let page = self.current_page().await?;
        let result = page.evaluate(script).await.map_err(map_chromiumoxide_error)?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    async fn screenshot_cdp(&self) -> Result<String, BrowserDriverError> {
        let page = self.current_page().await?;
        let mut params = CaptureScreenshotParams::default();
        params.format = Some(CaptureScreenshotFormat::Png);
        let response = page.execute(params).await.map_err(map_chromiumoxide_error)?;
        Ok(response.result.data.clone().into())
    }

    async fn screenshot(&self) -> Result<String, BrowserDriverError> {
        let page = self.current_page().await?;
        let bytes = page
            .screenshot(
                chromiumoxide::page::ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .build(),
            )
            .await
            .map_err(map_chromiumoxide_error)?;
        Ok(BASE64.encode(bytes))
    }

    async fn wait_for_load(
        &self,
        phase: LoadPhase,
        timeout: Duration,
    ) -> Result<(), BrowserDriverError> {
        match phase {
            LoadPhase::DomContentLoaded => {
                self.wait_for_ready_state(&["interactive", "complete"], timeout)
                    .await
            }
            LoadPhase::Load => self.wait_for_ready_state(&["complete"], timeout).await,
            LoadPhase::NetworkIdle => self.wait_for_network_idle(timeout).await,
        }
    }

    async fn storage_state(&self) -> Result<Value, BrowserDriverError> {
        let page = self.current_page().await?;
        let response = page
            .execute(network::GetCookiesParams::default())
            .await
            .map_err(map_chromiumoxide_error)?;
        let cookies = serde_json::to_value(&response.result.cookies)
            .map_err(|err| BrowserDriverError::Message(err.to_string()))?;
        Ok(serde_json::json!({ "cookies": cookies }))
    }

    async fn close(&self) -> Result<(), BrowserDriverError> {
        let state = {
            let mut guard = self.state.lock().await;
            guard.take()
        };
        if let Some(state) = state {
            // Dropping the Browser terminates the spawned Chrome process;
            // the handler task is aborted so its stream stops polling.
            state._handler.abort();
            drop(state.browser);
        }
        Ok(())
    }
}

impl ChromiumoxideDriver {
    async fn navigate_history(&self, offset: i64) -> Result<(), BrowserDriverError> {
        let page = self.current_page().await?;
        let history = page
            .execute(GetNavigationHistoryParams::default())
            .await
            .map_err(map_chromiumoxide_error)?;

        let target_index = history.result.current_index + offset;
        let entry = history
            .result
            .entries
            .get(target_index.max(0) as usize)
            .ok_or_else(|| BrowserDriverError::Message("no history entry to navigate to".into()))?;

        let params = NavigateToHistoryEntryParams { entry_id: entry.id };
        page.execute(params).await.map_err(map_chromiumoxide_error)?;
        Ok(())
    }

    async fn wait_for_ready_state(
        &self,
        accepted: &[&str],
        timeout: Duration,
    ) -> Result<(), BrowserDriverError> {
        let deadline = Instant::now() + timeout;
        loop {
            let ready_state = self
                .evaluate("document.readyState")
                .await?
                .as_str()
                .unwrap_or_default()
                .to_string();
            if accepted.contains(&ready_state.as_str()) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BrowserDriverError::Message(format!(
                    "page did not reach readyState {accepted:?} within {timeout:?}"
                )));
            }
            sleep(READY_STATE_POLL).await;
        }
    }

    /// Wait until no request has started or finished for a quiet window, or
    /// the timeout elapses. The timeout path returns Ok: network idle is a
    /// best-effort settle signal, not a correctness condition.
    async fn wait_for_network_idle(&self, timeout: Duration) -> Result<(), BrowserDriverError> {
        let page = self.current_page().await?;
        page.execute(network::EnableParams::default())
            .await
            .map_err(map_chromiumoxide_error)?;

        let mut started = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(map_chromiumoxide_error)?;
        let mut finished = page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(map_chromiumoxide_error)?;
        let mut failed = page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(map_chromiumoxide_error)?;

        let deadline = Instant::now() + timeout;
        let mut quiet_until = Instant::now() + NETWORK_QUIET_WINDOW;

        loop {
            let now = Instant::now();
            if now >= deadline || now >= quiet_until {
                return Ok(());
            }

            tokio::select! {
                _ = tokio::time::sleep_until(quiet_until) => return Ok(()),
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
                event = started.next() => {
                    if event.is_some() {
                        quiet_until = Instant::now() + NETWORK_QUIET_WINDOW;
                    }
                }
                event = finished.next() => {
                    if event.is_some() {
                        quiet_until = Instant::now() + NETWORK_QUIET_WINDOW;
                    }
                }
                event = failed.next() => {
                    if event.is_some() {
                        quiet_until = Instant::now() + NETWORK_QUIET_WINDOW;
                    }
                }
            }
        }
    }
}

/// One parsed key press, possibly with modifier prefixes (`Control+a`).
struct KeyChord {
    key: String,
    code: String,
    modifiers: i64,
    virtual_key_code: i64,
    text: Option<String>,
}

impl KeyChord {
    fn parse(spec: &str) -> Self {
        let mut modifiers = 0i64;
        let mut key = spec.to_string();

        if let Some((prefix, last)) = spec.rsplit_once('+') {
            key = last.to_string();
            for modifier in prefix.split('+') {
                modifiers |= match modifier.trim().to_ascii_lowercase().as_str() {
                    "alt" => 1,
                    "control" | "ctrl" => 2,
                    "meta" | "cmd" => 4,
                    "shift" => 8,
                    _ => 0,
                };
            }
        }

        match key.as_str() {
            "Enter" => Self {
                key: "Enter".into(),
                code: "Enter".into(),
                modifiers,
                virtual_key_code: 13,
                text: Some("\r".into()),
            },
            "Backspace" => Self {
                key: "Backspace".into(),
                code: "Backspace".into(),
                modifiers,
                virtual_key_code: 8,
                text: None,
            },
            "Tab" => Self {
                key: "Tab".into(),
                code: "Tab".into(),
                modifiers,
                virtual_key_code: 9,
                text: None,
            },
            "Escape" => Self {
                key: "Escape".into(),
                code: "Escape".into(),
                modifiers,
                virtual_key_code: 27,
                text: None,
            },
            single if single.chars().count() == 1 => {
                let ch = single.chars().next().unwrap_or('a');
                let upper = ch.to_ascii_uppercase();
                Self {
                    key: single.to_string(),
                    code: format!("Key{upper}"),
                    modifiers,
                    virtual_key_code: upper as i64,
                    // Text only makes sense for plain character presses.
                    text: (modifiers == 0).then(|| single.to_string()),
                }
            }
            other => Self {
                key: other.to_string(),
                code: other.to_string(),
                modifiers,
                virtual_key_code: 0,
                text: None,
            },
        }
    }
}

fn build_config(plan: &LaunchPlan) -> Result<BrowserConfig, BrowserDriverError> {
    let viewport = chromiumoxide::handler::viewport::Viewport {
        width: plan.viewport_width,
        height: plan.viewport_height,
        device_scale_factor: None,
        emulating_mobile: false,
        is_landscape: plan.viewport_width >= plan.viewport_height,
        has_touch: false,
    };

    let mut builder = BrowserConfig::builder();

    if let Some(path) = &plan.chrome_executable {
        builder = builder.chrome_executable(path);
    }

    let builder = builder.viewport(viewport).args(plan.args.clone());

    let builder = if plan.headless {
        builder
    } else {
        builder.with_head()
    };

    builder.build().map_err(BrowserDriverError::Message)
}

fn map_chromiumoxide_error<E: std::fmt::Display>(err: E) -> BrowserDriverError {
    BrowserDriverError::Message(err.to_string())
}

async fn apply_init_script(page: &ChromiumPage) -> Result<(), BrowserDriverError> {
    let params = AddScriptToEvaluateOnNewDocumentParams::builder()
        .source(dom_scripts::INIT_SCRIPT)
        .build()
        .map_err(BrowserDriverError::Message)?;
    page.execute(params).await.map_err(map_chromiumoxide_error)?;
    Ok(())
}

fn spawn_handler(mut handler: chromiumoxide::handler::Handler) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(result) = handler.next().await {
            if let Err(err) = result {
                log::debug!("chromiumoxide handler error: {err}");
            }
        }
    })
}
