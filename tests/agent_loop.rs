//! End-to-end agent loop tests driven by mock collaborators.
//!
//! A scripted driver serves canned discovery payloads and screenshots, a
//! scripted provider plays back model responses, and the assertions cover the
//! perception-to-action pipeline: fusion output, stale-index handling, run
//! termination, timeout chunks, and resume from serialized state.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_stream::StreamExt;

use webpilot::agent::{Agent, AgentError, RunOptions};
use webpilot::browser::{Browser, BrowserDriver, BrowserDriverError, LaunchPlan, LoadPhase};
use webpilot::config::{PilotConfig, Verbosity};
use webpilot::controller::ActionController;
use webpilot::detector::{DetectorError, ElementDetector};
use webpilot::llm::{LlmError, LlmProvider};
use webpilot::logging::AgentLogger;
use webpilot::types::{
    AgentState, AgentStreamChunk, InteractiveElement, LlmResponse, Message, TabInfo, TokenUsage,
};

fn tiny_png_b64() -> String {
    use base64::Engine;
    use image::{Rgba, RgbaImage};
    let image = RgbaImage::from_pixel(32, 32, Rgba([255, 255, 255, 255]));
    let mut buffer = Vec::new();
    image::DynamicImage::ImageRgba8(image)
        .write_to(
            &mut std::io::Cursor::new(&mut buffer),
            image::ImageFormat::Png,
        )
        .expect("encode png");
    base64::engine::general_purpose::STANDARD.encode(buffer)
}

fn element_json(source_id: &str, left: f64, top: f64, right: f64, bottom: f64) -> Value {
    json!({
        "index": 0,
        "sourceId": source_id,
        "tagName": "button",
        "text": source_id,
        "attributes": {},
        "viewportRect": {
            "left": left, "top": top, "right": right, "bottom": bottom,
            "width": right - left, "height": bottom - top
        },
        "pageRect": {
            "left": left, "top": top, "right": right, "bottom": bottom,
            "width": right - left, "height": bottom - top
        },
        "center": { "x": (left + right) / 2.0, "y": (top + bottom) / 2.0 },
        "weight": 1.0,
        "zIndex": 0
    })
}

fn discovery_payload(elements: Vec<Value>) -> Value {
    json!({
        "viewport": {
            "width": 1280.0,
            "height": 900.0,
            "scrollX": 0.0,
            "scrollY": 0.0,
            "devicePixelRatio": 1.0,
            "scrollDistanceAboveViewport": 0.0,
            "scrollDistanceBelowViewport": 0.0
        },
        "elements": elements
    })
}

/// Driver serving a fixed discovery payload; optionally delays evaluation to
/// simulate a slow page for the timeout scenarios.
struct MockDriver {
    payload: Value,
    evaluate_delay: Option<Duration>,
    clicks: StdMutex<Vec<(f64, f64)>>,
    close_calls: StdMutex<usize>,
}

impl MockDriver {
    fn new(payload: Value) -> Self {
        Self {
            payload,
            evaluate_delay: None,
            clicks: StdMutex::new(Vec::new()),
            close_calls: StdMutex::new(0),
        }
    }
}

#[async_trait]
impl BrowserDriver for MockDriver {
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
    async fn mouse_click(&self, x: f64, y: f64) -> Result<(), BrowserDriverError> {
        self.clicks.lock().unwrap().push((x, y));
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
        if let Some(delay) = self.evaluate_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.payload.clone())
    }
    async fn screenshot_cdp(&self) -> Result<String, BrowserDriverError> {
        Ok(tiny_png_b64())
    }
    async fn screenshot(&self) -> Result<String, BrowserDriverError> {
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
        Ok(json!({ "cookies": [] }))
    }
    async fn close(&self) -> Result<(), BrowserDriverError> {
        *self.close_calls.lock().unwrap() += 1;
        Ok(())
    }
}

/// Provider playing back a scripted sequence of responses; the last entry
/// repeats once the script is exhausted.
struct ScriptedProvider {
    responses: StdMutex<VecDeque<String>>,
}

impl ScriptedProvider {
    fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: StdMutex::new(responses.into_iter().map(String::from).collect()),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn call(&self, _messages: &[Message]) -> Result<LlmResponse, LlmError> {
        let mut responses = self.responses.lock().unwrap();
        let content = if responses.len() > 1 {
            responses.pop_front().unwrap()
        } else {
            responses
                .front()
                .cloned()
                .ok_or(LlmError::EmptyResponse)?
        };
        Ok(LlmResponse {
            content,
            usage: TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 20,
                total_tokens: 120,
            },
            thinking: None,
        })
    }
}

fn done_response() -> &'static str {
    r#"<output>{ "thought": "the task is complete", "action": { "name": "done", "params": { "text": "finished" } }, "summary": "Done" }</output>"#
}

fn click_response(index: usize) -> String {
    format!(
        r#"<output>{{ "thought": "click element {index}", "action": {{ "name": "click_element", "params": {{ "index": {index} }} }}, "summary": "Clicking" }}</output>"#
    )
}

fn make_browser(driver: Arc<MockDriver>) -> Arc<Browser> {
    Arc::new(Browser::new(
        driver,
        None,
        Arc::new(AgentLogger::new(Verbosity::Minimal)),
    ))
}

fn make_agent(driver: Arc<MockDriver>, provider: ScriptedProvider) -> Arc<Agent> {
    let config = PilotConfig {
        verbose: Verbosity::Minimal,
        ..PilotConfig::default()
    };
    Arc::new(Agent::new(
        config,
        make_browser(driver),
        Arc::new(provider),
    ))
}

// Scenario A: detector disabled, three disjoint DOM elements come back in
// reading order with contiguous indices.
#[tokio::test(start_paused = true)]
async fn fusion_preserves_disjoint_dom_elements() {
    let payload = discovery_payload(vec![
        element_json("below", 0.0, 100.0, 50.0, 120.0),
        element_json("right", 200.0, 0.0, 260.0, 20.0),
        element_json("left", 0.0, 2.0, 50.0, 22.0),
    ]);
    let browser = make_browser(Arc::new(MockDriver::new(payload)));

    let state = browser.capture_state().await.expect("capture");
    assert_eq!(state.interactive_elements.len(), 3);

    let ordered: Vec<&str> = (0..3)
        .map(|index| state.interactive_elements[&index].source_id.as_str())
        .collect();
    assert_eq!(ordered, ["left", "right", "below"]);
}

// Scenario B: a CV detection overlapping a DOM element above the IoU
// threshold is deduplicated; the larger element survives.
#[tokio::test(start_paused = true)]
async fn fusion_drops_high_overlap_cv_detection() {
    struct OverlappingDetector;

    #[async_trait]
    impl ElementDetector for OverlappingDetector {
        async fn detect(
            &self,
            _image_b64: &str,
            _detect_grid: bool,
        ) -> Result<Vec<InteractiveElement>, DetectorError> {
            let raw = element_json("cv-0", 1.0, 1.0, 99.0, 39.0);
            Ok(vec![serde_json::from_value(raw).expect("element")])
        }
    }

    let payload = discovery_payload(vec![element_json("dom-big", 0.0, 0.0, 100.0, 40.0)]);
    let browser = Arc::new(Browser::new(
        Arc::new(MockDriver::new(payload)),
        Some(Arc::new(OverlappingDetector)),
        Arc::new(AgentLogger::new(Verbosity::Minimal)),
    ));

    let state = browser.capture_state().await.expect("capture");
    assert_eq!(state.interactive_elements.len(), 1);
    assert_eq!(state.interactive_elements[&0].source_id, "dom-big");
}

// Scenario C: clicking a non-existent index produces an error result and no
// browser interaction.
#[tokio::test(start_paused = true)]
async fn click_on_missing_index_is_a_soft_error() {
    let payload = discovery_payload(vec![element_json("only", 0.0, 0.0, 50.0, 20.0)]);
    let driver = Arc::new(MockDriver::new(payload));
    let browser = make_browser(driver.clone());
    browser.capture_state().await.expect("capture");

    let controller = ActionController::with_default_actions(&[]);
    let result = controller
        .execute(
            &webpilot::types::ActionModel {
                name: "click_element".into(),
                params: std::collections::HashMap::from([(
                    "index".to_string(),
                    json!(7),
                )]),
            },
            browser,
        )
        .await;

    assert!(
        result
            .error
            .as_deref()
            .unwrap()
            .contains("Element with index 7 does not exist")
    );
    assert!(driver.clicks.lock().unwrap().is_empty());
}

// Scenario D: the model declares done on step one; the loop stops after
// exactly one step and the browser is closed exactly once.
#[tokio::test(start_paused = true)]
async fn run_terminates_on_first_done() {
    let payload = discovery_payload(vec![element_json("only", 0.0, 0.0, 50.0, 20.0)]);
    let driver = Arc::new(MockDriver::new(payload));
    let agent = make_agent(driver.clone(), ScriptedProvider::new(vec![done_response()]));

    let output = agent
        .run(RunOptions {
            prompt: Some("finish immediately".into()),
            max_steps: Some(20),
            ..RunOptions::default()
        })
        .await
        .expect("run succeeds");

    assert_eq!(output.step_count, 1);
    assert!(output.result.is_done);
    assert_eq!(output.result.content.as_deref(), Some("finished"));
    assert!(output.storage_state.is_some());
    assert!(output.trace_id.is_some());
    assert_eq!(*driver.close_calls.lock().unwrap(), 1);
}

// A two-step run: click, then done. The click lands on the element center.
#[tokio::test(start_paused = true)]
async fn run_executes_actions_between_steps() {
    let payload = discovery_payload(vec![element_json("only", 0.0, 0.0, 50.0, 20.0)]);
    let driver = Arc::new(MockDriver::new(payload));
    let agent = make_agent(
        driver.clone(),
        ScriptedProvider::new(vec![&click_response(0), done_response()]),
    );

    let output = agent
        .run(RunOptions {
            prompt: Some("click the button then stop".into()),
            ..RunOptions::default()
        })
        .await
        .expect("run succeeds");

    assert_eq!(output.step_count, 2);
    assert_eq!(*driver.clicks.lock().unwrap(), vec![(25.0, 10.0)]);
}

// Scenario E: a per-step timeout shorter than a deliberately slow step yields
// exactly one timeout chunk and no final output in the same invocation.
#[tokio::test(start_paused = true)]
async fn stream_yields_single_timeout_chunk() {
    let payload = discovery_payload(vec![element_json("only", 0.0, 0.0, 50.0, 20.0)]);
    let mut driver = MockDriver::new(payload);
    driver.evaluate_delay = Some(Duration::from_secs(3600));
    let driver = Arc::new(driver);
    let agent = make_agent(driver.clone(), ScriptedProvider::new(vec![done_response()]));

    let stream = agent.run_stream(RunOptions {
        prompt: Some("slow page".into()),
        step_timeout: Some(Duration::from_secs(5)),
        ..RunOptions::default()
    });

    let chunks: Vec<AgentStreamChunk> = stream.collect().await;
    assert_eq!(chunks.len(), 1);
    match &chunks[0] {
        AgentStreamChunk::StepTimeout(content) => {
            assert_eq!(content.step, 0);
            assert!(!content.agent_state.messages.is_empty());
        }
        other => panic!("expected a timeout chunk, got {other:?}"),
    }

    // The timeout branch leaves the browser open for resumption.
    assert_eq!(*driver.close_calls.lock().unwrap(), 0);
}

// Streaming happy path: one step chunk per step, then a single final output.
#[tokio::test(start_paused = true)]
async fn stream_ends_with_exactly_one_final_output() {
    let payload = discovery_payload(vec![element_json("only", 0.0, 0.0, 50.0, 20.0)]);
    let driver = Arc::new(MockDriver::new(payload));
    let agent = make_agent(
        driver.clone(),
        ScriptedProvider::new(vec![&click_response(0), done_response()]),
    );

    let stream = agent.run_stream(RunOptions {
        prompt: Some("two steps".into()),
        ..RunOptions::default()
    });
    let chunks: Vec<AgentStreamChunk> = stream.collect().await;

    let step_chunks = chunks
        .iter()
        .filter(|chunk| matches!(chunk, AgentStreamChunk::Step(_)))
        .count();
    let final_chunks: Vec<_> = chunks
        .iter()
        .filter_map(|chunk| match chunk {
            AgentStreamChunk::FinalOutput(output) => Some(output),
            _ => None,
        })
        .collect();

    assert_eq!(step_chunks, 2);
    assert_eq!(final_chunks.len(), 1);
    assert_eq!(final_chunks[0].step_count, 2);
    assert_eq!(*driver.close_calls.lock().unwrap(), 1);
}

// Resume: state serialized at timeout round-trips through JSON and drives a
// later run to completion without a fresh prompt.
#[tokio::test(start_paused = true)]
async fn resume_from_serialized_state() {
    let payload = discovery_payload(vec![element_json("only", 0.0, 0.0, 50.0, 20.0)]);

    let slow = {
        let mut driver = MockDriver::new(payload.clone());
        driver.evaluate_delay = Some(Duration::from_secs(3600));
        Arc::new(driver)
    };
    let agent = make_agent(slow, ScriptedProvider::new(vec![done_response()]));
    let chunks: Vec<AgentStreamChunk> = agent
        .run_stream(RunOptions {
            prompt: Some("slow task".into()),
            step_timeout: Some(Duration::from_secs(1)),
            ..RunOptions::default()
        })
        .collect()
        .await;

    let state = match &chunks[0] {
        AgentStreamChunk::StepTimeout(content) => content.agent_state.clone(),
        other => panic!("expected timeout, got {other:?}"),
    };

    let serialized = serde_json::to_string(&state).expect("serialize state");
    let restored: AgentState = serde_json::from_str(&serialized).expect("deserialize state");

    let driver = Arc::new(MockDriver::new(payload));
    let resumed = make_agent(driver, ScriptedProvider::new(vec![done_response()]));
    let output = resumed
        .run(RunOptions {
            resume_state: Some(restored),
            prev_step: 1,
            ..RunOptions::default()
        })
        .await
        .expect("resumed run succeeds");

    assert!(output.result.is_done);
    assert_eq!(output.step_count, 2);
}

// Setup without a prompt or resume state is a fatal error.
#[tokio::test(start_paused = true)]
async fn setup_requires_prompt_or_resume_state() {
    let payload = discovery_payload(Vec::new());
    let agent = make_agent(
        Arc::new(MockDriver::new(payload)),
        ScriptedProvider::new(vec![done_response()]),
    );

    let err = agent
        .run(RunOptions::default())
        .await
        .expect_err("setup should fail");
    assert!(matches!(err, AgentError::Setup(_)));
}

// A persistently malformed model response aborts the run after the bounded
// per-step retries, and the rolled-back state messages do not accumulate.
#[tokio::test(start_paused = true)]
async fn malformed_output_retries_then_aborts() {
    let payload = discovery_payload(vec![element_json("only", 0.0, 0.0, 50.0, 20.0)]);
    let driver = Arc::new(MockDriver::new(payload));
    let provider = ScriptedProvider::new(vec!["this is not json at all"]);
    let agent = make_agent(driver.clone(), provider);

    let err = agent
        .run(RunOptions {
            prompt: Some("doomed".into()),
            ..RunOptions::default()
        })
        .await
        .expect_err("run should abort");

    assert!(matches!(err, AgentError::OutputParse(_)));
    // Teardown still happened exactly once.
    assert_eq!(*driver.close_calls.lock().unwrap(), 1);
}

// An unknown action chosen by the model is a recoverable step: the error is
// fed back and the next response can finish the task.
#[tokio::test(start_paused = true)]
async fn unknown_action_is_recoverable() {
    let payload = discovery_payload(vec![element_json("only", 0.0, 0.0, 50.0, 20.0)]);
    let driver = Arc::new(MockDriver::new(payload));
    let unknown = r#"<output>{ "thought": "try something odd", "action": { "name": "warp_drive", "params": {} }, "summary": "Warping" }</output>"#;
    let agent = make_agent(
        driver,
        ScriptedProvider::new(vec![unknown, done_response()]),
    );

    let output = agent
        .run(RunOptions {
            prompt: Some("recover from a bad action".into()),
            ..RunOptions::default()
        })
        .await
        .expect("run succeeds");

    assert_eq!(output.step_count, 2);
    assert!(output.result.is_done);
}
