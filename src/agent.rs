//! The agent step state machine.
//!
//! One step is capture → state message → LLM call → parse → record assistant
//! turn → dispatch action. `run` drives steps to completion under a step
//! budget; `run_stream` yields per-step chunks, surfaces a resumable timeout
//! chunk, and always ends with exactly one final-output chunk unless the
//! timeout branch returned first. A malformed model response rolls back the
//! state message and retries the same step a bounded number of times before
//! the run is aborted — the same policy in both run modes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, sleep};
use tokio_stream::wrappers::ReceiverStream;

use crate::browser::{Browser, BrowserDriverError, LaunchPlan};
use crate::config::PilotConfig;
use crate::controller::ActionController;
use crate::detector::RemoteDetector;
use crate::llm::{LlmError, LlmProvider, provider_from_config};
use crate::logging::AgentLogger;
use crate::messages::{DemoImage, MessageManager};
use crate::metrics::RunMetrics;
use crate::prompts;
use crate::runtime::ChromiumoxideDriver;
use crate::snapshot::SnapshotError;
use crate::types::{
    ActionResult, AgentLlmOutput, AgentOutput, AgentState, AgentStreamChunk, StepChunkContent,
    TimeoutChunkContent,
};

/// Attempts per step when the model violates the output protocol.
const PROTOCOL_RETRY_ATTEMPTS: u32 = 3;
const PROTOCOL_RETRY_BACKOFF_MS: u64 = 500;

/// Errors surfaced by the agent loop.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("setup failed: {0}")]
    Setup(String),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Browser(#[from] BrowserDriverError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    OutputParse(#[from] OutputParseError),
}

/// A model response that does not satisfy the output contract. Hard failure
/// for the step; never silently defaulted.
#[derive(Debug, Error)]
pub enum OutputParseError {
    #[error("model output is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("model output is missing a non-empty `{0}` field")]
    MissingField(&'static str),
}

/// Per-run options for [`Agent::run`] and [`Agent::run_stream`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Task prompt for a fresh run. Exactly one of `prompt`/`resume_state`
    /// must be provided; when both are present the resume state wins.
    pub prompt: Option<String>,
    /// Serialized state from a previous run to resume from.
    pub resume_state: Option<AgentState>,
    /// Overrides the configured step budget.
    pub max_steps: Option<usize>,
    /// Step count already consumed by the run being resumed.
    pub prev_step: usize,
    /// Per-step timeout for the streaming run; overrides the configuration.
    pub step_timeout: Option<Duration>,
    /// Attach the current screenshot to every step chunk.
    pub return_screenshots: bool,
}

/// Autonomous browser-driving agent.
///
/// One logical task per instance; `step` must not be invoked concurrently on
/// the same instance (caller contract, not internally enforced).
pub struct Agent {
    config: PilotConfig,
    browser: Arc<Browser>,
    controller: ActionController,
    llm: Arc<dyn LlmProvider>,
    messages: Mutex<MessageManager>,
    metrics: Mutex<RunMetrics>,
    trace_id: Mutex<Option<String>>,
    logger: Arc<AgentLogger>,
}

impl Agent {
    pub fn new(config: PilotConfig, browser: Arc<Browser>, llm: Arc<dyn LlmProvider>) -> Self {
        Self::with_controller(config, browser, llm, ActionController::with_default_actions(&[]))
    }

    pub fn with_controller(
        config: PilotConfig,
        browser: Arc<Browser>,
        llm: Arc<dyn LlmProvider>,
        controller: ActionController,
    ) -> Self {
        let logger = Arc::new(AgentLogger::new(config.verbose));
        let token_budget = config.context_token_budget;
        Self {
            config,
            browser,
            controller,
            llm,
            messages: Mutex::new(MessageManager::new(token_budget)),
            metrics: Mutex::new(RunMetrics::default()),
            trace_id: Mutex::new(None),
            logger,
        }
    }

    /// Wire the full stack from configuration: chromiumoxide driver,
    /// optional remote detector, and the configured LLM provider.
    pub fn from_config(config: PilotConfig) -> Result<Self, AgentError> {
        let llm = provider_from_config(&config)?;
        let logger = Arc::new(AgentLogger::new(config.verbose));
        let detector = config
            .detector_endpoint
            .as_ref()
            .map(|endpoint| {
                Arc::new(RemoteDetector::new(endpoint.clone())) as Arc<dyn crate::detector::ElementDetector>
            });
        let browser = Arc::new(Browser::new(
            Arc::new(ChromiumoxideDriver::new()),
            detector,
            logger,
        ));
        Ok(Self::new(config, browser, llm))
    }

    pub async fn metrics(&self) -> RunMetrics {
        self.metrics.lock().await.clone()
    }

    async fn agent_state(&self) -> AgentState {
        AgentState {
            messages: self.messages.lock().await.messages().to_vec(),
        }
    }

    async fn trace_id(&self) -> Option<String> {
        self.trace_id.lock().await.clone()
    }

    /// Initialise the run: exactly one of fresh prompt or resume state must
    /// drive the conversation, and the browser must be up.
    async fn setup(&self, options: &RunOptions) -> Result<(), AgentError> {
        let prompt = options
            .prompt
            .as_deref()
            .map(str::trim)
            .filter(|prompt| !prompt.is_empty());

        if prompt.is_none() && options.resume_state.is_none() {
            return Err(AgentError::Setup(
                "either a task prompt or a resume state must be provided".into(),
            ));
        }

        self.browser
            .launch(&LaunchPlan::from_config(&self.config))
            .await?;

        {
            let mut trace = self.trace_id.lock().await;
            if trace.is_none() {
                *trace = Some(format!("run-{}", Utc::now().timestamp_millis()));
            }
        }

        let mut messages = self.messages.lock().await;
        if let Some(state) = &options.resume_state {
            messages.set_messages(state.messages.clone());
            self.logger.info(
                format!("resuming run with {} messages", state.messages.len()),
                Some("agent"),
                None,
            );
        } else if let Some(prompt) = prompt {
            let demos = load_demo_images(&self.config);
            messages.init_session(prompt, &self.controller.action_descriptions(), &demos);
            self.logger
                .info(format!("starting task: {prompt}"), Some("agent"), None);
        }

        Ok(())
    }

    /// One perceive → decide → act cycle.
    ///
    /// If the LLM call or output parse fails, the state message added at the
    /// start of the step is rolled back before the error propagates, so a
    /// retried step starts from a clean slate.
    async fn step(
        &self,
        previous_result: Option<&ActionResult>,
    ) -> Result<(ActionResult, String), AgentError> {
        let state = self.browser.capture_state().await?;

        let sendable = {
            let mut messages = self.messages.lock().await;
            messages.add_state_message(&state, previous_result);
            if messages.is_over_budget() {
                self.logger.info(
                    format!(
                        "context estimate {} tokens exceeds the soft budget",
                        messages.estimated_tokens()
                    ),
                    Some("agent"),
                    None,
                );
            }
            messages.sendable_messages()
        };

        let started = Instant::now();
        let response = match self.llm.call(&sendable).await {
            Ok(response) => response,
            Err(err) => {
                self.messages.lock().await.remove_last_state_message();
                return Err(err.into());
            }
        };
        self.metrics
            .lock()
            .await
            .record(&response.usage, started.elapsed().as_millis() as u64);

        let mut output = match parse_agent_output(&response.content) {
            Ok(output) => output,
            Err(err) => {
                self.messages.lock().await.remove_last_state_message();
                return Err(err.into());
            }
        };
        output.thinking_block = response.thinking.clone();

        self.messages.lock().await.add_assistant_message(&output);

        self.logger.info(
            format!("executing action {}", output.action.name),
            Some("agent"),
            Some(serde_json::json!({ "thought": output.thought })),
        );

        let result = self
            .controller
            .execute(&output.action, self.browser.clone())
            .await;
        let summary = output.summary.unwrap_or_default();
        Ok((result, summary))
    }

    /// Step with the protocol-violation retry policy applied: malformed model
    /// output retries the same step with a short backoff; any other failure
    /// propagates immediately.
    async fn execute_step(
        &self,
        previous_result: Option<&ActionResult>,
    ) -> Result<(ActionResult, String), AgentError> {
        let mut delay = Duration::from_millis(PROTOCOL_RETRY_BACKOFF_MS);
        let mut attempt = 1;
        loop {
            match self.step(previous_result).await {
                Err(AgentError::OutputParse(err)) if attempt < PROTOCOL_RETRY_ATTEMPTS => {
                    self.logger.info(
                        format!("malformed model output (attempt {attempt}): {err}; retrying step"),
                        Some("agent"),
                        None,
                    );
                    attempt += 1;
                    sleep(delay).await;
                    delay *= 2;
                }
                other => return other,
            }
        }
    }

    /// Run to completion: loop steps until the model declares the task done
    /// or the step budget is exhausted, then release the browser and return
    /// the final output. The browser is closed on every exit path.
    pub async fn run(&self, options: RunOptions) -> Result<AgentOutput, AgentError> {
        if let Err(err) = self.setup(&options).await {
            self.browser.close().await;
            return Err(err);
        }

        let max_steps = options.max_steps.unwrap_or(self.config.max_steps);
        let mut step_count = options.prev_step;
        let mut last_result: Option<ActionResult> = None;
        let mut failure: Option<AgentError> = None;

        while step_count < max_steps {
            match self.execute_step(last_result.as_ref()).await {
                Ok((result, _summary)) => {
                    step_count += 1;
                    let done = result.is_done;
                    last_result = Some(result);
                    if done {
                        break;
                    }
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        let storage_state = self.browser.storage_state().await;
        self.browser.close().await;

        if let Some(err) = failure {
            return Err(err);
        }

        Ok(AgentOutput {
            agent_state: self.agent_state().await,
            result: last_result.unwrap_or_default(),
            step_count,
            storage_state,
            trace_id: self.trace_id().await,
        })
    }

    /// Streaming run: yields one chunk per step, a single resumable timeout
    /// chunk when the per-step deadline passes (leaving the browser open for
    /// the continuation), and otherwise exactly one terminal final-output
    /// chunk. Dropping the stream stops the loop at the next step boundary.
    pub fn run_stream(self: Arc<Self>, options: RunOptions) -> ReceiverStream<AgentStreamChunk> {
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            if let Err(err) = self.setup(&options).await {
                let _ = tx
                    .send(AgentStreamChunk::StepError {
                        message: err.to_string(),
                    })
                    .await;
                self.browser.close().await;
                return;
            }

            let max_steps = options.max_steps.unwrap_or(self.config.max_steps);
            let step_timeout = options
                .step_timeout
                .or(self.config.step_timeout_secs.map(Duration::from_secs));
            let mut step_count = options.prev_step;
            let mut last_result: Option<ActionResult> = None;

            while step_count < max_steps {
                let outcome = match step_timeout {
                    Some(limit) => {
                        // The timer is observational: the step runs as its own
                        // task and keeps executing if the deadline wins; its
                        // result is simply discarded.
                        let agent = Arc::clone(&self);
                        let previous = last_result.clone();
                        let mut step_task = tokio::spawn(async move {
                            agent.execute_step(previous.as_ref()).await
                        });

                        tokio::select! {
                            joined = &mut step_task => match joined {
                                Ok(outcome) => outcome,
                                Err(join_err) => Err(AgentError::Setup(format!(
                                    "step task failed: {join_err}"
                                ))),
                            },
                            _ = sleep(limit) => {
                                let chunk = AgentStreamChunk::StepTimeout(TimeoutChunkContent {
                                    action_result: ActionResult::error(
                                        "step timed out before completing",
                                    ),
                                    summary: String::new(),
                                    step: step_count,
                                    agent_state: self.agent_state().await,
                                    trace_id: self.trace_id().await,
                                });
                                let _ = tx.send(chunk).await;
                                // Resumability hook: the browser stays open so
                                // a later run can pick up from this state.
                                return;
                            }
                        }
                    }
                    None => self.execute_step(last_result.as_ref()).await,
                };

                match outcome {
                    Ok((result, summary)) => {
                        step_count += 1;
                        let done = result.is_done;
                        let screenshot = if options.return_screenshots {
                            self.browser.state().await.map(|state| state.screenshot)
                        } else {
                            None
                        };
                        let chunk = AgentStreamChunk::Step(StepChunkContent {
                            action_result: result.clone(),
                            summary,
                            screenshot,
                            trace_id: self.trace_id().await,
                        });
                        last_result = Some(result);
                        if tx.send(chunk).await.is_err() {
                            // Consumer dropped the stream; stop cleanly.
                            self.browser.close().await;
                            return;
                        }
                        if done {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = tx
                            .send(AgentStreamChunk::StepError {
                                message: err.to_string(),
                            })
                            .await;
                        break;
                    }
                }
            }

            let storage_state = self.browser.storage_state().await;
            self.browser.close().await;

            let output = AgentOutput {
                agent_state: self.agent_state().await,
                result: last_result.unwrap_or_default(),
                step_count,
                storage_state,
                trace_id: self.trace_id().await,
            };
            let _ = tx.send(AgentStreamChunk::FinalOutput(output)).await;
        });

        ReceiverStream::new(rx)
    }
}

/// Parse the model's tagged JSON envelope into a structured output.
///
/// Null bytes are stripped, the `<output>`/`<o>` span is located (the whole
/// response is treated as JSON when no tags are present), stray inner tag
/// remnants are removed, and the required fields are validated.
pub fn parse_agent_output(raw: &str) -> Result<AgentLlmOutput, OutputParseError> {
    let cleaned: String = raw.chars().filter(|c| *c != '\0').collect();

    let mut span = cleaned.as_str();
    for (open, close) in [("<output>", "</output>"), ("<o>", "</o>")] {
        if let (Some(start), Some(end)) = (cleaned.find(open), cleaned.rfind(close)) {
            if start + open.len() <= end {
                span = &cleaned[start + open.len()..end];
                break;
            }
        }
    }

    let mut json_text = span.to_string();
    for remnant in ["<output>", "</output>", "<o>", "</o>"] {
        json_text = json_text.replace(remnant, "");
    }

    let output: AgentLlmOutput = serde_json::from_str(json_text.trim())?;

    if output.thought.trim().is_empty() {
        return Err(OutputParseError::MissingField("thought"));
    }
    if output.action.name.trim().is_empty() {
        return Err(OutputParseError::MissingField("action.name"));
    }

    Ok(output)
}

fn load_demo_images(config: &PilotConfig) -> Vec<DemoImage> {
    use base64::Engine;

    prompts::DEMO_CAPTIONS
        .iter()
        .enumerate()
        .map(|(index, caption)| {
            let image_b64 = config.demo_images_dir.as_ref().and_then(|dir| {
                let path = dir.join(format!("demo_{index}.png"));
                std::fs::read(path)
                    .ok()
                    .map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes))
            });
            DemoImage {
                caption: caption.to_string(),
                image_b64,
            }
        })
        .collect()
}
