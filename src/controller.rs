//! Action registry and dispatch.
//!
//! Actions are registered with an explicit declarative descriptor (name,
//! description, parameter schema, browser dependency) and a handler returning
//! the canonical [`ActionResult`]. Dispatch never propagates a failure across
//! its boundary: unknown names, handler errors, and handler panics all become
//! error-carrying results so a single bad action cannot abort the run loop.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use crate::browser::{Browser, BrowserDriverError};
use crate::types::{ActionModel, ActionResult};

mod default_actions;

pub use default_actions::register_default_actions;

/// One declared parameter of an action, surfaced verbatim in the action
/// catalog shown to the model.
#[derive(Debug, Clone)]
pub struct ActionParam {
    pub name: &'static str,
    pub description: &'static str,
    pub required: bool,
}

pub const fn param(name: &'static str, description: &'static str) -> ActionParam {
    ActionParam {
        name,
        description,
        required: true,
    }
}

pub const fn optional_param(name: &'static str, description: &'static str) -> ActionParam {
    ActionParam {
        name,
        description,
        required: false,
    }
}

/// Declarative description of a registered action.
#[derive(Debug, Clone)]
pub struct ActionDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ActionParam>,
    /// Whether the handler receives the browser session in its context.
    pub needs_browser: bool,
}

/// Failure inside an action handler. Converted to `ActionResult::error` at
/// the dispatch boundary, never propagated.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("missing required parameter `{0}`")]
    MissingParam(&'static str),
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParam { name: &'static str, reason: String },
    #[error("action requires a browser but none was provided")]
    NoBrowser,
    #[error("no browser state captured yet")]
    NoState,
    #[error(transparent)]
    Browser(#[from] BrowserDriverError),
    #[error("{0}")]
    Other(String),
}

/// Execution context handed to a handler: the model-supplied parameters and,
/// when declared, the browser session.
pub struct ActionContext {
    pub params: HashMap<String, Value>,
    pub browser: Option<Arc<Browser>>,
}

impl ActionContext {
    pub fn browser(&self) -> Result<Arc<Browser>, ActionError> {
        self.browser.clone().ok_or(ActionError::NoBrowser)
    }

    pub fn require_str(&self, name: &'static str) -> Result<String, ActionError> {
        match self.params.get(name) {
            Some(Value::String(value)) => Ok(value.clone()),
            Some(other) => Ok(other.to_string()),
            None => Err(ActionError::MissingParam(name)),
        }
    }

    pub fn opt_bool(&self, name: &'static str, default: bool) -> bool {
        match self.params.get(name) {
            Some(Value::Bool(value)) => *value,
            Some(Value::String(value)) => matches!(value.as_str(), "true" | "1"),
            _ => default,
        }
    }
}

type HandlerFuture = BoxFuture<'static, Result<ActionResult, ActionError>>;

/// Boxed async handler; the context is moved in so the future is `'static`.
pub type ActionHandler = Arc<dyn Fn(ActionContext) -> HandlerFuture + Send + Sync>;

struct RegisteredAction {
    descriptor: ActionDescriptor,
    handler: ActionHandler,
}

/// Name-to-handler registry with never-throws dispatch.
pub struct ActionController {
    actions: Vec<RegisteredAction>,
}

impl ActionController {
    /// Empty registry; use [`ActionController::with_default_actions`] for the
    /// built-in catalog.
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
        }
    }

    /// Registry pre-populated with the built-in actions, minus any name in
    /// `exclude`.
    pub fn with_default_actions(exclude: &[&str]) -> Self {
        let mut controller = Self::new();
        register_default_actions(&mut controller);
        controller
            .actions
            .retain(|action| !exclude.contains(&action.descriptor.name));
        controller
    }

    /// Register an action. Idempotent: re-registering a name replaces the
    /// previous entry instead of duplicating it.
    pub fn register(&mut self, descriptor: ActionDescriptor, handler: ActionHandler) {
        if let Some(existing) = self
            .actions
            .iter_mut()
            .find(|action| action.descriptor.name == descriptor.name)
        {
            existing.descriptor = descriptor;
            existing.handler = handler;
        } else {
            self.actions.push(RegisteredAction {
                descriptor,
                handler,
            });
        }
    }

    pub fn has_action(&self, name: &str) -> bool {
        self.actions
            .iter()
            .any(|action| action.descriptor.name == name)
    }

    /// Human-readable catalog of every registered action, embedded into the
    /// system prompt.
    pub fn action_descriptions(&self) -> String {
        self.actions
            .iter()
            .map(|action| {
                let descriptor = &action.descriptor;
                let param_names = descriptor
                    .params
                    .iter()
                    .map(|param| param.name)
                    .collect::<Vec<_>>()
                    .join(", ");
                let mut entry = format!("{}({}): {}", descriptor.name, param_names, descriptor.description);
                for param in &descriptor.params {
                    let requirement = if param.required { "required" } else { "optional" };
                    entry.push_str(&format!(
                        "\n  - {} ({}): {}",
                        param.name, requirement, param.description
                    ));
                }
                entry
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Execute one action against the browser, normalizing every outcome
    /// into an [`ActionResult`]. This function does not fail.
    pub async fn execute(&self, action: &ActionModel, browser: Arc<Browser>) -> ActionResult {
        let Some(registered) = self
            .actions
            .iter()
            .find(|registered| registered.descriptor.name == action.name)
        else {
            return ActionResult::error(format!("Action {} not found", action.name));
        };

        let context = ActionContext {
            params: action.params.clone(),
            browser: registered.descriptor.needs_browser.then_some(browser),
        };

        let future = (registered.handler)(context);
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => ActionResult::error(err.to_string()),
            Err(_) => ActionResult::error(format!("Action {} panicked", action.name)),
        }
    }
}

impl Default for ActionController {
    fn default() -> Self {
        Self::with_default_actions(&[])
    }
}

/// Strip non-digit characters from a model-supplied index and parse it.
/// Mirrors the tolerance for outputs like `"[12]"` or `"index 3"`.
pub(crate) fn sanitize_index(value: Option<&Value>) -> Option<usize> {
    let raw = match value? {
        Value::Number(number) => return number.as_u64().map(|n| n as usize),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Verbosity;
    use crate::logging::AgentLogger;
    use serde_json::json;

    fn test_browser() -> Arc<Browser> {
        // Dispatch tests never reach the driver; the default catalog's
        // handlers that would are not invoked here.
        struct NoopDriver;

        #[async_trait::async_trait]
        impl crate::browser::BrowserDriver for NoopDriver {
            async fn launch(
                &self,
                _plan: &crate::browser::LaunchPlan,
            ) -> Result<(), BrowserDriverError> {
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
                Ok("about:blank".into())
            }
            async fn list_tabs(
                &self,
            ) -> Result<Vec<crate::types::TabInfo>, BrowserDriverError> {
                Ok(Vec::new())
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
                Ok(Value::Null)
            }
            async fn screenshot_cdp(&self) -> Result<String, BrowserDriverError> {
                Err(BrowserDriverError::Unsupported("test driver"))
            }
            async fn screenshot(&self) -> Result<String, BrowserDriverError> {
                Err(BrowserDriverError::Unsupported("test driver"))
            }
            async fn wait_for_load(
                &self,
                _phase: crate::browser::LoadPhase,
                _timeout: std::time::Duration,
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

        Arc::new(Browser::new(
            Arc::new(NoopDriver),
            None,
            Arc::new(AgentLogger::new(Verbosity::Minimal)),
        ))
    }

    fn action(name: &str, params: Value) -> ActionModel {
        ActionModel {
            name: name.to_string(),
            params: serde_json::from_value(params).expect("params map"),
        }
    }

    #[tokio::test]
    async fn unknown_action_returns_error_result() {
        let controller = ActionController::with_default_actions(&[]);
        let result = controller
            .execute(&action("warp_drive", json!({})), test_browser())
            .await;
        assert_eq!(
            result.error.as_deref(),
            Some("Action warp_drive not found")
        );
    }

    #[tokio::test]
    async fn handler_error_becomes_error_result() {
        let mut controller = ActionController::new();
        controller.register(
            ActionDescriptor {
                name: "explode",
                description: "always fails",
                params: Vec::new(),
                needs_browser: false,
            },
            Arc::new(|_ctx| {
                Box::pin(async { Err(ActionError::Other("kaboom".into())) })
            }),
        );

        let result = controller
            .execute(&action("explode", json!({})), test_browser())
            .await;
        assert_eq!(result.error.as_deref(), Some("kaboom"));
    }

    #[tokio::test]
    async fn handler_panic_becomes_error_result() {
        let mut controller = ActionController::new();
        controller.register(
            ActionDescriptor {
                name: "panic",
                description: "always panics",
                params: Vec::new(),
                needs_browser: false,
            },
            Arc::new(|_ctx| Box::pin(async { panic!("unexpected") })),
        );

        let result = controller
            .execute(&action("panic", json!({})), test_browser())
            .await;
        assert!(result.error.as_deref().unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn registration_is_idempotent() {
        let mut controller = ActionController::new();
        let descriptor = || ActionDescriptor {
            name: "noop",
            description: "does nothing",
            params: Vec::new(),
            needs_browser: false,
        };
        controller.register(
            descriptor(),
            Arc::new(|_ctx| Box::pin(async { Ok(ActionResult::content("first")) })),
        );
        controller.register(
            descriptor(),
            Arc::new(|_ctx| Box::pin(async { Ok(ActionResult::content("second")) })),
        );

        assert_eq!(controller.actions.len(), 1);
        let result = controller
            .execute(&action("noop", json!({})), test_browser())
            .await;
        assert_eq!(result.content.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn exclusion_list_suppresses_builtins() {
        let controller = ActionController::with_default_actions(&["search_google"]);
        assert!(!controller.has_action("search_google"));
        assert!(controller.has_action("click_element"));

        let result = controller
            .execute(
                &action("search_google", json!({ "query": "ducks" })),
                test_browser(),
            )
            .await;
        assert!(result.error.as_deref().unwrap().contains("not found"));
    }

    #[test]
    fn action_descriptions_include_parameter_docs() {
        let controller = ActionController::with_default_actions(&[]);
        let catalog = controller.action_descriptions();
        assert!(catalog.contains("click_element("));
        assert!(catalog.contains("- index (required)"));
        assert!(catalog.contains("wait_after_click"));
    }

    #[test]
    fn index_sanitization() {
        assert_eq!(sanitize_index(Some(&json!(7))), Some(7));
        assert_eq!(sanitize_index(Some(&json!("[12]"))), Some(12));
        assert_eq!(sanitize_index(Some(&json!("index 3"))), Some(3));
        assert_eq!(sanitize_index(Some(&json!("abc"))), None);
        assert_eq!(sanitize_index(None), None);
    }
}
