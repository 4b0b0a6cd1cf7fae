//! Built-in browser actions.
//!
//! Each action is a single browser-effecting operation with its own
//! micro-contract: it returns either a success content string or an error
//! string, never both. Element-addressed actions resolve the model-supplied
//! index against the current snapshot and fail softly when it is stale.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::sleep;

use crate::browser::{Browser, LoadPhase};
use crate::types::{ActionResult, BrowserState, InteractiveElement};

use super::{
    ActionContext, ActionController, ActionDescriptor, ActionError, optional_param, param,
    sanitize_index,
};

const SETTLE_SHORT: Duration = Duration::from_millis(100);
const SETTLE_AFTER_CLICK: Duration = Duration::from_secs(1);
const SETTLE_AFTER_SUBMIT: Duration = Duration::from_secs(2);

/// Register the full built-in catalog on the provided controller.
pub fn register_default_actions(controller: &mut ActionController) {
    controller.register(
        ActionDescriptor {
            name: "done",
            description: "Complete the task. Use when the task is fully finished; include all requested information in `text`.",
            params: vec![param("text", "Final answer for the user, with source links where relevant.")],
            needs_browser: false,
        },
        Arc::new(|ctx| {
            Box::pin(async move {
                let text = ctx.require_str("text")?;
                Ok(ActionResult::done(text))
            })
        }),
    );

    controller.register(
        ActionDescriptor {
            name: "give_human_control",
            description: "Give the human control of the browser. Use when the task needs user information (names, logins, payment or booking details) or an unsolvable CAPTCHA.",
            params: vec![param("message", "Explanation of why human intervention is needed.")],
            needs_browser: false,
        },
        Arc::new(|ctx| {
            Box::pin(async move {
                let message = ctx.require_str("message")?;
                Ok(ActionResult {
                    is_done: true,
                    give_control: true,
                    content: Some(message),
                    error: None,
                })
            })
        }),
    );

    controller.register(
        ActionDescriptor {
            name: "search_google",
            description: "Open a Google search for the query in the current tab.",
            params: vec![param("query", "Search query.")],
            needs_browser: true,
        },
        Arc::new(|ctx| {
            Box::pin(async move {
                let query = ctx.require_str("query")?;
                let browser = ctx.browser()?;
                let driver = browser.driver();
                let url = format!("https://www.google.com/search?q={}&udm=14", query);
                driver.navigate(&url).await?;
                let _ = driver
                    .wait_for_load(LoadPhase::Load, Duration::from_secs(15))
                    .await;
                Ok(ActionResult::content(format!(
                    "Searched for '{query}' in Google"
                )))
            })
        }),
    );

    controller.register(
        ActionDescriptor {
            name: "go_to_url",
            description: "Navigate to a URL in the current tab.",
            params: vec![param("url", "Absolute URL to open.")],
            needs_browser: true,
        },
        Arc::new(|ctx| {
            Box::pin(async move {
                let url = ctx.require_str("url")?;
                let browser = ctx.browser()?;
                let driver = browser.driver();

                // Navigation during redirects is flaky; retry with backoff.
                let mut delay = Duration::from_secs(1);
                let mut last_err = None;
                for attempt in 1..=3u32 {
                    match driver.navigate(&url).await {
                        Ok(()) => {
                            sleep(SETTLE_AFTER_SUBMIT).await;
                            return Ok(ActionResult::content(format!("Navigated to {url}")));
                        }
                        Err(err) => {
                            last_err = Some(err);
                            if attempt < 3 {
                                sleep(delay).await;
                                delay *= 2;
                            }
                        }
                    }
                }
                Err(ActionError::Browser(last_err.expect("error set on failure")))
            })
        }),
    );

    controller.register(
        ActionDescriptor {
            name: "go_back_to_previous_page",
            description: "Go back to the previous page in the current tab's history.",
            params: Vec::new(),
            needs_browser: true,
        },
        Arc::new(|ctx| {
            Box::pin(async move {
                let browser = ctx.browser()?;
                browser.driver().go_back().await?;
                sleep(SETTLE_AFTER_CLICK).await;
                Ok(ActionResult::content("Navigated back to the previous page"))
            })
        }),
    );

    controller.register(
        ActionDescriptor {
            name: "click_element",
            description: "Click on the element with the given index. Prefer enter_text_into_element when you need to type into an element.",
            params: vec![
                param("index", "Index of the element to click."),
                optional_param(
                    "wait_after_click",
                    "Wait one second after the click; use when the click triggers loading or navigation.",
                ),
            ],
            needs_browser: true,
        },
        Arc::new(|ctx| Box::pin(async move { click_element(ctx).await })),
    );

    controller.register(
        ActionDescriptor {
            name: "click_spreadsheet_cell",
            description: "Click a spreadsheet cell addressed by its row and column labels, e.g. row \"3\" column \"B\". Only available on spreadsheet pages.",
            params: vec![
                param("row", "Row label, e.g. \"3\"."),
                param("column", "Column label, e.g. \"B\"."),
            ],
            needs_browser: true,
        },
        Arc::new(|ctx| Box::pin(async move { click_spreadsheet_cell(ctx).await })),
    );

    controller.register(
        ActionDescriptor {
            name: "wait_for_page_to_load",
            description: "Wait for the page to finish loading. Use when the clean screenshot shows empty content or skeleton placeholders.",
            params: Vec::new(),
            needs_browser: true,
        },
        Arc::new(|ctx| {
            Box::pin(async move {
                let browser = ctx.browser()?;
                let driver = browser.driver();
                driver
                    .wait_for_load(LoadPhase::DomContentLoaded, Duration::from_secs(10))
                    .await?;
                let _ = driver
                    .wait_for_load(LoadPhase::Load, Duration::from_secs(10))
                    .await;
                // Network idle is best-effort; a busy page should not fail the step.
                let _ = driver
                    .wait_for_load(LoadPhase::NetworkIdle, Duration::from_secs(5))
                    .await;
                Ok(ActionResult::content("Waited for page to load"))
            })
        }),
    );

    controller.register(
        ActionDescriptor {
            name: "enter_text_into_element",
            description: "Enter text into an input element, replacing its current contents. Works with <input>, <textarea>, and contenteditable elements.",
            params: vec![
                param("index", "Index of the input element."),
                param("text", "Text to enter."),
                optional_param("press_enter", "Press Enter after typing to submit."),
            ],
            needs_browser: true,
        },
        Arc::new(|ctx| Box::pin(async move { enter_text_into_element(ctx).await })),
    );

    controller.register(
        ActionDescriptor {
            name: "switch_tab",
            description: "Switch to the open tab with the given id.",
            params: vec![param("page_id", "Tab id from the open-tabs listing.")],
            needs_browser: true,
        },
        Arc::new(|ctx| {
            Box::pin(async move {
                let page_id = sanitize_index(ctx.params.get("page_id"))
                    .ok_or(ActionError::MissingParam("page_id"))?;
                let browser = ctx.browser()?;
                browser.driver().switch_tab(page_id).await?;
                sleep(Duration::from_millis(500)).await;
                Ok(ActionResult::content(format!("Switched to tab {page_id}")))
            })
        }),
    );

    controller.register(
        ActionDescriptor {
            name: "open_tab",
            description: "Open a URL in a new tab and switch to it.",
            params: vec![param("url", "URL to open.")],
            needs_browser: true,
        },
        Arc::new(|ctx| {
            Box::pin(async move {
                let url = ctx.require_str("url")?;
                let browser = ctx.browser()?;
                browser.driver().new_tab(Some(&url)).await?;
                Ok(ActionResult::content(format!("Opened new tab with {url}")))
            })
        }),
    );

    controller.register(
        ActionDescriptor {
            name: "close_tab",
            description: "Close the current tab and switch to the previous one.",
            params: Vec::new(),
            needs_browser: true,
        },
        Arc::new(|ctx| {
            Box::pin(async move {
                let browser = ctx.browser()?;
                browser.driver().close_current_tab().await?;
                Ok(ActionResult::content("Closed the current tab"))
            })
        }),
    );

    controller.register(
        ActionDescriptor {
            name: "scroll_page_down",
            description: "Scroll the entire page down by one viewport. Don't use this to scroll inside a scrollable region.",
            params: Vec::new(),
            needs_browser: true,
        },
        Arc::new(|ctx| Box::pin(async move { scroll_page(ctx, 1.0).await })),
    );

    controller.register(
        ActionDescriptor {
            name: "scroll_page_up",
            description: "Scroll the entire page up by one viewport. Don't use this to scroll inside a scrollable region.",
            params: Vec::new(),
            needs_browser: true,
        },
        Arc::new(|ctx| Box::pin(async move { scroll_page(ctx, -1.0).await })),
    );

    controller.register(
        ActionDescriptor {
            name: "scroll_down_over_element",
            description: "Move the mouse to the element with the given index, located inside a scrollable region, then scroll the wheel down.",
            params: vec![param("index", "Index of an element inside the scrollable region.")],
            needs_browser: true,
        },
        Arc::new(|ctx| Box::pin(async move { scroll_over_element(ctx, 1.0).await })),
    );

    controller.register(
        ActionDescriptor {
            name: "scroll_up_over_element",
            description: "Move the mouse to the element with the given index, located inside a scrollable region, then scroll the wheel up.",
            params: vec![param("index", "Index of an element inside the scrollable region.")],
            needs_browser: true,
        },
        Arc::new(|ctx| Box::pin(async move { scroll_over_element(ctx, -1.0).await })),
    );

    controller.register(
        ActionDescriptor {
            name: "press_enter",
            description: "Press the Enter key. Use to submit a form when no explicit submit control exists.",
            params: Vec::new(),
            needs_browser: true,
        },
        Arc::new(|ctx| {
            Box::pin(async move {
                let browser = ctx.browser()?;
                browser.driver().press_key("Enter").await?;
                Ok(ActionResult::content("Pressed enter key"))
            })
        }),
    );

    controller.register(
        ActionDescriptor {
            name: "clear_text_in_element",
            description: "Remove all text in the element with the given index.",
            params: vec![param("index", "Index of the element to clear.")],
            needs_browser: true,
        },
        Arc::new(|ctx| {
            Box::pin(async move {
                let browser = ctx.browser()?;
                let state = current_state(&browser).await?;
                let element = lookup_element(&state, &ctx)?.clone();
                let driver = browser.driver();

                driver.mouse_move(element.center.x, element.center.y).await?;
                driver.mouse_click(element.center.x, element.center.y).await?;
                sleep(SETTLE_SHORT).await;
                driver.press_key("Control+a").await?;
                sleep(SETTLE_SHORT).await;
                driver.press_key("Backspace").await?;
                Ok(ActionResult::content("Removed all text in the element"))
            })
        }),
    );

    controller.register(
        ActionDescriptor {
            name: "get_select_options",
            description: "List all options of a <select> element. Use before select_dropdown_option.",
            params: vec![param("index", "Index of the select element.")],
            needs_browser: true,
        },
        Arc::new(|ctx| Box::pin(async move { get_select_options(ctx).await })),
    );

    controller.register(
        ActionDescriptor {
            name: "select_dropdown_option",
            description: "Select an option of a <select> element by the option's visible text. Use after get_select_options.",
            params: vec![
                param("index", "Index of the select element."),
                param("option", "Exact visible text of the option to select."),
            ],
            needs_browser: true,
        },
        Arc::new(|ctx| Box::pin(async move { select_dropdown_option(ctx).await })),
    );
}

async fn current_state(browser: &Browser) -> Result<BrowserState, ActionError> {
    browser.state().await.ok_or(ActionError::NoState)
}

fn lookup_element<'state>(
    state: &'state BrowserState,
    ctx: &ActionContext,
) -> Result<&'state InteractiveElement, ActionError> {
    let index = sanitize_index(ctx.params.get("index")).ok_or_else(|| ActionError::InvalidParam {
        name: "index",
        reason: "`index` should be a valid number".to_string(),
    })?;

    state.interactive_elements.get(&index).ok_or_else(|| {
        ActionError::Other(format!(
            "Element with index {index} does not exist - retry or use alternative actions"
        ))
    })
}

async fn click_element(ctx: ActionContext) -> Result<ActionResult, ActionError> {
    let browser = ctx.browser()?;
    let state = current_state(&browser).await?;
    let element = lookup_element(&state, &ctx)?.clone();
    let wait_after_click = ctx.opt_bool("wait_after_click", false);
    let driver = browser.driver();

    let tabs_before = driver.list_tabs().await.map(|tabs| tabs.len()).unwrap_or(0);

    // Precise coordinate click first, then selector-based, then a scripted
    // click by the stable element id. Each fallback only runs when the
    // previous strategy errored.
    let coordinate_click = async {
        driver.mouse_move(element.center.x, element.center.y).await?;
        sleep(SETTLE_SHORT).await;
        driver.mouse_click(element.center.x, element.center.y).await
    };

    if let Err(first_err) = coordinate_click.await {
        let selector_script = format!(
            "(() => {{ const el = document.querySelector('[data-agent-id={:?}]'); if (!el) return false; el.click(); return true; }})()",
            element.source_id
        );
        let clicked = driver
            .evaluate(&selector_script)
            .await
            .map(|value| value.as_bool().unwrap_or(false));

        if !matches!(clicked, Ok(true)) {
            let deep_script = format!(
                "(() => {{
                    const id = {:?};
                    function find(root) {{
                        const el = root.querySelector('[data-agent-id=' + JSON.stringify(id) + ']');
                        if (el) return el;
                        for (const frame of root.querySelectorAll('iframe')) {{
                            try {{
                                const inner = find(frame.contentDocument);
                                if (inner) return inner;
                            }} catch (e) {{ /* cross-origin */ }}
                        }}
                        return null;
                    }}
                    const el = find(document);
                    if (!el) return false;
                    el.click();
                    return true;
                }})()",
                element.source_id
            );
            let deep_clicked = driver
                .evaluate(&deep_script)
                .await
                .map(|value| value.as_bool().unwrap_or(false));
            if !matches!(deep_clicked, Ok(true)) {
                return Err(ActionError::Browser(first_err));
            }
        }
    }

    let mut message = format!(
        "Clicked element with index {}: <{}></{}>",
        element.index, element.tag_name, element.tag_name
    );

    if let Ok(tabs_after) = driver.list_tabs().await {
        if tabs_after.len() > tabs_before {
            driver.switch_tab(tabs_after.len() - 1).await?;
            message.push_str(" - New tab opened - switching to it");
        }
    }

    if wait_after_click {
        sleep(SETTLE_AFTER_CLICK).await;
    }

    Ok(ActionResult::content(message))
}

async fn click_spreadsheet_cell(ctx: ActionContext) -> Result<ActionResult, ActionError> {
    let row = ctx.require_str("row")?;
    let column = ctx.require_str("column")?;
    let browser = ctx.browser()?;
    let state = current_state(&browser).await?;

    let row_id = format!("row_{row}");
    let column_id = format!("column_{column}");
    let row_element = state
        .interactive_elements
        .values()
        .find(|element| element.source_id == row_id)
        .ok_or_else(|| ActionError::Other(format!("Row {row} is not visible in the grid")))?;
    let column_element = state
        .interactive_elements
        .values()
        .find(|element| element.source_id == column_id)
        .ok_or_else(|| ActionError::Other(format!("Column {column} is not visible in the grid")))?;

    // The cell sits at the intersection of the row header's y and the column
    // header's x.
    let x = column_element.center.x;
    let y = row_element.center.y;
    let driver = browser.driver();
    driver.mouse_move(x, y).await?;
    sleep(SETTLE_SHORT).await;
    driver.mouse_click(x, y).await?;

    Ok(ActionResult::content(format!(
        "Clicked spreadsheet cell at row {row}, column {column}"
    )))
}

async fn enter_text_into_element(ctx: ActionContext) -> Result<ActionResult, ActionError> {
    let text = ctx.require_str("text")?;
    let press_enter = ctx.opt_bool("press_enter", false);
    let browser = ctx.browser()?;
    let state = current_state(&browser).await?;
    let element = lookup_element(&state, &ctx)?.clone();

    let is_contenteditable = matches!(
        element.attributes.get("contenteditable").map(String::as_str),
        Some("true") | Some("")
    );
    if !matches!(element.tag_name.as_str(), "input" | "textarea") && !is_contenteditable {
        return Ok(ActionResult::error(format!(
            "Element {} is not a text input element. It's a {} element.",
            element.index, element.tag_name
        )));
    }

    const TEXT_INPUT_TYPES: [&str; 6] = ["text", "password", "email", "search", "tel", "url"];
    if element.tag_name == "input" {
        if let Some(input_type) = &element.input_type {
            if !TEXT_INPUT_TYPES.contains(&input_type.as_str()) {
                return Ok(ActionResult::error(format!(
                    "Element {} is an input with type='{input_type}', which doesn't accept text input.",
                    element.index
                )));
            }
        }
    }

    let driver = browser.driver();
    driver.mouse_move(element.center.x, element.center.y).await?;
    sleep(SETTLE_SHORT).await;
    driver.mouse_click(element.center.x, element.center.y).await?;
    sleep(SETTLE_SHORT).await;
    driver.press_key("Control+a").await?;
    sleep(SETTLE_SHORT).await;
    driver.press_key("Backspace").await?;
    sleep(SETTLE_SHORT).await;
    driver.type_text(&text).await?;

    if press_enter {
        driver.press_key("Enter").await?;
        sleep(SETTLE_AFTER_SUBMIT).await;
    }

    Ok(ActionResult::content(format!(
        "Input \"{text}\" into element with index {}",
        element.index
    )))
}

async fn scroll_page(ctx: ActionContext, direction: f64) -> Result<ActionResult, ActionError> {
    let browser = ctx.browser()?;
    let state = current_state(&browser).await?;
    let driver = browser.driver();

    driver
        .mouse_move(state.viewport.width / 2.0, state.viewport.height / 2.0)
        .await?;
    sleep(SETTLE_SHORT).await;
    driver
        .mouse_wheel(0.0, direction * state.viewport.height * 0.8)
        .await?;

    let verb = if direction > 0.0 { "down" } else { "up" };
    Ok(ActionResult::content(format!(
        "Scrolled mouse wheel {verb} (check the new state screenshot to confirm something scrolled)"
    )))
}

async fn scroll_over_element(
    ctx: ActionContext,
    direction: f64,
) -> Result<ActionResult, ActionError> {
    let browser = ctx.browser()?;
    let state = current_state(&browser).await?;
    let element = lookup_element(&state, &ctx)?.clone();
    let driver = browser.driver();

    driver.mouse_move(element.center.x, element.center.y).await?;
    sleep(SETTLE_SHORT).await;
    driver
        .mouse_wheel(0.0, direction * state.viewport.height / 3.0)
        .await?;

    let verb = if direction > 0.0 { "down" } else { "up" };
    Ok(ActionResult::content(format!(
        "Moved mouse to element with index {} and scrolled wheel {verb} (check the new state screenshot to confirm something scrolled)",
        element.index
    )))
}

async fn get_select_options(ctx: ActionContext) -> Result<ActionResult, ActionError> {
    let browser = ctx.browser()?;
    let state = current_state(&browser).await?;
    let element = lookup_element(&state, &ctx)?.clone();

    if element.tag_name.to_lowercase() != "select" {
        return Ok(ActionResult::error(format!(
            "Element {} is not a select element, it's a {}",
            element.index, element.tag_name
        )));
    }

    let script = format!(
        "(() => {{
            const select = document.querySelector('[data-agent-id={:?}]');
            if (!select) return null;
            return {{
                options: Array.from(select.options).map(opt => ({{
                    text: opt.text, value: opt.value, index: opt.index
                }})),
                id: select.id,
                name: select.name
            }};
        }})()",
        element.source_id
    );

    let value = browser.driver().evaluate(&script).await?;
    let options = value
        .get("options")
        .and_then(Value::as_array)
        .ok_or_else(|| ActionError::Other("Select element not found on the page".into()))?;

    let mut lines: Vec<String> = options
        .iter()
        .map(|opt| {
            format!(
                "{}: option={}",
                opt.get("index").and_then(Value::as_i64).unwrap_or(-1),
                json!(opt.get("text").and_then(Value::as_str).unwrap_or_default())
            )
        })
        .collect();
    lines.push(
        "If you decide to use this select element, use the exact option name in select_dropdown_option"
            .to_string(),
    );

    Ok(ActionResult::content(lines.join("\n")))
}

async fn select_dropdown_option(ctx: ActionContext) -> Result<ActionResult, ActionError> {
    let option = ctx.require_str("option")?;
    let browser = ctx.browser()?;
    let state = current_state(&browser).await?;
    let element = lookup_element(&state, &ctx)?.clone();

    if element.tag_name.to_lowercase() != "select" {
        return Ok(ActionResult::error(format!(
            "Element {} is not a select element, it's a {}",
            element.index, element.tag_name
        )));
    }

    let script = format!(
        "(() => {{
            const select = document.querySelector('[data-agent-id={:?}]');
            if (!select) return {{ success: false, error: 'Select element not found' }};
            const optionText = {:?};
            for (let i = 0; i < select.options.length; i++) {{
                const opt = select.options[i];
                if (opt.text === optionText) {{
                    opt.selected = true;
                    select.dispatchEvent(new Event('change', {{ bubbles: true }}));
                    return {{ success: true, value: opt.value, index: i }};
                }}
            }}
            return {{
                success: false,
                error: 'Option not found: ' + optionText,
                availableOptions: Array.from(select.options).map(o => o.text)
            }};
        }})()",
        element.source_id, option
    );

    let value = browser.driver().evaluate(&script).await?;
    if value.get("success").and_then(Value::as_bool).unwrap_or(false) {
        Ok(ActionResult::content(format!(
            "Selected option '{option}' with value '{}' at index {}",
            value.get("value").and_then(Value::as_str).unwrap_or_default(),
            value.get("index").and_then(Value::as_i64).unwrap_or(-1)
        )))
    } else {
        let mut error = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("Unknown error")
            .to_string();
        if let Some(available) = value.get("availableOptions").and_then(Value::as_array) {
            let names: Vec<&str> = available.iter().filter_map(Value::as_str).collect();
            error.push_str(&format!(". Available options: {}", names.join(", ")));
        }
        Ok(ActionResult::error(error))
    }
}
