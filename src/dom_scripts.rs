//! Embedded page-context scripts.
//!
//! The element-discovery bundle lives in its own `.js` file so editors can
//! offer proper syntax highlighting while the crate bundles it as a string at
//! compile time. The script is a black box to the rest of the system: it
//! returns `{viewport, elements}` as a single JSON-serializable value.

/// Embedded contents of `scripts/element_discovery.js`.
pub const ELEMENT_DISCOVERY_SCRIPT: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/scripts/element_discovery.js"
));

/// Return the embedded element-discovery script.
///
/// Provided as a function so tests can swap in truncated fixtures while the
/// default implementation exposes the constant slice.
pub fn element_discovery_script() -> &'static str {
    ELEMENT_DISCOVERY_SCRIPT
}

/// Init script applied once per browsing context to mask the most common
/// automation-detection signals before any page script runs.
pub const INIT_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
window.chrome = window.chrome || { runtime: {} };
Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
"#;
