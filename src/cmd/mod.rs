//! The built-in command catalog.
//!
//! Parsers here implement [`crate::command::CommandParser`]; anything a
//! device can run is constructed from these through the device's per-state
//! registry. The catalog is deliberately small — it covers what the unix
//! device classes need.

use regex::Regex;

use crate::command::Params;
use crate::error::Error;

pub mod unix;

/// A permissive readiness pattern matching common shell prompts
/// (`$`, `%`, `#`, `>`, `~` at end of line).
pub fn default_prompt() -> Regex {
    Regex::new(r"[$%#>~]\s*$").expect("default prompt pattern compiles")
}

pub(crate) fn required_str(params: &Params, key: &str) -> Result<String, Error> {
    optional_str(params, key)
        .ok_or_else(|| Error::BadConfig(format!("missing required parameter `{key}`")))
}

pub(crate) fn optional_str(params: &Params, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|value| value.as_str())
        .map(Into::into)
}
