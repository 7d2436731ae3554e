// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Symbolic command names mapped to parameterized SCPI command strings.
//!
//! Templates use named placeholders such as `{value}` or `{mark_name}`.
//! Literal braces are written as `{{` and `}}`.

use std::path::Path;

use anyhow::Context;
use indexmap::IndexMap;

use crate::error::{Error, Result};

const BUILTIN_COMMANDS: &str = include_str!("commands.json");

/// Names of the commands the analyzer operations look up.
pub mod names {
    pub const IDENTIFY: &str = "identify";
    pub const RESET: &str = "reset_spectrum";
    pub const OPERATION_COMPLETE: &str = "operation_complete_query";
    pub const SET_CENTER_FREQUENCY: &str = "set_center_frequency";
    pub const GET_CENTER_FREQUENCY: &str = "get_center_frequency";
    pub const SET_SPAN: &str = "set_span";
    pub const GET_SPAN: &str = "get_span";
    pub const SET_RBW: &str = "set_rbw";
    pub const GET_RBW: &str = "get_rbw";
    pub const SET_VBW: &str = "set_vbw";
    pub const GET_VBW: &str = "get_vbw";
    pub const SET_REF_LEVEL: &str = "set_ref_level";
    pub const GET_REF_LEVEL: &str = "get_ref_level";
    pub const SET_REF_LEVEL_OFFSET: &str = "set_ref_level_offset";
    pub const GET_REF_LEVEL_OFFSET: &str = "get_ref_level_offset";
    pub const SET_PEAK_DETECTOR: &str = "set_peak_detector";
    pub const PEAK_SEARCH: &str = "peak_search";
    pub const GET_MARKER_POWER: &str = "get_marker_power";
    pub const GET_MARKER_FREQUENCY: &str = "get_marker_frequency";
    pub const MARKER_TO_CENTER: &str = "set_marker_to_center_frequency";
    pub const SET_TRACE_MODE: &str = "set_trace_mode";
    pub const GET_TRACE_DATA: &str = "get_trace_data";
    pub const GET_SWEEP_POINTS: &str = "get_sweep_points";
    pub const TAKE_SCREENSHOT: &str = "take_screenshot";
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A named command pattern, parsed once at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    name: String,
    pattern: String,
    segments: Vec<Segment>,
}

impl CommandTemplate {
    pub fn parse(name: &str, pattern: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidTemplate {
            command: name.to_string(),
            reason,
        };
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut placeholder = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) if c.is_ascii_alphanumeric() || c == '_' => placeholder.push(c),
                            Some(c) => {
                                return Err(invalid(format!(
                                    "unexpected character {c:?} in placeholder"
                                )));
                            }
                            None => return Err(invalid("unterminated placeholder".to_string())),
                        }
                    }
                    if placeholder.is_empty() {
                        return Err(invalid("empty placeholder".to_string()));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(placeholder));
                }
                '}' => return Err(invalid("unmatched '}'".to_string())),
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(CommandTemplate {
            name: name.to_string(),
            pattern: pattern.to_string(),
            segments,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(p) => Some(p.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Substitute every placeholder. Parameters that the pattern does not use
    /// are ignored.
    pub fn render(&self, params: &[(&str, &str)]) -> Result<String> {
        let mut out = String::with_capacity(self.pattern.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(key) => {
                    let value = params
                        .iter()
                        .find_map(|(k, v)| (*k == key.as_str()).then_some(*v))
                        .ok_or_else(|| Error::MissingParameter {
                            command: self.name.clone(),
                            placeholder: key.clone(),
                        })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

/// Read-only mapping from command name to template.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    templates: IndexMap<String, CommandTemplate>,
}

impl CommandRegistry {
    /// Command set for the supported Rohde & Schwarz handheld analyzers.
    pub fn builtin() -> Result<Self> {
        Self::from_json_str(BUILTIN_COMMANDS)
    }

    /// Load a JSON object of `{"<name>": "<pattern>"}`.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let raw: IndexMap<String, String> =
            serde_json::from_str(text).context("Failed to parse command templates")?;
        Self::from_templates(raw.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read command templates from {}", path.display()))?;
        Self::from_json_str(&text)
    }

    pub fn from_templates<'a>(templates: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self> {
        let templates: IndexMap<_, _> = templates
            .into_iter()
            .map(|(name, pattern)| Ok((name.to_string(), CommandTemplate::parse(name, pattern)?)))
            .collect::<Result<_>>()?;
        Ok(CommandRegistry { templates })
    }

    pub fn get(&self, name: &str) -> Result<&CommandTemplate> {
        self.templates
            .get(name)
            .ok_or_else(|| Error::UnknownCommand(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    pub fn build(&self, name: &str, params: &[(&str, &str)]) -> Result<String> {
        self.get(name)?.render(params)
    }

    /// Fail with the first name that is not registered.
    pub fn require(&self, names: &[&str]) -> Result<()> {
        names.iter().try_for_each(|name| self.get(name).map(|_| ()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_substitutes_all_placeholders() {
        let registry = CommandRegistry::builtin().unwrap();
        let cmd = registry
            .build(names::SET_CENTER_FREQUENCY, &[("value", "918000000"), ("units", "HZ")])
            .unwrap();
        assert_eq!(cmd, "FREQ:CENT 918000000HZ");
        let cmd = registry.build(names::GET_MARKER_POWER, &[("mark_name", "MARK2")]).unwrap();
        assert_eq!(cmd, "CALC:MARK2:Y?");
    }

    #[test]
    fn test_unknown_command() {
        let registry = CommandRegistry::builtin().unwrap();
        let err = registry.build("set_frobnicator", &[]).unwrap_err();
        assert!(matches!(err, Error::UnknownCommand(name) if name == "set_frobnicator"));
        assert!(registry.require(&["identify", "nope"]).is_err());
        assert!(registry.require(&[names::PEAK_SEARCH, names::GET_SPAN]).is_ok());
    }

    #[test]
    fn test_missing_parameter() {
        let registry = CommandRegistry::builtin().unwrap();
        let err = registry.build(names::SET_SPAN, &[("value", "5")]).unwrap_err();
        assert!(matches!(
            err,
            Error::MissingParameter { placeholder, .. } if placeholder == "units"
        ));
    }

    #[test]
    fn test_escaped_braces_and_order() {
        let registry =
            CommandRegistry::from_json_str(r#"{"b": "X {{{v}}}", "a": "PLAIN"}"#).unwrap();
        assert_eq!(registry.build("b", &[("v", "1")]).unwrap(), "X {1}");
        assert_eq!(registry.build("a", &[]).unwrap(), "PLAIN");
        assert_eq!(registry.names().collect::<Vec<_>>(), ["b", "a"]);
        assert_eq!(registry.get("b").unwrap().placeholders().collect::<Vec<_>>(), ["v"]);
    }

    #[test]
    fn test_invalid_templates() {
        assert!(CommandTemplate::parse("x", "A {value").is_err());
        assert!(CommandTemplate::parse("x", "A {}").is_err());
        assert!(CommandTemplate::parse("x", "A }").is_err());
        assert!(CommandTemplate::parse("x", "A {va lue}").is_err());
        assert!(CommandRegistry::from_json_str("[1, 2]").is_err());
    }
}
