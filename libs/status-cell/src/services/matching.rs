use std::collections::HashMap;
use std::sync::Mutex;

use regex::Regex;

use crate::models::{EventTemplate, LoggedEvent};
use crate::StatusError;

/// Pure predicate deciding whether an event satisfies a template.
pub trait TemplateMatcher: Send + Sync {
    fn matches(&self, event: &LoggedEvent, template: &EventTemplate) -> Result<bool, StatusError>;
}

/// Equality and range matching over event fields, with an optional regular expression on
/// the message. Compiled expressions are cached per pattern.
pub struct FieldTemplateMatcher {
    patterns: Mutex<HashMap<String, Regex>>,
}

impl FieldTemplateMatcher {
    pub fn new() -> Self {
        Self {
            patterns: Mutex::new(HashMap::new()),
        }
    }

    fn pattern_matches(&self, pattern: &str, text: &str) -> Result<bool, StatusError> {
        let mut patterns = self.patterns.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(regex) = patterns.get(pattern) {
            return Ok(regex.is_match(text));
        }

        let regex = Regex::new(pattern)
            .map_err(|e| StatusError::TemplateError(format!("invalid message pattern '{}': {}", pattern, e)))?;
        let matched = regex.is_match(text);
        patterns.insert(pattern.to_string(), regex);
        Ok(matched)
    }
}

impl Default for FieldTemplateMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateMatcher for FieldTemplateMatcher {
    fn matches(&self, event: &LoggedEvent, template: &EventTemplate) -> Result<bool, StatusError> {
        if template.is_empty() {
            return Ok(false);
        }

        if let (Some(min), Some(max)) = (template.min_level, template.max_level) {
            if min > max {
                return Err(StatusError::TemplateError(format!(
                    "level range {}..{} is empty",
                    min, max
                )));
            }
        }

        if let Some(code) = &template.code {
            if code != &event.code {
                return Ok(false);
            }
        }

        if let Some(deployment) = template.deployment {
            if deployment != event.deployment {
                return Ok(false);
            }
        }

        if template.min_level.is_some_and(|min| event.level < min) {
            return Ok(false);
        }

        if template.max_level.is_some_and(|max| event.level > max) {
            return Ok(false);
        }

        if !template.tags.is_subset(&event.tags) {
            return Ok(false);
        }

        let fields_match = template
            .fields
            .iter()
            .all(|(key, expected)| event.fields.get(key) == Some(expected));
        if !fields_match {
            return Ok(false);
        }

        match &template.message_pattern {
            Some(pattern) => self.pattern_matches(pattern, &event.message),
            None => Ok(true),
        }
    }
}
