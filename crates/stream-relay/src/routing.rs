// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Derivation of the log key and payload from a raw firehose event.

use serde_json::Value;
use tracing::warn;

pub const DEFAULT_TERM: &str = "corona";

/// A raw event reduced to what is written to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedMessage {
    /// Last filter term found in the event, if any
    pub key: Option<String>,
    pub payload: String,
}

/// Parses `|`-delimited filter terms. Terms are lower-cased; blank input gives the default term.
pub fn parse_terms(elements: Option<&str>) -> Vec<String> {
    let terms: Vec<String> = elements
        .unwrap_or_default()
        .split('|')
        .map(|term| term.trim().to_lowercase())
        .filter(|term| !term.is_empty())
        .collect();

    if terms.is_empty() {
        vec![DEFAULT_TERM.to_string()]
    } else {
        terms
    }
}

#[derive(Debug, Clone)]
pub struct Router {
    terms: Vec<String>,
}

impl Router {
    pub fn new(terms: Vec<String>) -> Self {
        let terms = terms.into_iter().map(|t| t.to_lowercase()).collect();
        Self { terms }
    }

    pub fn route(&self, raw: &str) -> RoutedMessage {
        RoutedMessage {
            key: self.route_key(raw),
            payload: extract_payload(raw),
        }
    }

    /// Scans every term in order. Each match replaces the previous one, so the last matching
    /// term is the key.
    pub fn route_key(&self, raw: &str) -> Option<String> {
        let haystack = raw.to_lowercase();
        let mut key = None;
        for term in &self.terms {
            if haystack.contains(term.as_str()) {
                key = Some(term.clone());
            }
        }
        key
    }
}

/// Returns the `text` field of a JSON event, or an empty string.
pub fn extract_payload(raw: &str) -> String {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            warn!("Unable to parse event as JSON: {e}");
            return String::new();
        }
    };

    match value.get("text") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_parse_terms_lowercases_and_splits() {
        assert_eq!(
            parse_terms(Some("Corona|COVID| vaccine ")),
            vec!["corona", "covid", "vaccine"]
        );
    }

    #[test]
    fn test_parse_terms_defaults() {
        assert_eq!(parse_terms(None), vec![DEFAULT_TERM]);
        assert_eq!(parse_terms(Some("")), vec![DEFAULT_TERM]);
        assert_eq!(parse_terms(Some("||")), vec![DEFAULT_TERM]);
    }

    #[test]
    fn test_last_matching_term_wins() {
        let router = Router::new(vec!["corona".to_string(), "covid".to_string()]);
        assert_eq!(
            router.route_key("covid-19 corona update").as_deref(),
            Some("covid")
        );
    }

    #[test]
    fn test_match_is_case_insensitive() {
        let router = Router::new(vec!["Corona".to_string()]);
        assert_eq!(router.route_key("CORONA cases").as_deref(), Some("corona"));
    }

    #[test]
    fn test_no_match_gives_no_key() {
        let router = Router::new(vec!["corona".to_string()]);
        assert_eq!(router.route_key("weather report"), None);
    }

    #[test]
    fn test_extract_text_field() {
        assert_eq!(extract_payload(r#"{"text":"hello world"}"#), "hello world");
        assert_eq!(extract_payload(r#"{"id":1}"#), "");
        assert_eq!(extract_payload(r#"{"text":null}"#), "");
        assert_eq!(extract_payload(r#"{"text":42}"#), "42");
        assert_eq!(extract_payload(r#"{"text":{"nested":true}}"#), "");
        assert_eq!(extract_payload("[1,2,3]"), "");
    }

    #[test]
    #[traced_test]
    fn test_unparsable_event_is_logged_and_empty() {
        assert_eq!(extract_payload("not json"), "");
        assert!(logs_contain("Unable to parse event as JSON"));
    }

    #[test]
    fn test_route_combines_key_and_payload() {
        let router = Router::new(vec!["corona".to_string()]);
        let message = router.route(r#"{"text":"Corona news"}"#);
        assert_eq!(
            message,
            RoutedMessage {
                key: Some("corona".to_string()),
                payload: "Corona news".to_string(),
            }
        );
    }
}
