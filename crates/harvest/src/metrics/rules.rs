// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metric name rules.
//!
//! The collector sends an ordered list of regex rewrite rules in the connect
//! reply. Before metrics are reported, every name is run through them:
//!
//! ```json
//! {
//!   "match_expression": "^(WebTransaction/Go)/\\d+$",
//!   "replacement": "\\1/*",
//!   "ignore": false,
//!   "each_segment": false,
//!   "replace_all": false,
//!   "terminate_chain": true,
//!   "eval_order": 0
//! }
//! ```
//!
//! Matching is case-insensitive. Rules whose expression does not compile are
//! logged and skipped; they never fail the connect reply.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;

lazy_static! {
    static ref BACKREFERENCE: Regex = Regex::new(r"\\(\d+)").expect("failed creating regex");
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct RawRule {
    match_expression: String,
    replacement: String,
    ignore: bool,
    each_segment: bool,
    replace_all: bool,
    terminate_chain: bool,
    eval_order: i64,
}

#[derive(Clone, Debug)]
pub struct MetricRule {
    regex: Regex,
    replacement: String,
    ignore: bool,
    each_segment: bool,
    replace_all: bool,
    terminate_chain: bool,
    eval_order: i64,
}

#[derive(Debug, PartialEq, Eq)]
enum RuleResult {
    Matched(String),
    Unmatched(String),
    Ignore,
}

/// Turns `\1` style back-references into `${1}`, escaping literal `$`.
fn translate_replacement(replacement: &str) -> String {
    let escaped = replacement.replace('$', "$$");
    BACKREFERENCE.replace_all(&escaped, "$${$1}").into_owned()
}

impl MetricRule {
    fn compile(raw: RawRule) -> Result<Self, regex::Error> {
        let regex = Regex::new(&format!("(?i){}", raw.match_expression))?;
        Ok(MetricRule {
            regex,
            replacement: translate_replacement(&raw.replacement),
            ignore: raw.ignore,
            each_segment: raw.each_segment,
            replace_all: raw.replace_all,
            terminate_chain: raw.terminate_chain,
            eval_order: raw.eval_order,
        })
    }

    fn apply(&self, input: String) -> RuleResult {
        if self.ignore {
            return if self.regex.is_match(&input) {
                RuleResult::Ignore
            } else {
                RuleResult::Unmatched(input)
            };
        }

        if self.each_segment {
            let mut matched = false;
            let segments: Vec<String> = input
                .split('/')
                .map(|segment| {
                    if self.regex.is_match(segment) {
                        matched = true;
                        self.regex
                            .replacen(segment, 1, self.replacement.as_str())
                            .into_owned()
                    } else {
                        segment.to_string()
                    }
                })
                .collect();
            let out = segments.join("/");
            return if matched {
                RuleResult::Matched(out)
            } else {
                RuleResult::Unmatched(out)
            };
        }

        if !self.regex.is_match(&input) {
            return RuleResult::Unmatched(input);
        }
        let out = if self.replace_all {
            self.regex.replace_all(&input, self.replacement.as_str())
        } else {
            self.regex.replacen(&input, 1, self.replacement.as_str())
        };
        RuleResult::Matched(out.into_owned())
    }
}

/// An ordered rule chain.
#[derive(Clone, Debug, Default)]
pub struct MetricRules(Vec<MetricRule>);

impl MetricRules {
    /// Compiles rules from raw JSON values, skipping any that fail to parse or
    /// compile, and orders them by `eval_order`.
    #[must_use]
    pub fn from_values(values: Vec<JsonValue>) -> Self {
        let mut rules: Vec<MetricRule> = values
            .into_iter()
            .filter_map(|v| match serde_json::from_value::<RawRule>(v) {
                Ok(raw) => {
                    let expression = raw.match_expression.clone();
                    match MetricRule::compile(raw) {
                        Ok(rule) => Some(rule),
                        Err(e) => {
                            tracing::error!(
                                "Failed to compile metric rule {expression:?}: {e}, ignoring"
                            );
                            None
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to parse metric rule: {e}, ignoring");
                    None
                }
            })
            .collect();
        rules.sort_by_key(|r| r.eval_order);
        MetricRules(rules)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Runs `name` through the chain. `None` means an ignore rule matched and
    /// the metric should not be reported.
    #[must_use]
    pub fn apply(&self, name: &str) -> Option<String> {
        let mut current = name.to_string();
        for rule in &self.0 {
            match rule.apply(current) {
                RuleResult::Ignore => return None,
                RuleResult::Matched(out) => {
                    current = out;
                    if rule.terminate_chain {
                        break;
                    }
                }
                RuleResult::Unmatched(out) => current = out,
            }
        }
        Some(current)
    }
}

impl<'de> Deserialize<'de> for MetricRules {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match JsonValue::deserialize(deserializer)? {
            JsonValue::Array(values) => Ok(MetricRules::from_values(values)),
            JsonValue::Null => Ok(MetricRules::default()),
            other => {
                tracing::error!("Expected a list of metric rules, got {other}, ignoring");
                Ok(MetricRules::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rules(value: JsonValue) -> MetricRules {
        serde_json::from_value(value).expect("rules deserialize")
    }

    #[test]
    fn test_backreference_translation() {
        assert_eq!(translate_replacement(r"\1/*"), "${1}/*");
        assert_eq!(translate_replacement(r"a$b\12"), "a$$b${12}");
    }

    #[test]
    fn test_replace_first_with_backreference() {
        let r = rules(json!([{
            "match_expression": "^(WebTransaction/Go)/\\d+$",
            "replacement": "\\1/*",
        }]));
        assert_eq!(r.apply("WebTransaction/Go/1234").as_deref(), Some("WebTransaction/Go/*"));
        assert_eq!(r.apply("WebTransaction/Go/abc").as_deref(), Some("WebTransaction/Go/abc"));
    }

    #[test]
    fn test_case_insensitive() {
        let r = rules(json!([{"match_expression": "users", "replacement": "people"}]));
        assert_eq!(r.apply("Custom/USERS").as_deref(), Some("Custom/people"));
    }

    #[test]
    fn test_replace_all_versus_first() {
        let first = rules(json!([{"match_expression": "[0-9]+", "replacement": "N"}]));
        assert_eq!(first.apply("a/1/b/2").as_deref(), Some("a/N/b/2"));
        let all = rules(json!([{
            "match_expression": "[0-9]+",
            "replacement": "N",
            "replace_all": true
        }]));
        assert_eq!(all.apply("a/1/b/2").as_deref(), Some("a/N/b/N"));
    }

    #[test]
    fn test_each_segment() {
        let r = rules(json!([{
            "match_expression": "^[0-9]+$",
            "replacement": "*",
            "each_segment": true
        }]));
        assert_eq!(r.apply("Web/12/users/34x/56").as_deref(), Some("Web/*/users/34x/*"));
    }

    #[test]
    fn test_ignore_rule() {
        let r = rules(json!([{"match_expression": "^Custom/secret", "ignore": true}]));
        assert_eq!(r.apply("Custom/secret/thing"), None);
        assert_eq!(r.apply("Custom/public").as_deref(), Some("Custom/public"));
    }

    #[test]
    fn test_eval_order_and_terminate_chain() {
        let r = rules(json!([
            {"match_expression": "b", "replacement": "c", "eval_order": 2},
            {"match_expression": "a", "replacement": "b", "eval_order": 1, "terminate_chain": true},
        ]));
        assert_eq!(r.apply("a").as_deref(), Some("b"));
        // An unmatched terminating rule does not stop the chain.
        assert_eq!(r.apply("b").as_deref(), Some("c"));
    }

    #[test]
    fn test_chain_continues_after_match() {
        let r = rules(json!([
            {"match_expression": "a", "replacement": "b", "eval_order": 1},
            {"match_expression": "b", "replacement": "c", "eval_order": 2},
        ]));
        assert_eq!(r.apply("a").as_deref(), Some("c"));
    }

    #[test]
    fn test_invalid_rules_are_skipped() {
        let r = rules(json!([
            {"match_expression": "(unclosed", "replacement": "x"},
            {"match_expression": 42},
            {"match_expression": "ok", "replacement": "fine"},
        ]));
        assert_eq!(r.len(), 1);
        assert_eq!(r.apply("ok").as_deref(), Some("fine"));
    }

    #[test]
    fn test_non_list_is_empty() {
        assert!(rules(json!({"not": "a list"})).is_empty());
        assert!(rules(JsonValue::Null).is_empty());
    }
}
