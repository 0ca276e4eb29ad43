// Parameter repair.
//
// The extractor is an LLM, so whatever it returns is treated as untrusted.
// `validate_params` turns any JSON value into a well-formed `ExtractedParams`,
// field by field, so a bad `fields` entry never costs us a good `limit`.
// `fallback_params` runs the same heuristics straight off the query text for
// when the extractor produced nothing at all.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

use super::agent_config::{AgentConfig, FIELD_KEYWORDS, RESTRICTION_KEYWORDS};
use super::agent_models::{CandidateParams, ExtractedParams};

/// First standalone run of ASCII digits in the query.
static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([0-9]+)\b").expect("number pattern is valid"));

const FALLBACK_DESCRIPTION: &str = "Default parameters after a validation error";

/// Fixed result used when the input can't be worked with at all.
pub fn default_params(config: &AgentConfig) -> ExtractedParams {
    ExtractedParams {
        limit: config.limits.default,
        fields: config.all_fields(),
        filters: Map::new(),
        description: FALLBACK_DESCRIPTION.to_string(),
    }
}

/// Repairs a candidate parameter set against the original query.
///
/// Never fails: a non-object candidate yields [`default_params`], and each
/// field of an object candidate falls back to its own default independently.
pub fn validate_params(
    candidate: impl Into<CandidateParams>,
    query: &str,
    config: &AgentConfig,
) -> ExtractedParams {
    let raw = match candidate.into() {
        CandidateParams::Validated(params) => params.to_value(),
        CandidateParams::Untrusted(value) => value,
    };

    let Value::Object(map) = raw else {
        tracing::debug!("Extracted parameters are not an object, using defaults");
        return default_params(config);
    };

    let query_lower = query.to_lowercase();

    let limit = match first_number(query) {
        Some(n) => config.limits.clamp(n),
        None => match map.get("limit").and_then(Value::as_u64) {
            Some(n) if n > 0 => config.limits.clamp(n),
            _ => config.limits.default,
        },
    };

    let mentioned = mentioned_fields(&query_lower);
    let fields = if mentioned.is_empty() {
        config.all_fields()
    } else if has_restriction(&query_lower) {
        mentioned
    } else {
        let from_input = map
            .get("fields")
            .and_then(Value::as_array)
            .map(|items| known_fields(items, config))
            .unwrap_or_default();
        if from_input.is_empty() {
            config.all_fields()
        } else {
            from_input
        }
    };

    let filters = match map.get("filters") {
        Some(Value::Object(filters)) => filters.clone(),
        _ => Map::new(),
    };

    let description = match map.get("description") {
        Some(Value::String(text)) => text.clone(),
        _ => describe(limit, &fields),
    };

    let params = ExtractedParams {
        limit,
        fields,
        filters,
        description,
    };
    tracing::debug!(?params, "Validated parameters");
    params
}

/// Builds parameters from the query text alone.
pub fn fallback_params(query: &str, config: &AgentConfig) -> ExtractedParams {
    let query_lower = query.to_lowercase();

    let limit = first_number(query)
        .map(|n| config.limits.clamp(n))
        .unwrap_or(config.limits.default);

    let mentioned = mentioned_fields(&query_lower);
    let fields = if !mentioned.is_empty() && has_restriction(&query_lower) {
        mentioned
    } else {
        config.all_fields()
    };

    let description = format!("{} (fallback)", describe(limit, &fields));

    ExtractedParams {
        limit,
        fields,
        filters: Map::new(),
        description,
    }
}

/// The first decimal integer in the text. Values that overflow saturate so
/// they still clamp to the upper bound.
fn first_number(text: &str) -> Option<u64> {
    NUMBER_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().parse::<u64>().unwrap_or(u64::MAX))
}

/// Fields whose synonyms appear as whole words, in canonical order.
fn mentioned_fields(query_lower: &str) -> Vec<String> {
    let words: Vec<&str> = query_lower.split(' ').collect();
    FIELD_KEYWORDS
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|kw| words.contains(kw)))
        .map(|(field, _)| field.to_string())
        .collect()
}

fn has_restriction(query_lower: &str) -> bool {
    RESTRICTION_KEYWORDS
        .iter()
        .any(|kw| query_lower.contains(kw))
}

/// Keeps known field names, drops duplicates, preserves input order.
fn known_fields(items: &[Value], config: &AgentConfig) -> Vec<String> {
    let mut fields: Vec<String> = Vec::new();
    for name in items.iter().filter_map(Value::as_str) {
        if config.is_valid_field(name) && !fields.iter().any(|f| f == name) {
            fields.push(name.to_string());
        }
    }
    fields
}

fn describe(limit: u32, fields: &[String]) -> String {
    format!("Fetch {} records with fields {}", limit, fields.join(", "))
}
