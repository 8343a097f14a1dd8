//! Extraction payloads and attempts.
//!
//! Model output is untrusted. Each dimension has an explicit parse step that
//! turns a JSON object into an [`ExtractionPayload`] or rejects it; a rejected
//! payload makes the attempt a failure rather than partially trusted data.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::dimension::Dimension;

/// One raw label with the auxiliary data the model attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledValue {
    pub label: String,
    #[serde(default)]
    pub description: String,
    /// Remaining fields of the model's object (formal statement, properties...).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionPayload {
    SingleLabel { value: LabeledValue },
    LabelSet { labels: Vec<LabeledValue> },
}

impl ExtractionPayload {
    pub fn values(&self) -> &[LabeledValue] {
        match self {
            ExtractionPayload::SingleLabel { value } => std::slice::from_ref(value),
            ExtractionPayload::LabelSet { labels } => labels,
        }
    }

    /// The label a single-valued vote counts: the only one, or the first of a set.
    pub fn primary(&self) -> Option<&LabeledValue> {
        self.values().first()
    }

    pub fn raw_labels(&self) -> impl Iterator<Item = &str> {
        self.values().iter().map(|v| v.label.as_str())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum PayloadError {
    #[error("response is not a JSON object")]
    NotAnObject,
    #[error("no JSON object found in response")]
    NoJson,
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
}

fn non_empty_str<'a>(obj: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn detail_without(obj: &serde_json::Map<String, Value>, skip: &[&str]) -> Value {
    let rest: serde_json::Map<String, Value> = obj
        .iter()
        .filter(|(k, _)| !skip.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if rest.is_empty() {
        Value::Null
    } else {
        Value::Object(rest)
    }
}

fn single_from_type(obj: &serde_json::Map<String, Value>) -> Result<ExtractionPayload, PayloadError> {
    let label = match obj.get("type") {
        None => return Err(PayloadError::MissingField("type")),
        Some(v) => v
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(PayloadError::WrongType {
                field: "type",
                expected: "a non-empty string",
            })?,
    };
    Ok(ExtractionPayload::SingleLabel {
        value: LabeledValue {
            label: label.to_string(),
            description: non_empty_str(obj, "description").unwrap_or_default().to_string(),
            detail: detail_without(obj, &["type", "description"]),
        },
    })
}

/// Named entries of an array; entries without a usable name are skipped.
fn named_entries(items: &[Value]) -> Vec<LabeledValue> {
    items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let name = non_empty_str(obj, "name")?;
            Some(LabeledValue {
                label: name.to_string(),
                description: non_empty_str(obj, "description").unwrap_or_default().to_string(),
                detail: detail_without(obj, &["name", "description"]),
            })
        })
        .collect()
}

/// Validate a model's JSON object for one dimension.
pub fn parse_payload(dimension: Dimension, value: &Value) -> Result<ExtractionPayload, PayloadError> {
    let obj = value.as_object().ok_or(PayloadError::NotAnObject)?;
    match dimension {
        Dimension::InputStructure | Dimension::Objective => single_from_type(obj),
        Dimension::CoreConstraints => match obj.get("constraints") {
            None => Err(PayloadError::MissingField("constraints")),
            Some(Value::Array(items)) => Ok(ExtractionPayload::LabelSet {
                labels: named_entries(items),
            }),
            Some(_) => Err(PayloadError::WrongType {
                field: "constraints",
                expected: "an array",
            }),
        },
        Dimension::Invariant => match obj.get("invariants") {
            Some(Value::Array(items)) => Ok(ExtractionPayload::LabelSet {
                labels: named_entries(items),
            }),
            Some(_) => Err(PayloadError::WrongType {
                field: "invariants",
                expected: "an array",
            }),
            None => {
                let name = non_empty_str(obj, "name").ok_or(PayloadError::MissingField("name"))?;
                Ok(ExtractionPayload::SingleLabel {
                    value: LabeledValue {
                        label: name.to_string(),
                        description: non_empty_str(obj, "description")
                            .unwrap_or_default()
                            .to_string(),
                        detail: detail_without(obj, &["name", "description"]),
                    },
                })
            }
        },
    }
}

/// Locate the first JSON object in noisy model output (code fences, prose).
pub fn extract_json(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    let start = trimmed.find('{')?;
    let remainder = &trimmed[start..];
    find_matching_brace(remainder).map(|end| &remainder[..end])
}

/// Byte offset just past the brace closing the object at the start of `s`.
/// Braces inside JSON strings are ignored.
fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in s.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' && in_string {
            escape = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse raw model text into a JSON object value.
pub fn parse_json_object(raw: &str) -> Result<Value, PayloadError> {
    let json = extract_json(raw).ok_or(PayloadError::NoJson)?;
    let value: Value =
        serde_json::from_str(json).map_err(|e| PayloadError::InvalidJson(e.to_string()))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(PayloadError::NotAnObject)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Failure,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Success => "success",
            AttemptStatus::Failure => "failure",
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(AttemptStatus::Success),
            "failure" | "failed" => Ok(AttemptStatus::Failure),
            other => Err(format!("unknown attempt status: {other}")),
        }
    }
}

/// One sampling round's result for one (item, dimension).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionAttempt {
    pub item_id: String,
    pub dimension: Dimension,
    /// 1-based round index.
    pub round: u32,
    pub status: AttemptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ExtractionPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub model: String,
    /// blake3 of the rendered prompt template revision.
    pub prompt_hash: String,
    pub recorded_at: DateTime<Utc>,
}

impl ExtractionAttempt {
    pub fn success(
        item_id: impl Into<String>,
        dimension: Dimension,
        round: u32,
        payload: ExtractionPayload,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            dimension,
            round,
            status: AttemptStatus::Success,
            payload: Some(payload),
            error: None,
            model: String::new(),
            prompt_hash: String::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn failure(
        item_id: impl Into<String>,
        dimension: Dimension,
        round: u32,
        error: impl Into<String>,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            dimension,
            round,
            status: AttemptStatus::Failure,
            payload: None,
            error: Some(error.into()),
            model: String::new(),
            prompt_hash: String::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_provenance(mut self, model: impl Into<String>, prompt_hash: impl Into<String>) -> Self {
        self.model = model.into();
        self.prompt_hash = prompt_hash.into();
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == AttemptStatus::Success && self.payload.is_some()
    }

    /// Raw labels of a successful attempt; empty for failures.
    pub fn raw_labels(&self) -> Vec<&str> {
        match (&self.status, &self.payload) {
            (AttemptStatus::Success, Some(p)) => p.raw_labels().collect(),
            _ => Vec::new(),
        }
    }
}
