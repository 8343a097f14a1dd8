//! Problem records consumed by the sampler.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One competitive-programming problem. Text fields may be empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(alias = "problem_id")]
    pub id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub constraints: String,
}

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid problem file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("duplicate problem id {0}")]
    DuplicateId(String),
    #[error("problem at position {0} has an empty id")]
    EmptyId(usize),
}

/// Load a JSON array of problems, keeping file order as processing order.
pub fn load_problems(path: &Path) -> Result<Vec<Problem>, CorpusError> {
    let display = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| CorpusError::Io {
        path: display.clone(),
        source,
    })?;
    parse_problems(&text).map_err(|e| match e {
        CorpusError::Parse { source, .. } => CorpusError::Parse {
            path: display,
            source,
        },
        other => other,
    })
}

pub fn parse_problems(text: &str) -> Result<Vec<Problem>, CorpusError> {
    let problems: Vec<Problem> =
        serde_json::from_str(text).map_err(|source| CorpusError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;

    let mut seen = std::collections::HashSet::new();
    for (idx, p) in problems.iter().enumerate() {
        if p.id.trim().is_empty() {
            return Err(CorpusError::EmptyId(idx));
        }
        if !seen.insert(p.id.as_str()) {
            return Err(CorpusError::DuplicateId(p.id.clone()));
        }
    }
    Ok(problems)
}
