//! Consensus voting over the sampled attempts of one (item, dimension).
//!
//! Single mode: the canonical label with the most successful attempts wins,
//! ties going to the label seen first; confidence is `count / R`.
//! Set mode: a label survives only if more than half of the successful
//! attempts contain it; each survivor carries its own `count / R`.
//!
//! `R` is the number of recorded attempts, failures included.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::dimension::{Dimension, VoteMode};
use crate::extraction::ExtractionAttempt;

/// Agreement expressed as `agreeing / total` rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confidence {
    pub agreeing: u32,
    pub total: u32,
}

impl Confidence {
    pub fn new(agreeing: u32, total: u32) -> Self {
        Self { agreeing, total }
    }

    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.agreeing as f64 / self.total as f64
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.agreeing, self.total)
    }
}

impl FromStr for Confidence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (a, b) = s
            .split_once('/')
            .ok_or_else(|| format!("confidence must look like a/b: {s}"))?;
        let agreeing = a.trim().parse().map_err(|_| format!("bad numerator in {s}"))?;
        let total = b.trim().parse().map_err(|_| format!("bad denominator in {s}"))?;
        Ok(Self { agreeing, total })
    }
}

impl Serialize for Confidence {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Confidence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VotedLabel {
    pub label: String,
    #[serde(default)]
    pub description: String,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ConsensusValue {
    Single {
        /// `None` when no attempt succeeded.
        label: Option<String>,
        #[serde(default)]
        description: String,
        confidence: Confidence,
    },
    Set {
        labels: Vec<VotedLabel>,
    },
}

/// The voted value for one (item, dimension) plus its audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub item_id: String,
    pub dimension: Dimension,
    pub value: ConsensusValue,
    pub rounds: u32,
    pub successful: u32,
    /// raw label -> canonical name applied before voting.
    #[serde(default)]
    pub mapping: BTreeMap<String, String>,
    pub attempts: Vec<ExtractionAttempt>,
}

impl ConsensusResult {
    /// Canonical labels in the consensus, in vote order.
    pub fn labels(&self) -> Vec<&str> {
        match &self.value {
            ConsensusValue::Single { label, .. } => label.as_deref().into_iter().collect(),
            ConsensusValue::Set { labels } => labels.iter().map(|l| l.label.as_str()).collect(),
        }
    }
}

/// All dimensions' consensus for one item, in corpus processing order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemConsensus {
    pub item_id: String,
    /// 0-based processing position.
    pub seq: u64,
    pub dimensions: BTreeMap<Dimension, ConsensusResult>,
}

/// Per-label tally in first-seen order.
struct Tally {
    order: Vec<String>,
    counts: HashMap<String, (u32, String)>,
}

impl Tally {
    fn new() -> Self {
        Self {
            order: Vec::new(),
            counts: HashMap::new(),
        }
    }

    fn add(&mut self, label: &str, description: &str) {
        match self.counts.get_mut(label) {
            Some((count, desc)) => {
                *count += 1;
                if desc.is_empty() {
                    *desc = description.to_string();
                }
            }
            None => {
                self.order.push(label.to_string());
                self.counts
                    .insert(label.to_string(), (1, description.to_string()));
            }
        }
    }
}

/// Reduce attempts to a consensus. `canonical` maps a raw label to its
/// canonical name (unresolved labels map to themselves).
pub fn vote<F>(
    item_id: &str,
    dimension: Dimension,
    mode: VoteMode,
    mut attempts: Vec<ExtractionAttempt>,
    canonical: F,
) -> ConsensusResult
where
    F: Fn(&str) -> String,
{
    attempts.sort_by_key(|a| a.round);
    let rounds = attempts.len() as u32;
    let successful: Vec<&ExtractionAttempt> = attempts.iter().filter(|a| a.is_success()).collect();
    let mut mapping = BTreeMap::new();
    let mut tally = Tally::new();

    match mode {
        VoteMode::Single => {
            for attempt in &successful {
                let Some(primary) = attempt.payload.as_ref().and_then(|p| p.primary()) else {
                    continue;
                };
                let label = canonical(&primary.label);
                mapping.insert(primary.label.clone(), label.clone());
                tally.add(&label, &primary.description);
            }
        }
        VoteMode::Set => {
            for attempt in &successful {
                let Some(payload) = &attempt.payload else {
                    continue;
                };
                let mut in_attempt = HashSet::new();
                for value in payload.values() {
                    let label = canonical(&value.label);
                    mapping.insert(value.label.clone(), label.clone());
                    if in_attempt.insert(label.clone()) {
                        tally.add(&label, &value.description);
                    }
                }
            }
        }
    }

    let value = match mode {
        VoteMode::Single => {
            let mut best: Option<(&str, u32)> = None;
            for label in &tally.order {
                let count = tally.counts[label].0;
                if best.map_or(true, |(_, c)| count > c) {
                    best = Some((label, count));
                }
            }
            match best {
                Some((label, count)) => ConsensusValue::Single {
                    label: Some(label.to_string()),
                    description: tally.counts[label].1.clone(),
                    confidence: Confidence::new(count, rounds),
                },
                None => ConsensusValue::Single {
                    label: None,
                    description: String::new(),
                    confidence: Confidence::new(0, rounds),
                },
            }
        }
        VoteMode::Set => {
            let n = successful.len() as u32;
            let labels = tally
                .order
                .iter()
                .filter_map(|label| {
                    let (count, description) = &tally.counts[label];
                    (count * 2 > n).then(|| VotedLabel {
                        label: label.clone(),
                        description: description.clone(),
                        confidence: Confidence::new(*count, rounds),
                    })
                })
                .collect();
            ConsensusValue::Set { labels }
        }
    };

    ConsensusResult {
        item_id: item_id.to_string(),
        dimension,
        value,
        rounds,
        successful: successful.len() as u32,
        mapping,
        attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::{ExtractionPayload, LabeledValue};
    use serde_json::Value;

    fn lv(label: &str, desc: &str) -> LabeledValue {
        LabeledValue {
            label: label.into(),
            description: desc.into(),
            detail: Value::Null,
        }
    }

    fn single(round: u32, label: &str) -> ExtractionAttempt {
        ExtractionAttempt::success(
            "p",
            Dimension::InputStructure,
            round,
            ExtractionPayload::SingleLabel {
                value: lv(label, &format!("{label} from round {round}")),
            },
        )
    }

    fn set(round: u32, labels: &[&str]) -> ExtractionAttempt {
        ExtractionAttempt::success(
            "p",
            Dimension::CoreConstraints,
            round,
            ExtractionPayload::LabelSet {
                labels: labels.iter().map(|l| lv(l, &format!("{l}@{round}"))).collect(),
            },
        )
    }

    fn failed(round: u32) -> ExtractionAttempt {
        ExtractionAttempt::failure("p", Dimension::InputStructure, round, "timeout")
    }

    fn identity(s: &str) -> String {
        s.to_string()
    }

    #[test]
    fn plurality_wins_with_fractional_confidence() {
        let r = vote(
            "p",
            Dimension::InputStructure,
            VoteMode::Single,
            vec![single(1, "array"), single(2, "graph"), single(3, "array")],
            identity,
        );
        match r.value {
            ConsensusValue::Single { label, description, confidence } => {
                assert_eq!(label.as_deref(), Some("array"));
                assert_eq!(description, "array from round 1");
                assert_eq!(confidence.to_string(), "2/3");
            }
            _ => panic!("expected single"),
        }
    }

    #[test]
    fn ties_go_to_first_seen() {
        let r = vote(
            "p",
            Dimension::Objective,
            VoteMode::Single,
            vec![single(2, "b"), single(1, "a"), failed(3)],
            identity,
        );
        assert_eq!(r.labels(), vec!["a"]);
        assert_eq!(r.successful, 2);
    }

    #[test]
    fn no_successes_give_null_zero_over_r() {
        let r = vote(
            "p",
            Dimension::InputStructure,
            VoteMode::Single,
            vec![failed(1), failed(2), failed(3)],
            identity,
        );
        assert_eq!(
            r.value,
            ConsensusValue::Single {
                label: None,
                description: String::new(),
                confidence: Confidence::new(0, 3)
            }
        );
    }

    #[test]
    fn confidence_is_in_unit_interval_when_any_succeed() {
        for successes in 1..=5u32 {
            let mut attempts: Vec<_> = (1..=successes).map(|r| single(r, "x")).collect();
            attempts.extend((successes + 1..=5).map(failed));
            let r = vote("p", Dimension::InputStructure, VoteMode::Single, attempts, identity);
            let ConsensusValue::Single { confidence, .. } = r.value else { panic!() };
            assert!(confidence.fraction() > 0.0 && confidence.fraction() <= 1.0);
        }
    }

    #[test]
    fn canonical_mapping_merges_votes() {
        let r = vote(
            "p",
            Dimension::InputStructure,
            VoteMode::Single,
            vec![single(1, "array"), single(2, "Array"), single(3, "sorted_array")],
            |raw| if raw == "sorted_array" { "sorted_array".into() } else { "array".into() },
        );
        assert_eq!(r.labels(), vec!["array"]);
        assert_eq!(r.mapping["Array"], "array");
    }

    #[test]
    fn set_vote_needs_strict_majority_of_successes() {
        // R = 4: two of four is not a majority, three of four is.
        let r = vote(
            "p",
            Dimension::CoreConstraints,
            VoteMode::Set,
            vec![
                set(1, &["distinct", "bounded_sum"]),
                set(2, &["distinct", "bounded_sum"]),
                set(3, &["distinct"]),
                set(4, &["connected"]),
            ],
            identity,
        );
        let ConsensusValue::Set { labels } = &r.value else { panic!() };
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].label, "distinct");
        assert_eq!(labels[0].confidence, Confidence::new(3, 4));
        assert_eq!(labels[0].description, "distinct@1");
    }

    #[test]
    fn set_vote_counts_majority_of_successful_rounds_only() {
        let r = vote(
            "p",
            Dimension::CoreConstraints,
            VoteMode::Set,
            vec![set(1, &["distinct"]), failed(2), set(3, &["distinct", "distinct"])],
            identity,
        );
        let ConsensusValue::Set { labels } = &r.value else { panic!() };
        assert_eq!(labels[0].confidence.to_string(), "2/3");
        assert_eq!(r.successful, 2);
    }

    #[test]
    fn singletons_are_dropped_from_the_set() {
        let r = vote(
            "p",
            Dimension::CoreConstraints,
            VoteMode::Set,
            vec![set(1, &["a"]), set(2, &["b"]), set(3, &["c"])],
            identity,
        );
        assert!(r.labels().is_empty());
        assert_eq!(r.attempts.len(), 3);
    }

    #[test]
    fn confidence_serializes_as_fraction_string() {
        let json = serde_json::to_string(&Confidence::new(2, 3)).unwrap();
        assert_eq!(json, "\"2/3\"");
        let back: Confidence = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Confidence::new(2, 3));
    }
}
