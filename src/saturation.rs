//! Saturation analysis: is a dimension's label vocabulary running out?
//!
//! For each dimension we walk the consensus corpus in processing order,
//! note the item at which every canonical label first appears, and fit
//! `y = a·ln(x) + b` to the cumulative distinct-label count. A good
//! logarithmic fit together with a quiet tail (few items still introducing
//! labels) is read as evidence that the label space is finite.
//!
//! The analysis is read-only; it never feeds back into normalization.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use thiserror::Error;

use crate::dimension::Dimension;
use crate::vote::ItemConsensus;

pub const DEFAULT_TAIL_WINDOW: usize = 100;
pub const DEFAULT_MIN_POINTS: usize = 10;

const MAX_ITERATIONS: usize = 50;
const TOLERANCE: f64 = 1e-10;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid verdict thresholds: {0}")]
pub struct ThresholdError(pub String);

/// Cut-offs for the verdict ladder. Stricter rungs must stay stricter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerdictThresholds {
    pub finite_r_squared: f64,
    pub finite_tail_rate: f64,
    pub likely_r_squared: f64,
    pub likely_tail_rate: f64,
    pub trend_r_squared: f64,
}

impl Default for VerdictThresholds {
    fn default() -> Self {
        Self {
            finite_r_squared: 0.95,
            finite_tail_rate: 0.02,
            likely_r_squared: 0.90,
            likely_tail_rate: 0.05,
            trend_r_squared: 0.80,
        }
    }
}

impl VerdictThresholds {
    pub fn validate(&self) -> Result<(), ThresholdError> {
        let all = [
            self.finite_r_squared,
            self.finite_tail_rate,
            self.likely_r_squared,
            self.likely_tail_rate,
            self.trend_r_squared,
        ];
        if all.iter().any(|v| !(0.0..=1.0).contains(v)) {
            return Err(ThresholdError("every threshold must lie in [0, 1]".into()));
        }
        if !(self.finite_r_squared >= self.likely_r_squared && self.likely_r_squared >= self.trend_r_squared) {
            return Err(ThresholdError(format!(
                "r_squared thresholds must satisfy finite >= likely >= trend (got {} / {} / {})",
                self.finite_r_squared, self.likely_r_squared, self.trend_r_squared
            )));
        }
        if self.finite_tail_rate > self.likely_tail_rate {
            return Err(ThresholdError(format!(
                "tail rate thresholds must satisfy finite <= likely (got {} / {})",
                self.finite_tail_rate, self.likely_tail_rate
            )));
        }
        Ok(())
    }

    pub fn classify(&self, r_squared: f64, tail_rate: f64) -> Verdict {
        if r_squared > self.finite_r_squared && tail_rate < self.finite_tail_rate {
            Verdict::Finite
        } else if r_squared > self.likely_r_squared && tail_rate < self.likely_tail_rate {
            Verdict::LikelyFinite
        } else if r_squared > self.trend_r_squared {
            Verdict::UncertainConvergent
        } else {
            Verdict::Uncertain
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Finite,
    LikelyFinite,
    UncertainConvergent,
    Uncertain,
    /// Too few timeline points to fit; not a judgment either way.
    InsufficientData,
}

impl Verdict {
    pub fn describe(&self) -> &'static str {
        match self {
            Verdict::Finite => "FINITE (strong convergence + saturation)",
            Verdict::LikelyFinite => "LIKELY_FINITE",
            Verdict::UncertainConvergent => "UNCERTAIN (convergent trend)",
            Verdict::Uncertain => "UNCERTAIN (no clear convergence)",
            Verdict::InsufficientData => "INSUFFICIENT_DATA",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

#[derive(Debug, Clone)]
pub struct SaturationConfig {
    pub tail_window: usize,
    pub min_points: usize,
    pub thresholds: VerdictThresholds,
}

impl Default for SaturationConfig {
    fn default() -> Self {
        Self {
            tail_window: DEFAULT_TAIL_WINDOW,
            min_points: DEFAULT_MIN_POINTS,
            thresholds: VerdictThresholds::default(),
        }
    }
}

/// First appearance of a canonical label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelinePoint {
    /// 1-based position of the item in processing order.
    pub item_index: usize,
    pub label: String,
    /// Distinct labels seen once this point's item has been processed.
    pub cumulative: usize,
}

/// First-seen timeline for one dimension, in processing order.
///
/// Labels introduced by the same item share its x and its end-of-item count.
pub fn build_timeline(corpus: &[ItemConsensus], dimension: Dimension) -> Vec<TimelinePoint> {
    let mut seen = HashSet::new();
    let mut timeline = Vec::new();
    for (i, item) in corpus.iter().enumerate() {
        let Some(result) = item.dimensions.get(&dimension) else {
            continue;
        };
        let fresh: Vec<String> = result
            .labels()
            .into_iter()
            .filter(|label| seen.insert(label.to_string()))
            .map(str::to_string)
            .collect();
        let cumulative = seen.len();
        timeline.extend(fresh.into_iter().map(|label| TimelinePoint {
            item_index: i + 1,
            label,
            cumulative,
        }));
    }
    timeline
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitModel {
    /// `y = a·ln(x) + b`
    Logarithmic,
    /// `y = a·x + b`, used when the logarithmic fit does not converge.
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitParams {
    pub model: FitModel,
    pub a: f64,
    pub b: f64,
}

fn r_squared(points: &[(f64, f64)], predict: impl Fn(f64) -> f64) -> f64 {
    let mean = points.iter().map(|p| p.1).sum::<f64>() / points.len() as f64;
    let ss_tot: f64 = points.iter().map(|(_, y)| (y - mean).powi(2)).sum();
    if ss_tot == 0.0 {
        return 0.0;
    }
    let ss_res: f64 = points.iter().map(|&(x, y)| (y - predict(x)).powi(2)).sum();
    1.0 - ss_res / ss_tot
}

/// Gauss-Newton least squares for `y = a·ln(x) + b`, starting at a=1, b=0.
/// `None` when the normal equations are singular or the iterate blows up.
pub fn fit_logarithmic(points: &[(f64, f64)]) -> Option<(FitParams, f64)> {
    if points.len() < 2 || points.iter().any(|&(x, _)| x <= 0.0) {
        return None;
    }
    let (mut a, mut b) = (1.0_f64, 0.0_f64);
    let mut converged = false;
    for _ in 0..MAX_ITERATIONS {
        let mut jtj = Matrix2::<f64>::zeros();
        let mut jtr = Vector2::<f64>::zeros();
        for &(x, y) in points {
            let j = Vector2::new(x.ln(), 1.0);
            let residual = y - (a * j[0] + b);
            jtj += j * j.transpose();
            jtr += j * residual;
        }
        let delta = jtj.try_inverse()? * jtr;
        a += delta[0];
        b += delta[1];
        if !(a.is_finite() && b.is_finite()) {
            return None;
        }
        if delta.norm() < TOLERANCE * (1.0 + a.abs() + b.abs()) {
            converged = true;
            break;
        }
    }
    if !converged {
        return None;
    }
    let r2 = r_squared(points, |x| a * x.ln() + b);
    r2.is_finite().then_some((
        FitParams {
            model: FitModel::Logarithmic,
            a,
            b,
        },
        r2,
    ))
}

/// Ordinary linear regression; R² is the squared correlation coefficient.
pub fn fit_linear(points: &[(f64, f64)]) -> Option<(FitParams, f64)> {
    if points.len() < 2 {
        return None;
    }
    let xs: Vec<f64> = points.iter().map(|p| p.0).collect();
    let ys: Vec<f64> = points.iter().map(|p| p.1).collect();
    let var_x = xs.iter().variance();
    let var_y = ys.iter().variance();
    if var_x == 0.0 || !var_x.is_finite() {
        return None;
    }
    let cov = xs.iter().covariance(ys.iter());
    let slope = cov / var_x;
    let intercept = ys.iter().mean() - slope * xs.iter().mean();
    let r2 = if var_y == 0.0 {
        0.0
    } else {
        cov * cov / (var_x * var_y)
    };
    Some((
        FitParams {
            model: FitModel::Linear,
            a: slope,
            b: intercept,
        },
        r2,
    ))
}

/// Fraction of the last `window` items that introduced a first-seen label.
pub fn tail_new_rate(timeline: &[TimelinePoint], total_items: usize, window: usize) -> f64 {
    let w = window.min(total_items);
    if w == 0 {
        return 0.0;
    }
    let start = total_items - w;
    let introducing: HashSet<usize> = timeline
        .iter()
        .filter(|p| p.item_index > start)
        .map(|p| p.item_index)
        .collect();
    introducing.len() as f64 / w as f64
}

#[derive(Debug, Clone, Serialize)]
pub struct DimensionMetrics {
    pub total_labels: usize,
    pub r_squared: f64,
    pub tail_new_rate: f64,
    pub fit_params: Option<FitParams>,
    pub verdict: Verdict,
}

pub fn analyze_dimension(
    corpus: &[ItemConsensus],
    dimension: Dimension,
    config: &SaturationConfig,
) -> (DimensionMetrics, Vec<TimelinePoint>) {
    let timeline = build_timeline(corpus, dimension);
    let total_labels = timeline.len();

    if total_labels < config.min_points {
        let metrics = DimensionMetrics {
            total_labels,
            r_squared: 0.0,
            tail_new_rate: 0.0,
            fit_params: None,
            verdict: Verdict::InsufficientData,
        };
        return (metrics, timeline);
    }

    let points: Vec<(f64, f64)> = timeline
        .iter()
        .map(|p| (p.item_index as f64, p.cumulative as f64))
        .collect();
    let fit = fit_logarithmic(&points).or_else(|| {
        tracing::debug!(%dimension, "logarithmic fit failed, falling back to linear");
        fit_linear(&points)
    });
    let (fit_params, r2) = match fit {
        Some((params, r2)) => (Some(params), r2),
        None => (None, 0.0),
    };
    let tail = tail_new_rate(&timeline, corpus.len(), config.tail_window);

    let metrics = DimensionMetrics {
        total_labels,
        r_squared: r2,
        tail_new_rate: tail,
        fit_params,
        verdict: config.thresholds.classify(r2, tail),
    };
    (metrics, timeline)
}

#[derive(Debug, Clone, Serialize)]
pub struct SaturationReport {
    pub items: usize,
    pub dimensions: BTreeMap<Dimension, DimensionMetrics>,
    pub verdicts: BTreeMap<Dimension, String>,
    /// Sorted distinct consensus labels per dimension.
    pub labels_per_dimension: BTreeMap<Dimension, Vec<String>>,
    #[serde(skip)]
    pub timelines: BTreeMap<Dimension, Vec<TimelinePoint>>,
}

impl SaturationReport {
    /// `dimension,item_index,cumulative_labels`, one row per timeline point.
    pub fn to_csv(&self) -> String {
        let mut out = String::from("dimension,item_index,cumulative_labels\n");
        for (dim, timeline) in &self.timelines {
            for p in timeline {
                out.push_str(&format!("{},{},{}\n", dim.as_str(), p.item_index, p.cumulative));
            }
        }
        out
    }
}

pub fn analyze(corpus: &[ItemConsensus], config: &SaturationConfig) -> SaturationReport {
    let mut report = SaturationReport {
        items: corpus.len(),
        dimensions: BTreeMap::new(),
        verdicts: BTreeMap::new(),
        labels_per_dimension: BTreeMap::new(),
        timelines: BTreeMap::new(),
    };
    for dim in Dimension::ALL {
        let (metrics, timeline) = analyze_dimension(corpus, dim, config);
        let labels: BTreeSet<String> = timeline.iter().map(|p| p.label.clone()).collect();
        report.verdicts.insert(dim, metrics.verdict.to_string());
        report.dimensions.insert(dim, metrics);
        report.labels_per_dimension.insert(dim, labels.into_iter().collect());
        report.timelines.insert(dim, timeline);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::VoteMode;
    use crate::extraction::{ExtractionAttempt, ExtractionPayload, LabeledValue};
    use crate::vote::vote;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// One item per entry; each entry is the item's objective label.
    fn corpus(labels: &[String]) -> Vec<ItemConsensus> {
        labels
            .iter()
            .enumerate()
            .map(|(i, label)| {
                let id = format!("p{i}");
                let attempt = ExtractionAttempt::success(
                    &id,
                    Dimension::Objective,
                    1,
                    ExtractionPayload::SingleLabel {
                        value: LabeledValue {
                            label: label.clone(),
                            description: String::new(),
                            detail: serde_json::Value::Null,
                        },
                    },
                );
                let result = vote(&id, Dimension::Objective, VoteMode::Single, vec![attempt], |s| s.to_string());
                ItemConsensus {
                    item_id: id,
                    seq: i as u64,
                    dimensions: BTreeMap::from([(Dimension::Objective, result)]),
                }
            })
            .collect()
    }

    /// Items where label k first appears near item e^(k/2).
    fn logarithmic_corpus(items: usize) -> Vec<String> {
        let firsts: Vec<usize> = (1..=12).map(|k| (f64::from(k) * 0.5).exp().round() as usize).collect();
        (1..=items)
            .map(|x| match firsts.iter().position(|&f| f == x) {
                Some(k) => format!("label_{}", k + 1),
                None => "label_0".to_string(),
            })
            .collect()
    }

    #[test]
    fn timeline_records_first_sightings_only() {
        let labels: Vec<String> = ["a", "b", "a", "c", "b"].iter().map(|s| s.to_string()).collect();
        let timeline = build_timeline(&corpus(&labels), Dimension::Objective);
        let got: Vec<(usize, &str, usize)> = timeline
            .iter()
            .map(|p| (p.item_index, p.label.as_str(), p.cumulative))
            .collect();
        assert_eq!(got, vec![(1, "a", 1), (2, "b", 2), (4, "c", 3)]);
        assert!(build_timeline(&corpus(&labels), Dimension::Invariant).is_empty());
    }

    /// One item per entry; each entry is the item's core-constraint set.
    fn set_corpus(items: &[&[&str]]) -> Vec<ItemConsensus> {
        items
            .iter()
            .enumerate()
            .map(|(i, labels)| {
                let id = format!("p{i}");
                let attempt = ExtractionAttempt::success(
                    &id,
                    Dimension::CoreConstraints,
                    1,
                    ExtractionPayload::LabelSet {
                        labels: labels
                            .iter()
                            .map(|l| LabeledValue {
                                label: l.to_string(),
                                description: String::new(),
                                detail: serde_json::Value::Null,
                            })
                            .collect(),
                    },
                );
                let result = vote(&id, Dimension::CoreConstraints, VoteMode::Set, vec![attempt], |s| s.to_string());
                ItemConsensus {
                    item_id: id,
                    seq: i as u64,
                    dimensions: BTreeMap::from([(Dimension::CoreConstraints, result)]),
                }
            })
            .collect()
    }

    #[test]
    fn labels_from_one_item_share_its_end_of_item_count() {
        let corpus = set_corpus(&[&["a", "b", "c"], &["a"], &["d"]]);
        let timeline = build_timeline(&corpus, Dimension::CoreConstraints);
        let got: Vec<(usize, usize)> = timeline.iter().map(|p| (p.item_index, p.cumulative)).collect();
        assert_eq!(got, vec![(1, 3), (1, 3), (1, 3), (3, 4)]);

        let mut labels: Vec<&str> = timeline.iter().map(|p| p.label.as_str()).collect();
        labels.sort_unstable();
        assert_eq!(labels, vec!["a", "b", "c", "d"]);

        let report = analyze(&corpus, &SaturationConfig::default());
        assert!(report.to_csv().contains("core_constraints,1,3\ncore_constraints,1,3\ncore_constraints,1,3\ncore_constraints,3,4\n"));
    }

    #[test]
    fn too_few_points_is_insufficient_data() {
        let labels: Vec<String> = (0..5).map(|i| format!("l{i}")).collect();
        let (m, _) = analyze_dimension(&corpus(&labels), Dimension::Objective, &SaturationConfig::default());
        assert_eq!(m.verdict, Verdict::InsufficientData);
        assert_eq!(m.r_squared, 0.0);
        assert_eq!(m.tail_new_rate, 0.0);
        assert!(m.fit_params.is_none());
    }

    #[test]
    fn logarithmic_growth_with_quiet_tail_is_finite() {
        let labels = logarithmic_corpus(1000);
        let (m, timeline) = analyze_dimension(&corpus(&labels), Dimension::Objective, &SaturationConfig::default());
        assert_eq!(timeline.len(), 13);
        assert_eq!(m.fit_params.unwrap().model, FitModel::Logarithmic);
        assert!(m.r_squared > 0.95, "r2 = {}", m.r_squared);
        assert_eq!(m.tail_new_rate, 0.0);
        assert_eq!(m.verdict, Verdict::Finite);
    }

    #[test]
    fn fit_is_deterministic() {
        let corpus = corpus(&logarithmic_corpus(300));
        let config = SaturationConfig::default();
        let (a, _) = analyze_dimension(&corpus, Dimension::Objective, &config);
        let (b, _) = analyze_dimension(&corpus, Dimension::Objective, &config);
        assert!((a.r_squared - b.r_squared).abs() < 1e-12);
    }

    #[test]
    fn open_vocabulary_is_not_judged_finite() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut next = 0;
        let labels: Vec<String> = (0..500)
            .map(|_| {
                if rng.gen_bool(0.5) {
                    next += 1;
                }
                format!("l{next}")
            })
            .collect();
        let (m, _) = analyze_dimension(&corpus(&labels), Dimension::Objective, &SaturationConfig::default());
        assert!(m.tail_new_rate > 0.3, "tail = {}", m.tail_new_rate);
        assert!(!matches!(m.verdict, Verdict::Finite | Verdict::LikelyFinite));
    }

    #[test]
    fn singular_log_fit_falls_back() {
        // All ln(x) equal: the log normal equations are singular.
        let points: Vec<(f64, f64)> = (1..=12).map(|y| (1.0, f64::from(y))).collect();
        assert!(fit_logarithmic(&points).is_none());
        assert!(fit_linear(&points).is_none());

        let linear: Vec<(f64, f64)> = (1..=12).map(|x| (f64::from(x), 2.0 * f64::from(x) + 1.0)).collect();
        let (params, r2) = fit_linear(&linear).unwrap();
        assert!((params.a - 2.0).abs() < 1e-9);
        assert!((params.b - 1.0).abs() < 1e-9);
        assert!((r2 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn tail_rate_uses_whole_corpus_window() {
        let timeline: Vec<TimelinePoint> = [1, 2, 95, 95, 100]
            .iter()
            .enumerate()
            .map(|(i, &x)| TimelinePoint {
                item_index: x,
                label: format!("l{i}"),
                cumulative: i + 1,
            })
            .collect();
        // Items 91..=100: two distinct items introduced labels.
        assert!((tail_new_rate(&timeline, 100, 10) - 0.2).abs() < 1e-12);
        // Window larger than the corpus shrinks to the corpus.
        assert!((tail_new_rate(&timeline, 100, 1000) - 0.04).abs() < 1e-12);
        assert_eq!(tail_new_rate(&timeline, 0, 10), 0.0);
    }

    #[test]
    fn thresholds_keep_strictness_ordering() {
        let t = VerdictThresholds::default();
        assert!(t.validate().is_ok());
        assert_eq!(t.classify(0.96, 0.01), Verdict::Finite);
        assert_eq!(t.classify(0.96, 0.03), Verdict::LikelyFinite);
        assert_eq!(t.classify(0.91, 0.10), Verdict::UncertainConvergent);
        assert_eq!(t.classify(0.50, 0.00), Verdict::Uncertain);

        let bad = VerdictThresholds {
            likely_r_squared: 0.99,
            ..t
        };
        assert!(bad.validate().is_err());
        let bad_tail = VerdictThresholds {
            finite_tail_rate: 0.10,
            ..t
        };
        assert!(bad_tail.validate().is_err());
    }

    #[test]
    fn report_lists_labels_and_csv() {
        let labels: Vec<String> = ["b", "a", "b"].iter().map(|s| s.to_string()).collect();
        let report = analyze(&corpus(&labels), &SaturationConfig::default());
        assert_eq!(report.labels_per_dimension[&Dimension::Objective], vec!["a", "b"]);
        assert_eq!(report.verdicts[&Dimension::Objective], "INSUFFICIENT_DATA");
        let csv = report.to_csv();
        assert!(csv.starts_with("dimension,item_index,cumulative_labels\n"));
        assert!(csv.contains("objective,1,1\nobjective,2,2\n"));
        let json = serde_json::to_value(&report).unwrap();
        assert!(json["dimensions"]["objective"]["r_squared"].is_number());
        assert!(json.get("timelines").is_none());
    }
}
