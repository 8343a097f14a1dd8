//! Prompt templates for schema extraction and label normalization.
//!
//! Templates are plain strings with `{placeholder}` slots. Rendering escapes
//! problem text so it cannot break out of the XML-ish sections.

use crate::dimension::Dimension;
use crate::gateway::Message;
use crate::problem::Problem;

/// Rendered prompt ready for LLM.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: String,
    /// blake3 of the template revision that produced this prompt.
    pub template_hash: String,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// Escape XML special characters to prevent prompt injection via tag breaking.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// A prompt template with placeholders.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    /// Stable hash of the template text; changes whenever the wording does.
    pub fn hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for part in [self.slug, self.system, self.user] {
            hasher.update(part.as_bytes());
            hasher.update(&[0x1f]);
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Substitute `{key}` slots. Values are escaped; unknown slots stay as-is.
    pub fn render(&self, vars: &[(&str, &str)]) -> PromptInstance {
        let escaped: Vec<(&str, String)> = vars
            .iter()
            .map(|&(key, value)| (key, escape_xml_chars(value.trim())))
            .collect();
        self.fill(&escaped)
    }

    fn fill(&self, vars: &[(&str, String)]) -> PromptInstance {
        PromptInstance {
            template_slug: self.slug.to_string(),
            template_hash: self.hash(),
            system: substitute(self.system, vars).trim().to_string(),
            user: substitute(self.user, vars).trim().to_string(),
        }
    }
}

/// Single left-to-right pass: substituted text is never scanned again, so a
/// value containing `{slot}` stays literal.
fn substitute(text: &str, vars: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open + 1..];
        let slot = tail.find('}').map(|close| &tail[..close]);
        match slot.and_then(|key| vars.iter().find(|(k, _)| *k == key)) {
            Some((key, value)) => {
                out.push_str(value);
                rest = &tail[key.len() + 1..];
            }
            None => {
                out.push('{');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

const PROBLEM_BLOCK: &str = r#"<title>{title}</title>
<description>
{description}
</description>
<input_format>
{input}
</input_format>
<output_format>
{output}
</output_format>
<constraints>
{constraints}
</constraints>"#;

const ABSTRACTION_RULES: &str = "All values must be abstract algorithm/data-structure vocabulary. \
Never reuse story words from the statement (people, animals, cities, items). Label names are \
lowercase English with underscores, e.g. weighted_undirected_graph, prefix_sum.";

pub const INPUT_STRUCTURE_V1: PromptTemplate = PromptTemplate {
    slug: "input_structure_v1",
    system: r#"You analyse the input structure of competitive-programming problems.

Extract how the input data is organised: its data type (array, graph, tree, string, matrix...), size range, value range and structural properties (ordered, connected, weighted, directed...). If the problem has several inputs, describe the dominant one.

Output a single strict JSON object and nothing else:
{"type": "...", "length": {"min": 1, "max": 100000}, "value_range": {"min": 0, "max": 1000000000}, "properties": {"ordered": false}}

Properties you had to infer rather than read are marked with "inferred": true."#,
    user: r#"Describe the input structure of this problem.

{problem}

{rules}"#,
};

pub const CONSTRAINTS_V1: PromptTemplate = PromptTemplate {
    slug: "core_constraints_v1",
    system: r#"You analyse the core constraints of competitive-programming problems.

A core constraint is a structural restriction that shapes the solution (distinct elements, bounded sum, connectivity, no repeated vertices...). Plain size bounds are not core constraints unless they force the algorithm.

Output a single strict JSON object and nothing else:
{"constraints": [{"name": "...", "description": "...", "formal": "..."}]}

Return an empty array when the problem has no core constraint."#,
    user: r#"List the core constraints of this problem.

{problem}

{rules}"#,
};

pub const OBJECTIVE_V1: PromptTemplate = PromptTemplate {
    slug: "objective_v1",
    system: r#"You analyse the optimisation or decision objective of competitive-programming problems.

Name what the output asks for: maximise a value, minimise a cost, count configurations modulo a prime, decide feasibility, construct an object, answer queries...

Output a single strict JSON object and nothing else:
{"type": "...", "description": "..."}"#,
    user: r#"State the objective of this problem.

{problem}

{rules}"#,
};

pub const INVARIANT_V1: PromptTemplate = PromptTemplate {
    slug: "invariant_v1",
    system: r#"You analyse the algorithmic invariants that make competitive-programming problems solvable.

An invariant is a property preserved by the intended solution (monotonicity, optimal substructure, exchange argument, parity, conservation...). List every key invariant, most important first.

Output a single strict JSON object and nothing else:
{"invariants": [{"name": "...", "description": "...", "properties": {}}]}"#,
    user: r#"List the key invariants of this problem.

{problem}

{rules}"#,
};

pub const NORMALIZE_V1: PromptTemplate = PromptTemplate {
    slug: "normalize_v1",
    system: r#"You normalise raw classification labels onto an existing label vocabulary.

Rules:
1. If a raw label means the same as an existing label, or is a synonym of it, map it to that label.
2. Only create a new label when no existing label covers the meaning.
3. Canonical names are lowercase English with underscores (prefix_sum, binary_tree).
4. Labels carrying story words from a problem statement must be mapped to, or re-minted as, abstract algorithmic concepts ("road_network" -> "weighted_graph").
5. Output strict JSON only, with exactly one mapping per raw label:
{"mappings": [{"original": "...", "normalized": "...", "is_new": false}], "new_labels": [{"name": "...", "description": "..."}]}"#,
    user: r#"Dimension: {dimension}

Existing labels:
<registry>
{registry}
</registry>

Raw labels to normalise:
<raw_labels>
{raw_labels}
</raw_labels>"#,
};

pub fn extraction_template(dimension: Dimension) -> PromptTemplate {
    match dimension {
        Dimension::InputStructure => INPUT_STRUCTURE_V1,
        Dimension::CoreConstraints => CONSTRAINTS_V1,
        Dimension::Objective => OBJECTIVE_V1,
        Dimension::Invariant => INVARIANT_V1,
    }
}

/// Build the extraction prompt for one problem and dimension.
pub fn extraction_prompt(dimension: Dimension, problem: &Problem) -> PromptInstance {
    let field = |text: &str| escape_xml_chars(text.trim());
    let block = substitute(
        PROBLEM_BLOCK,
        &[
            ("title", field(&problem.title)),
            ("description", field(&problem.description)),
            ("input", field(&problem.input)),
            ("output", field(&problem.output)),
            ("constraints", field(&problem.constraints)),
        ],
    );
    extraction_template(dimension).fill(&[
        ("rules", escape_xml_chars(ABSTRACTION_RULES)),
        ("problem", block),
    ])
}

/// Build the semantic-merge prompt for one dimension.
pub fn normalize_prompt(dimension: Dimension, registry_text: &str, raw_labels: &[String]) -> PromptInstance {
    let labels = if raw_labels.is_empty() {
        "(none)".to_string()
    } else {
        raw_labels
            .iter()
            .map(|l| format!("- {l}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    NORMALIZE_V1.render(&[
        ("dimension", dimension.display_name()),
        ("registry", registry_text),
        ("raw_labels", &labels),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem() -> Problem {
        Problem {
            id: "p1".into(),
            source: String::new(),
            title: "Sum <of> pairs".into(),
            description: "Given n numbers".into(),
            input: "n then a_i".into(),
            output: "one integer".into(),
            constraints: "1 <= n <= 1e5".into(),
        }
    }

    #[test]
    fn extraction_prompt_embeds_escaped_problem() {
        let prompt = extraction_prompt(Dimension::InputStructure, &problem());
        assert!(prompt.user.contains("<title>Sum &lt;of&gt; pairs</title>"));
        assert!(prompt.user.contains("1 &lt;= n &lt;= 1e5"));
        assert!(!prompt.user.contains("{problem}"));
        assert!(!prompt.user.contains("{rules}"));
        assert_eq!(prompt.template_slug, "input_structure_v1");
    }

    #[test]
    fn slot_names_inside_problem_text_stay_literal() {
        let mut p = problem();
        p.description = "Print {constraints} and {rules} verbatim.".into();
        p.constraints = "n <= 10".into();
        let prompt = extraction_prompt(Dimension::Objective, &p);
        assert!(prompt.user.contains("<description>\nPrint {constraints} and {rules} verbatim.\n</description>"));
        assert_eq!(prompt.user.matches("n &lt;= 10").count(), 1);
        assert!(!prompt.user.contains("{problem}"));
        // JSON examples in the system text are not slots.
        assert!(INPUT_STRUCTURE_V1.render(&[]).system.contains(r#"{"type": "...""#));
    }

    #[test]
    fn template_hashes_differ_per_dimension_and_are_stable() {
        let a = extraction_template(Dimension::Objective).hash();
        assert_eq!(a, OBJECTIVE_V1.hash());
        assert_ne!(a, extraction_template(Dimension::Invariant).hash());
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn normalize_prompt_lists_raw_labels() {
        let prompt = normalize_prompt(
            Dimension::InputStructure,
            "- array: sequence",
            &["sorted_array".to_string(), "grid".to_string()],
        );
        assert!(prompt.user.contains("- sorted_array\n- grid"));
        assert!(prompt.user.contains("Input Structure"));
        assert_eq!(prompt.to_messages().len(), 2);
    }
}
