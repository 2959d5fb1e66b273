//! Judge prompt templates.
//!
//! Each rubric pairs an instruction template with the score object it asks the judge for.
//! Rendering is plain substitution of the trimmed reference and candidate texts.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

const REFERENCE_SLOT: &str = "{reference}";
const CANDIDATE_SLOT: &str = "{candidate}";

const COARSE_TEMPLATE: &str = r#"You are a strict evaluator.
Compare the CANDIDATE answer to the REFERENCE answer.

Return ONLY a JSON object with numeric scores 0-10 (no prose, no code fences):
{"correctness": 0-10, "relevance": 0-10, "fluency": 0-10, "overall": 0-10}

REFERENCE:
{reference}

CANDIDATE:
{candidate}
"#;

const GUIDED_TEMPLATE: &str = r#"You are a strict evaluator.
Compare the CANDIDATE answer to the REFERENCE answer and assign numeric scores from 1 to 5 for each metric.

Return ONLY a JSON object in this exact format (no explanations, no text, no code fences):
{"correctness": 1-5, "relevance": 1-5, "fluency": 1-5, "overall": 1-5}

REFERENCE:
{reference}

CANDIDATE:
{candidate}

SCORING CRITERIA:

1. CORRECTNESS (1-5)
How factually and semantically accurate the candidate answer is compared to the reference.
- 1 = Completely incorrect or contradicts the reference.
- 2 = Mostly incorrect; misses key facts or introduces major errors.
- 3 = Partially correct; captures some ideas but with notable omissions or inaccuracies.
- 4 = Mostly correct; small factual or interpretive errors.
- 5 = Fully correct; meaning and facts align with the reference.

2. RELEVANCE (1-5)
How focused the candidate answer is on the same content and intent as the reference.
- 1 = Entirely off-topic or irrelevant.
- 2 = Minimally relevant; large portions of unrelated content.
- 3 = Partially relevant; covers some aspects but misses key focus points.
- 4 = Mostly relevant; minor digressions.
- 5 = Fully relevant; directly matches the purpose and content of the reference.

3. FLUENCY (1-5)
How clear, grammatical, and natural the candidate answer is.
- 1 = Unreadable or incoherent.
- 2 = Poorly written; many grammatical or structural issues.
- 3 = Understandable but awkward phrasing or flow.
- 4 = Clear and readable; minor issues only.
- 5 = Highly fluent and well-structured.

4. OVERALL (1-5)
- overall = round(0.5*correctness + 0.3*relevance + 0.2*fluency)
- If correctness = 1 or relevance = 1, set overall = 1.

INSTRUCTIONS:
1. Read REFERENCE and CANDIDATE carefully.
2. Score each metric (1-5) according to the rubric above.
3. Compute overall using the given formula.
4. Return ONLY the JSON object, with no commentary and no extra text.
"#;

const SIX_DIMENSION_TEMPLATE: &str = r#"You are a strict evaluator.
Compare the CANDIDATE answer to the REFERENCE answer and assign numeric scores from 1 to 5 for each of the following metrics:
correctness, relevance, proficiency, helpfulness, level_of_detail, and creativity.

Return ONLY a JSON object in this exact format (no explanations, no text, no code fences):
{"correctness": 1-5, "relevance": 1-5, "proficiency": 1-5, "helpfulness": 1-5, "level_of_detail": 1-5, "creativity": 1-5, "overall": 1-5}

REFERENCE:
{reference}

CANDIDATE:
{candidate}

SCORING CRITERIA:

1. CORRECTNESS (1-5): factual and semantic accuracy against the reference.
   1 = contradicts the reference, 3 = partially correct, 5 = fully correct.
2. RELEVANCE (1-5): alignment with the topic, intent, and context of the reference.
   1 = off-topic, 3 = partially focused, 5 = directly aligned.
3. PROFICIENCY (1-5): skill and technical accuracy of language and content.
   1 = major misunderstanding or grammatical issues, 3 = adequate, 5 = expert-level clarity.
4. HELPFULNESS (1-5): usefulness to a reader seeking understanding.
   1 = confusing or misleading, 3 = covers key points, 5 = clearly enhances understanding.
5. LEVEL_OF_DETAIL (1-5): comprehensiveness and specificity.
   1 = vague or superficial, 3 = moderately detailed, 5 = thorough.
6. CREATIVITY (1-5): originality and insight where relevant.
   1 = mechanical, 3 = some creative framing, 5 = unique and thoughtful.

7. OVERALL (1-5)
- overall = round(0.3*correctness + 0.2*relevance + 0.15*proficiency + 0.15*helpfulness + 0.1*level_of_detail + 0.1*creativity)
- If correctness = 1 or relevance = 1, overall = 1.

INSTRUCTIONS:
1. Read REFERENCE and CANDIDATE carefully.
2. Assign scores (1-5) per metric.
3. Compute overall using the formula.
4. Return ONLY the JSON object above, with no commentary and no code fences.
"#;

/// Rubric variants, each fixing the score dimensions the judge must return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Rubric {
    /// correctness/relevance/fluency on 0-10
    Coarse,
    /// correctness/relevance/fluency on 1-5 with written criteria
    Guided,
    /// six dimensions on 1-5
    SixDimension,
}

impl Rubric {
    pub fn template(&self) -> &'static str {
        match self {
            Rubric::Coarse => COARSE_TEMPLATE,
            Rubric::Guided => GUIDED_TEMPLATE,
            Rubric::SixDimension => SIX_DIMENSION_TEMPLATE,
        }
    }

    /// Base dimensions, excluding `overall`
    pub fn dimensions(&self) -> &'static [&'static str] {
        match self {
            Rubric::Coarse | Rubric::Guided => &["correctness", "relevance", "fluency"],
            Rubric::SixDimension => &[
                "correctness",
                "relevance",
                "proficiency",
                "helpfulness",
                "level_of_detail",
                "creativity",
            ],
        }
    }

    /// Keys that must be present for a judge reply to count as parsed
    pub fn expected_keys(&self) -> &'static [&'static str] {
        self.dimensions()
    }

    /// Upper bound of the rubric's native score range
    pub fn scale_max(&self) -> f64 {
        match self {
            Rubric::Coarse => 10.0,
            Rubric::Guided | Rubric::SixDimension => 5.0,
        }
    }

    /// Whether a floor score on correctness or relevance forces overall to 1
    pub fn forces_floor_overall(&self) -> bool {
        match self {
            Rubric::Coarse => false,
            Rubric::Guided | Rubric::SixDimension => true,
        }
    }

    pub fn render(&self, reference: &str, candidate: &str) -> String {
        render(self.template(), reference, candidate)
    }
}

/// Fill `{reference}` and `{candidate}` in `template` with the trimmed inputs.
///
/// Substitution is single-pass: placeholder text inside the inputs is never expanded.
pub fn render(template: &str, reference: &str, candidate: &str) -> String {
    let reference = reference.trim();
    let candidate = candidate.trim();
    let mut out = String::with_capacity(template.len() + reference.len() + candidate.len());
    let mut rest = template;

    loop {
        let next_ref = rest.find(REFERENCE_SLOT);
        let next_cand = rest.find(CANDIDATE_SLOT);
        let (pos, slot, value) = match (next_ref, next_cand) {
            (Some(r), Some(c)) if r < c => (r, REFERENCE_SLOT, reference),
            (Some(_), Some(c)) => (c, CANDIDATE_SLOT, candidate),
            (Some(r), None) => (r, REFERENCE_SLOT, reference),
            (None, Some(c)) => (c, CANDIDATE_SLOT, candidate),
            (None, None) => break,
        };
        out.push_str(&rest[..pos]);
        out.push_str(value);
        rest = &rest[pos + slot.len()..];
    }

    out.push_str(rest);
    out
}

/// Single-digit prompt used to probe one dimension's score distribution
pub fn dimension_probe(dimension: &str, reference: &str, candidate: &str) -> String {
    format!(
        "\nGiven the following context, assign a score from 1 to 5 for **{dimension}**.\nREFERENCE: {}\nCANDIDATE: {}\nRespond ONLY with a single number from 1 to 5.\n",
        reference.trim(),
        candidate.trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_trims_inputs() {
        let prompt = Rubric::Coarse.render("  Paris is the capital.\n", "\tParis. ");
        assert!(prompt.contains("REFERENCE:\nParis is the capital.\n"));
        assert!(prompt.contains("CANDIDATE:\nParis.\n"));
        assert!(!prompt.contains(REFERENCE_SLOT));
        assert!(!prompt.contains(CANDIDATE_SLOT));
    }

    #[test]
    fn test_render_does_not_expand_placeholders_in_inputs() {
        let prompt = render("R={reference} C={candidate}", "{candidate}", "cand");
        assert_eq!(prompt, "R={candidate} C=cand");
    }

    #[test]
    fn test_render_keeps_literal_json_braces() {
        let prompt = Rubric::Guided.render("ref", "cand");
        assert!(prompt.contains(r#"{"correctness": 1-5, "relevance": 1-5, "fluency": 1-5, "overall": 1-5}"#));
    }

    #[test]
    fn test_rubric_shapes() {
        assert_eq!(Rubric::Coarse.dimensions().len(), 3);
        assert_eq!(Rubric::SixDimension.dimensions().len(), 6);
        assert!(!Rubric::Guided.expected_keys().contains(&"overall"));
        assert_eq!(Rubric::Coarse.scale_max(), 10.0);
        assert_eq!(Rubric::Guided.scale_max(), 5.0);
        assert!(!Rubric::Coarse.forces_floor_overall());
        assert!(Rubric::SixDimension.forces_floor_overall());
    }

    #[test]
    fn test_every_template_mentions_its_dimensions() {
        for rubric in [Rubric::Coarse, Rubric::Guided, Rubric::SixDimension] {
            let prompt = rubric.render("r", "c");
            for key in rubric.dimensions() {
                assert!(prompt.contains(&format!("\"{key}\"")), "{rubric:?} missing {key}");
            }
        }
    }

    #[test]
    fn test_dimension_probe() {
        let probe = dimension_probe("helpfulness", " ref ", "cand");
        assert!(probe.contains("**helpfulness**"));
        assert!(probe.contains("REFERENCE: ref\n"));
    }
}
