//! Plan data model.
//!
//! A [`Plan`] is a totally ordered sequence of [`PlanStep`]s produced from
//! one user query.  Plans are persisted in an anchor-delimited flat file
//! owned by [`store::PlanStore`]; the types here double as the JSON shape
//! the decomposer parses out of the LM response.

pub mod store;

use serde::{Deserialize, Serialize};

/// Skill names handled inline by the orchestrator, never resolved
/// against the registry.
pub const RESERVED_SKILLS: [&str; 3] = ["final_response", "chitchat", "none"];

/// Returns `true` for `final_response`, `chitchat`, and `none`.
pub fn is_reserved_skill(name: &str) -> bool {
    RESERVED_SKILLS.contains(&name)
}

/// Maximum stored length of a step result, in characters of source text.
pub const MAX_RESULT_LEN: usize = 500;

/// Highest step number the three-digit step padding can represent.
pub const MAX_STEP_NR: u32 = 999;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a plan step.
///
/// Transitions form a DAG: `pending → in_progress → {completed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StepStatus {
    /// The lowercase token written into the plan file.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }

    /// Parse a plan-file status token.  Unknown tokens read as `Pending`.
    pub fn parse(s: &str) -> StepStatus {
        match s {
            "in_progress" => StepStatus::InProgress,
            "completed" => StepStatus::Completed,
            "failed" => StepStatus::Failed,
            _ => StepStatus::Pending,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Decomposer output (plan draft)
// ---------------------------------------------------------------------------

/// The JSON object the decomposer expects back from the LM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanDraft {
    #[serde(default)]
    pub multi_steps: bool,
    #[serde(default)]
    pub output_steps: Vec<DraftStep>,
}

/// One step of a [`PlanDraft`].
///
/// `tool_name` is accepted as a legacy alias for `skill_name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftStep {
    #[serde(default)]
    pub step_nr: u32,
    #[serde(alias = "tool_name")]
    pub skill_name: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub sub_query: String,
}

impl PlanDraft {
    /// Build a single-step draft bound to one skill (or reserved name).
    pub fn single(skill_name: &str, rationale: &str, sub_query: &str) -> Self {
        PlanDraft {
            multi_steps: false,
            output_steps: vec![DraftStep {
                step_nr: 1,
                skill_name: skill_name.to_string(),
                rationale: rationale.to_string(),
                sub_query: sub_query.to_string(),
            }],
        }
    }
}

// ---------------------------------------------------------------------------
// Parsed plan (read back from the store)
// ---------------------------------------------------------------------------

/// A fully parsed plan block.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub plan_id: String,
    /// Zero-padded six-digit serial.
    pub plan_number: String,
    pub timestamp: String,
    pub multi_steps: bool,
    pub total_steps: usize,
    pub user_query: String,
    /// Free-form key/value context anchors (keys as stored, uppercased).
    pub context: Vec<(String, String)>,
    pub steps: Vec<PlanStep>,
}

/// One parsed step of a [`Plan`].
#[derive(Debug, Clone, Serialize)]
pub struct PlanStep {
    pub step_nr: u32,
    pub skill_name: String,
    pub rationale: String,
    pub sub_query: String,
    pub status: StepStatus,
    pub result: String,
}

/// Header-level metadata of a plan, as returned by `PlanStore::list`.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub plan_number: String,
    pub plan_id: String,
    pub timestamp: String,
    pub query: String,
    pub multi_steps: bool,
    pub total_steps: usize,
}

// ---------------------------------------------------------------------------
// Anchor value sanitizing
// ---------------------------------------------------------------------------

/// Make a value safe to embed between `@` anchors: the reserved `@`
/// becomes `(at)` and line breaks collapse to spaces.  The substitution
/// is one-way; readers never reverse it.
pub fn sanitize_anchor_value(s: &str) -> String {
    s.replace('@', "(at)")
        .replace("\r\n", " ")
        .replace(['\n', '\r'], " ")
}

/// Sanitize and clamp a step result to [`MAX_RESULT_LEN`] characters,
/// appending `…` when trimmed.
pub fn clamp_result(s: &str) -> String {
    let sanitized = sanitize_anchor_value(s);
    if sanitized.chars().count() <= MAX_RESULT_LEN {
        sanitized
    } else {
        let cut: String = sanitized.chars().take(MAX_RESULT_LEN).collect();
        format!("{cut}…")
    }
}

/// Sanitize and clamp a rationale / sub-query to `max` characters.
pub fn clamp_field(s: &str, max: usize) -> String {
    let sanitized = sanitize_anchor_value(s);
    if sanitized.chars().count() <= max {
        sanitized
    } else {
        let cut: String = sanitized.chars().take(max).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for s in [
            StepStatus::Pending,
            StepStatus::InProgress,
            StepStatus::Completed,
            StepStatus::Failed,
        ] {
            assert_eq!(StepStatus::parse(s.as_str()), s);
        }
    }

    #[test]
    fn unknown_status_reads_as_pending() {
        assert_eq!(StepStatus::parse("garbage"), StepStatus::Pending);
    }

    #[test]
    fn sanitize_replaces_at_and_newlines() {
        let out = sanitize_anchor_value("a@b\nc\r\nd");
        assert_eq!(out, "a(at)b c d");
        assert!(!out.contains('@'));
    }

    #[test]
    fn clamp_result_bounds_length_and_stays_at_free() {
        let long = "x@".repeat(600);
        let out = clamp_result(&long);
        assert!(out.chars().count() <= MAX_RESULT_LEN + 1);
        assert!(out.ends_with('…'));
        assert!(!out.contains('@'));
    }

    #[test]
    fn draft_step_accepts_tool_name_alias() {
        let step: DraftStep =
            serde_json::from_str(r#"{"step_nr":1,"tool_name":"calendar-assistant"}"#).unwrap();
        assert_eq!(step.skill_name, "calendar-assistant");
    }

    #[test]
    fn reserved_names_detected() {
        assert!(is_reserved_skill("final_response"));
        assert!(is_reserved_skill("chitchat"));
        assert!(is_reserved_skill("none"));
        assert!(!is_reserved_skill("calendar-assistant"));
    }
}
