//! Query decomposer — turns free-form input into a typed plan.
//!
//! The system prompt is assembled once per process from constant
//! sections plus the registry's stable skills description, so every
//! decomposition call within a session shares a byte-identical prefix
//! and the LM can reuse its prefix cache.  Only the trailing context
//! and query vary per request.

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::{
    extract_fenced_json, strip_reasoning_spans, ChatMessage, ChatOptions, LmClient, RetryPolicy,
};
use crate::plan::store::PlanStore;
use crate::plan::{clamp_field, is_reserved_skill, DraftStep, PlanDraft};
use crate::skills::SkillRegistry;

/// Upper bound on rationale / sub-query length, in characters.
pub const MAX_FIELD_LEN: usize = 1000;

const PREAMBLE: &str = "You are a Query Decomposition Agent specialized in analyzing user queries and creating step-by-step plans.

Your task is to determine if the query requires multiple skills or can be handled by a single skill.

<Available Skills>

";

const RESERVED_BLOCK: &str = "

IMPORTANT: These are the ONLY skills available. You CANNOT use any other skills not listed here.
If a query requires capabilities beyond these skills, you MUST use the \"none\" skill.

Additional skills:
- chitchat: For casual conversation, greetings, small talk
- final_response: For directly responding to the user (used as the final step)
- none: Use when query cannot be fulfilled with available skills

</Available Skills>

";

const INSTRUCTIONS_AND_FORMAT: &str = "<Instructions>

1. Analyze Query Complexity:
   - ATOMIC queries: require only 1 skill (e.g., \"book a meeting\" or \"generate ideas\")
   - COMPLEX queries: require 2+ skills (e.g., \"book time and generate ideas\")

2. For ATOMIC Queries:
   - Set \"multi_steps\" to false
   - Identify the primary skill needed
   - If it's a simple greeting or question, use \"final_response\"

3. For COMPLEX Queries:
   - Set \"multi_steps\" to true
   - Decompose into atomic steps
   - Each step uses EXACTLY ONE skill
   - Order steps logically
   - Last step should typically be \"final_response\" if needed for synthesis

</Instructions>

<Output Format>

Respond with ONLY valid JSON in this format:

{
  \"multi_steps\": true/false,
  \"output_steps\": [
    {
      \"step_nr\": 1,
      \"skill_name\": \"skill-name-here\",
      \"rationale\": \"why this skill is used\",
      \"sub_query\": \"specific query for this step\"
    }
  ]
}

</Output Format>

";

const EXAMPLES: &str = "<Examples>

Example 1 - Greeting:
User: \"hello, so what can you do?\"
Response:
{
  \"multi_steps\": false,
  \"output_steps\": [
    {
      \"step_nr\": 1,
      \"skill_name\": \"final_response\",
      \"rationale\": \"Simple greeting, no skills needed\",
      \"sub_query\": \"hello, so what can you do?\"
    }
  ]
}

Example 2 - Atomic (single skill):
User: \"schedule a meeting tomorrow at 2pm\"
Response:
{
  \"multi_steps\": false,
  \"output_steps\": [
    {
      \"step_nr\": 1,
      \"skill_name\": \"calendar-assistant\",
      \"rationale\": \"User wants to book a calendar event\",
      \"sub_query\": \"schedule a meeting tomorrow at 2pm\"
    }
  ]
}

Example 3 - Complex (multiple skills):
User: \"book myself for 1 hour tomorrow for creative work. Generate some ideas for me to start with\"
Response:
{
  \"multi_steps\": true,
  \"output_steps\": [
    {
      \"step_nr\": 1,
      \"skill_name\": \"calendar-assistant\",
      \"rationale\": \"First book the time slot for creative work\",
      \"sub_query\": \"book 1 hour tomorrow for creative work\"
    },
    {
      \"step_nr\": 2,
      \"skill_name\": \"nvidia-ideagen\",
      \"rationale\": \"Generate creative ideas to help user get started\",
      \"sub_query\": \"Generate ideas for creative work\"
    },
    {
      \"step_nr\": 3,
      \"skill_name\": \"final_response\",
      \"rationale\": \"Combine results from both skills\",
      \"sub_query\": \"Summarize booked time and generated ideas\"
    }
  ]
}

</Examples>

";

/// Decomposer bound to one LM client and one registry snapshot.
pub struct Decomposer {
    lm: Arc<dyn LmClient>,
    retry: RetryPolicy,
    /// Prompt sections (1)–(5): byte-identical for the process lifetime.
    constant_prefix: String,
    valid_skills: HashSet<String>,
}

impl Decomposer {
    pub fn new(
        lm: Arc<dyn LmClient>,
        registry: &SkillRegistry,
        user_groups: Option<&[String]>,
    ) -> Self {
        Self::with_retry(lm, registry, user_groups, RetryPolicy::default())
    }

    pub fn with_retry(
        lm: Arc<dyn LmClient>,
        registry: &SkillRegistry,
        user_groups: Option<&[String]>,
        retry: RetryPolicy,
    ) -> Self {
        let mut constant_prefix = String::new();
        constant_prefix.push_str(PREAMBLE);
        constant_prefix.push_str(&registry.skills_description(user_groups));
        constant_prefix.push_str(RESERVED_BLOCK);
        constant_prefix.push_str(INSTRUCTIONS_AND_FORMAT);
        constant_prefix.push_str(EXAMPLES);

        let valid_skills = registry
            .list_skills(user_groups)
            .into_iter()
            .map(|s| s.name.clone())
            .collect();

        Self { lm, retry, constant_prefix, valid_skills }
    }

    /// The constant prompt prefix (sections 1–5).
    pub fn constant_prompt(&self) -> &str {
        &self.constant_prefix
    }

    /// Full system prompt for one request: constant prefix + context
    /// section + query.  Byte-identical across iterations of a single
    /// request.
    pub fn request_prompt(&self, memory: &str, history: &str, user_input: &str) -> String {
        format!(
            "{}<Context>\n{memory}{history}\n</Context>\n\nNow analyze this query:\n{user_input}",
            self.constant_prefix
        )
    }

    /// Decompose `user_input` and persist the resulting plan.
    ///
    /// Returns the validated draft and the `plan_id` the store assigned.
    /// LM transport failures (after retries) propagate; malformed LM
    /// output degrades to the synthetic single-step fallback.
    pub async fn decompose(
        &self,
        store: &PlanStore,
        user_input: &str,
        memory: &str,
        history: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<(PlanDraft, String)> {
        let draft = if user_input.trim().is_empty() {
            PlanDraft::single("none", "empty query", "")
        } else {
            let system = self.request_prompt(memory, history, user_input);
            let messages = vec![
                ChatMessage::new("system", system),
                ChatMessage::new("user", user_input),
            ];
            let options = ChatOptions::with_cancel(cancel.clone());
            let reply = self.retry.chat(self.lm.as_ref(), &messages, &options).await?;

            match self.parse_and_validate(&reply.content, user_input) {
                Ok(draft) => draft,
                Err(reason) => {
                    warn!(reason = %reason, raw = %reply.content, "decomposition output rejected");
                    Self::fallback(user_input)
                }
            }
        };

        let context: Vec<(String, String)> = [
            ("memory_summary", memory),
            ("history_summary", history),
        ]
        .into_iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| (k.to_string(), v.chars().take(200).collect()))
        .collect();

        let plan_id = store
            .create(
                user_input,
                &draft,
                if context.is_empty() { None } else { Some(context.as_slice()) },
            )
            .await?;

        debug!(
            plan_id = %plan_id,
            steps = draft.output_steps.len(),
            multi = draft.multi_steps,
            "query decomposed"
        );
        Ok((draft, plan_id))
    }

    /// Parse the LM reply into a [`PlanDraft`] and enforce the output
    /// contract.  The `Err` carries a human-readable rejection reason.
    pub fn parse_and_validate(&self, raw: &str, _user_input: &str) -> Result<PlanDraft, String> {
        let cleaned = extract_fenced_json(&strip_reasoning_spans(raw));
        let parsed: PlanDraft = serde_json::from_str(&cleaned)
            .map_err(|e| format!("invalid JSON: {e}"))?;

        if parsed.output_steps.is_empty() {
            return Err("no output_steps".to_string());
        }
        for (i, step) in parsed.output_steps.iter().enumerate() {
            let expected = (i + 1) as u32;
            if step.step_nr != expected {
                return Err(format!(
                    "step numbers not contiguous: expected {expected}, got {}",
                    step.step_nr
                ));
            }
            if !is_reserved_skill(&step.skill_name)
                && !self.valid_skills.contains(&step.skill_name)
            {
                return Err(format!("unknown skill name '{}'", step.skill_name));
            }
        }

        let steps: Vec<DraftStep> = parsed
            .output_steps
            .into_iter()
            .map(|s| DraftStep {
                step_nr: s.step_nr,
                skill_name: s.skill_name,
                rationale: clamp_field(&s.rationale, MAX_FIELD_LEN),
                sub_query: clamp_field(&s.sub_query, MAX_FIELD_LEN),
            })
            .collect();

        Ok(PlanDraft { multi_steps: steps.len() > 1, output_steps: steps })
    }

    /// Synthetic single-step plan used when the LM output is unusable.
    pub fn fallback(user_input: &str) -> PlanDraft {
        PlanDraft::single("final_response", "parse error", user_input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::models::{ChatMetadata, ChatReply};

    struct StaticLm(String);

    #[async_trait]
    impl LmClient for StaticLm {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _options: &ChatOptions,
        ) -> anyhow::Result<ChatReply> {
            Ok(ChatReply { content: self.0.clone(), metadata: ChatMetadata::default() })
        }
    }

    fn decomposer(reply: &str) -> Decomposer {
        Decomposer::new(Arc::new(StaticLm(reply.to_string())), &SkillRegistry::default(), None)
    }

    #[test]
    fn constant_prompt_is_byte_stable() {
        let d = decomposer("{}");
        assert_eq!(d.constant_prompt(), d.constant_prompt());
        let one = d.request_prompt("", "", "query A");
        let two = d.request_prompt("", "", "query B");
        // Identical prefixes up to the varying query tail.
        let prefix_len = d.constant_prompt().len();
        assert_eq!(&one[..prefix_len], &two[..prefix_len]);
    }

    #[test]
    fn valid_single_step_parses() {
        let d = decomposer("");
        let raw = r#"{"multi_steps": false, "output_steps": [
            {"step_nr": 1, "skill_name": "final_response", "rationale": "greeting", "sub_query": "hello"}
        ]}"#;
        let draft = d.parse_and_validate(raw, "hello").unwrap();
        assert!(!draft.multi_steps);
        assert_eq!(draft.output_steps[0].skill_name, "final_response");
    }

    #[test]
    fn fenced_reply_with_reasoning_parses() {
        let d = decomposer("");
        let raw = "<think>how hard can it be</think>```json\n{\"multi_steps\": false, \"output_steps\": [{\"step_nr\": 1, \"skill_name\": \"none\", \"rationale\": \"r\", \"sub_query\": \"s\"}]}\n```";
        let draft = d.parse_and_validate(raw, "q").unwrap();
        assert_eq!(draft.output_steps[0].skill_name, "none");
    }

    #[test]
    fn non_contiguous_steps_rejected() {
        let d = decomposer("");
        let raw = r#"{"output_steps": [
            {"step_nr": 1, "skill_name": "none"},
            {"step_nr": 3, "skill_name": "final_response"}
        ]}"#;
        assert!(d.parse_and_validate(raw, "q").is_err());
    }

    #[test]
    fn unknown_skill_rejected() {
        let d = decomposer("");
        let raw = r#"{"output_steps": [{"step_nr": 1, "skill_name": "pizza-ordering"}]}"#;
        let err = d.parse_and_validate(raw, "q").unwrap_err();
        assert!(err.contains("pizza-ordering"));
    }

    #[test]
    fn long_fields_are_clamped() {
        let d = decomposer("");
        let raw = format!(
            r#"{{"output_steps": [{{"step_nr": 1, "skill_name": "none", "rationale": "{}", "sub_query": "s"}}]}}"#,
            "r".repeat(1500)
        );
        let draft = d.parse_and_validate(&raw, "q").unwrap();
        assert!(draft.output_steps[0].rationale.chars().count() <= MAX_FIELD_LEN + 1);
        assert!(draft.output_steps[0].rationale.ends_with('…'));
    }

    #[test]
    fn multi_steps_normalized_to_step_count() {
        let d = decomposer("");
        let raw = r#"{"multi_steps": true, "output_steps": [
            {"step_nr": 1, "skill_name": "final_response", "rationale": "r", "sub_query": "s"}
        ]}"#;
        let draft = d.parse_and_validate(raw, "q").unwrap();
        assert!(!draft.multi_steps);
    }

    #[test]
    fn fallback_shape() {
        let draft = Decomposer::fallback("order me a pizza");
        assert_eq!(draft.output_steps.len(), 1);
        assert_eq!(draft.output_steps[0].skill_name, "final_response");
        assert_eq!(draft.output_steps[0].rationale, "parse error");
        assert_eq!(draft.output_steps[0].sub_query, "order me a pizza");
    }
}
